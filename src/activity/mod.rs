// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The activity vocabulary of the federation plane.
//!
//! Activities are immutable, addressable JSON documents exchanged between
//! services. The nine supported type tags form a closed set; everything an
//! activity points at (its `object`, `target` and `result`) is a single
//! polymorphic [`Object`] so one parser and one dispatcher cover the whole
//! vocabulary.

mod object;

pub use object::{Collection, Object};

use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// JSON-LD context for plain ActivityStreams vocabulary.
pub const CONTEXT_ACTIVITY_STREAMS: &str = "https://www.w3.org/ns/activitystreams";
/// JSON-LD context for the anchor-credential dialect.
pub const CONTEXT_ACTIVITY_ANCHORS: &str = "https://w3id.org/activityanchors/v1";

/// Collaborator role IRI a witness offer is targeted at.
pub const TARGET_ANCHOR_WITNESS: &str = "https://w3id.org/activityanchors#AnchorWitness";

/// The closed set of activity type tags understood by the core.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum ActivityType {
    Create,
    Follow,
    Accept,
    Reject,
    Announce,
    Offer,
    Like,
    Undo,
    InviteWitness,
}

/// A typed, addressable message in the federation plane.
///
/// The `id` is absent only while the activity is being assembled locally; the
/// outbox stamps a fresh id before anything leaves the node, and the inbox
/// rejects inbound activities without one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(
        rename = "@context",
        with = "one_or_many",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    context: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Url>,

    #[serde(rename = "type", with = "one_or_many")]
    types: Vec<ActivityType>,

    actor: Url,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    published: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    object: Option<Object>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<Object>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Object>,

    #[serde(
        with = "one_or_many",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    to: Vec<Url>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_time: Option<DateTime<Utc>>,
}

impl Activity {
    /// Starts a new locally authored activity. The id is left for the outbox
    /// to stamp; `published` is set to the current time.
    pub fn new(kind: ActivityType, actor: Url) -> Self {
        Activity {
            context: vec![CONTEXT_ACTIVITY_STREAMS.to_string()],
            id: None,
            types: vec![kind],
            actor,
            published: Some(Utc::now()),
            object: None,
            target: None,
            result: None,
            to: Vec::new(),
            end_time: None,
        }
    }

    /// Appends the anchor-credential context. Used by activities that carry
    /// or reference anchors (Create, Announce, Offer, Like).
    pub fn with_anchor_context(mut self) -> Self {
        if !self.context.iter().any(|c| c == CONTEXT_ACTIVITY_ANCHORS) {
            self.context.push(CONTEXT_ACTIVITY_ANCHORS.to_string());
        }
        self
    }

    pub fn with_id(mut self, id: Url) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_object(mut self, object: Object) -> Self {
        self.object = Some(object);
        self
    }

    pub fn with_target(mut self, target: Object) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_result(mut self, result: Object) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_to(mut self, to: Vec<Url>) -> Self {
        self.to = to;
        self
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_published(mut self, published: DateTime<Utc>) -> Self {
        self.published = Some(published);
        self
    }

    pub fn id(&self) -> Option<&Url> {
        self.id.as_ref()
    }

    /// The id, or a `BadRequest` failure for activities that must already
    /// carry one (anything read off the wire).
    pub fn require_id(&self) -> Result<&Url, Error> {
        self.id
            .as_ref()
            .ok_or_else(|| Error::bad_request("activity has no id"))
    }

    pub fn types(&self) -> &[ActivityType] {
        &self.types
    }

    pub fn has_type(&self, kind: ActivityType) -> bool {
        self.types.contains(&kind)
    }

    pub fn actor(&self) -> &Url {
        &self.actor
    }

    pub fn published(&self) -> Option<DateTime<Utc>> {
        self.published
    }

    pub fn object(&self) -> Option<&Object> {
        self.object.as_ref()
    }

    pub fn target(&self) -> Option<&Object> {
        self.target.as_ref()
    }

    pub fn result(&self) -> Option<&Object> {
        self.result.as_ref()
    }

    pub fn to(&self) -> &[Url] {
        &self.to
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// The object as an IRI, when it is one.
    pub fn object_iri(&self) -> Option<&Url> {
        match self.object() {
            Some(Object::Iri(url)) => Some(url),
            _ => None,
        }
    }

    /// The object as an embedded activity (Accept/Reject/Undo payloads).
    pub fn embedded_activity(&self) -> Option<&Activity> {
        match self.object() {
            Some(Object::Activity(inner)) => Some(inner),
            _ => None,
        }
    }

    /// The object as an embedded document (anchor payloads).
    pub fn object_document(&self) -> Option<&serde_json::Value> {
        match self.object() {
            Some(Object::Document(doc)) => Some(doc),
            _ => None,
        }
    }

    /// Parses an activity off the wire.
    pub fn from_json(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Canonical JSON form used wherever signatures cover bodies.
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// ActivityStreams allows single values where the data model has lists; this
/// collapses both wire shapes onto `Vec` and writes single-element lists back
/// as bare values.
pub(crate) mod one_or_many {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    // `Many` is tried first: element types that themselves deserialize from
    // any JSON value (opaque documents) would otherwise swallow arrays.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    pub fn serialize<T, S>(items: &[T], serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        if items.len() == 1 {
            items[0].serialize(serializer)
        } else {
            items.serialize(serializer)
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        })
    }
}
