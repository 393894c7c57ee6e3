// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::Activity;
use serde::{Deserialize, Serialize};
use url::Url;

/// The polymorphic payload of an activity.
///
/// On the wire this is a bare IRI string, a nested activity, a collection, or
/// an embedded document; deserialization tries the most specific shape first
/// so an arbitrary document is only the fallback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Object {
    Activity(Box<Activity>),
    Collection(Collection),
    Iri(Url),
    Document(serde_json::Value),
}

impl Object {
    pub fn iri(&self) -> Option<&Url> {
        match self {
            Object::Iri(url) => Some(url),
            _ => None,
        }
    }

    pub fn document(&self) -> Option<&serde_json::Value> {
        match self {
            Object::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn collection(&self) -> Option<&Collection> {
        match self {
            Object::Collection(collection) => Some(collection),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum CollectionKind {
    Collection,
}

/// An ordered collection of objects, used by Announce to carry one or more
/// anchor references.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    #[serde(rename = "type")]
    kind: CollectionKind,
    #[serde(default)]
    total_items: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    items: Vec<Object>,
}

impl Collection {
    pub fn new(items: Vec<Object>) -> Self {
        Collection {
            kind: CollectionKind::Collection,
            total_items: items.len() as u64,
            items,
        }
    }

    pub fn items(&self) -> &[Object] {
        &self.items
    }

    pub fn total_items(&self) -> u64 {
        self.total_items
    }
}
