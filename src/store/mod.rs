// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Durable, query-capable storage for activities, actor descriptors and
//! reference sets.
//!
//! The store is the single writer of reference sets; every other component
//! requests mutations through it. All mutating operations are atomic per
//! operation: once a call returns success the record is readable by the next
//! get, including across a restart for persistent implementations.

mod memory;

pub use memory::MemoryActivityStore;

use crate::activity::{Activity, ActivityType};
use crate::error::Error;
use crate::service::ServiceDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// The two per-service activity buckets. The pair (bucket, activity id) is
/// unique; storing the same id again replaces the record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum Bucket {
    Inbox,
    Outbox,
}

/// Named reference sets maintained per local actor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum RefType {
    /// Actors following this service.
    Follower,
    /// Actors this service follows.
    Following,
    /// Actors witnessing for this service.
    Witness,
    /// Actors this service witnesses for.
    Witnessing,
    /// Objects this service has liked.
    Liked,
    /// Like activities received for this service's anchors.
    Like,
}

/// Filter for [`ActivityStore::query_activities`]. Empty criteria match
/// everything.
#[derive(Clone, Debug, Default)]
pub struct QueryCriteria {
    types: Vec<ActivityType>,
    actor: Option<Url>,
}

impl QueryCriteria {
    pub fn with_type(mut self, kind: ActivityType) -> Self {
        self.types.push(kind);
        self
    }

    pub fn with_actor(mut self, actor: Url) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn matches(&self, activity: &Activity) -> bool {
        let type_ok =
            self.types.is_empty() || self.types.iter().any(|t| activity.has_type(*t));
        let actor_ok = self
            .actor
            .as_ref()
            .is_none_or(|actor| activity.actor() == actor);
        type_ok && actor_ok
    }
}

/// A finite, forward-only iterator over stored activities in insertion order.
pub struct ActivityIter {
    inner: Box<dyn Iterator<Item = Activity> + Send>,
}

impl ActivityIter {
    pub fn new(inner: impl Iterator<Item = Activity> + Send + 'static) -> Self {
        ActivityIter {
            inner: Box::new(inner),
        }
    }
}

impl Iterator for ActivityIter {
    type Item = Activity;

    fn next(&mut self) -> Option<Activity> {
        self.inner.next()
    }
}

/// A delivery whose retry budget was exhausted, set aside for administrative
/// attention.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Undeliverable {
    pub activity_id: Url,
    pub to_url: Url,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

pub trait ActivityStore: Send + Sync {
    /// Stores an activity under (bucket, id). At most one record per pair;
    /// re-puts replace. Activities without an id are rejected.
    fn put_activity(&self, bucket: Bucket, activity: &Activity) -> Result<(), Error>;

    fn get_activity(&self, bucket: Bucket, id: &Url) -> Result<Activity, Error>;

    fn activity_exists(&self, bucket: Bucket, id: &Url) -> Result<bool, Error> {
        match self.get_activity(bucket, id) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn query_activities(
        &self,
        bucket: Bucket,
        criteria: &QueryCriteria,
    ) -> Result<ActivityIter, Error>;

    fn put_actor(&self, descriptor: &ServiceDescriptor) -> Result<(), Error>;

    fn get_actor(&self, iri: &Url) -> Result<ServiceDescriptor, Error>;

    /// Adds `target` to the named set of `owner`. Duplicates collapse;
    /// enumeration order is insertion order.
    fn add_reference(&self, ref_type: RefType, owner: &Url, target: &Url)
    -> Result<(), Error>;

    fn delete_reference(
        &self,
        ref_type: RefType,
        owner: &Url,
        target: &Url,
    ) -> Result<(), Error>;

    fn get_references(&self, ref_type: RefType, owner: &Url) -> Result<Vec<Url>, Error>;

    /// Records an exhausted delivery for later inspection.
    fn put_undeliverable(
        &self,
        activity_id: &Url,
        to_url: &Url,
        reason: &str,
    ) -> Result<(), Error>;

    fn undeliverables(&self) -> Result<Vec<Undeliverable>, Error>;
}
