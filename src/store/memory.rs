// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{ActivityIter, ActivityStore, Bucket, QueryCriteria, RefType, Undeliverable};
use crate::activity::Activity;
use crate::error::Error;
use crate::service::ServiceDescriptor;
use chrono::Utc;
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use std::collections::HashMap;
use url::Url;

#[derive(Default)]
struct Inner {
    inbox: IndexMap<Url, Activity>,
    outbox: IndexMap<Url, Activity>,
    actors: HashMap<Url, ServiceDescriptor>,
    references: HashMap<(RefType, Url), IndexSet<Url>>,
    undeliverable: Vec<Undeliverable>,
}

impl Inner {
    fn bucket(&self, bucket: Bucket) -> &IndexMap<Url, Activity> {
        match bucket {
            Bucket::Inbox => &self.inbox,
            Bucket::Outbox => &self.outbox,
        }
    }

    fn bucket_mut(&mut self, bucket: Bucket) -> &mut IndexMap<Url, Activity> {
        match bucket {
            Bucket::Inbox => &mut self.inbox,
            Bucket::Outbox => &mut self.outbox,
        }
    }
}

/// A thread-safe in-memory [`ActivityStore`]. Insertion order of activities
/// and reference-set members is preserved; re-putting an id keeps its
/// original position.
#[derive(Default)]
pub struct MemoryActivityStore {
    inner: RwLock<Inner>,
}

impl MemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActivityStore for MemoryActivityStore {
    fn put_activity(&self, bucket: Bucket, activity: &Activity) -> Result<(), Error> {
        let id = activity.require_id()?.clone();
        self.inner
            .write()
            .bucket_mut(bucket)
            .insert(id, activity.clone());
        Ok(())
    }

    fn get_activity(&self, bucket: Bucket, id: &Url) -> Result<Activity, Error> {
        self.inner
            .read()
            .bucket(bucket)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no activity {id} in {bucket}")))
    }

    fn activity_exists(&self, bucket: Bucket, id: &Url) -> Result<bool, Error> {
        Ok(self.inner.read().bucket(bucket).contains_key(id))
    }

    fn query_activities(
        &self,
        bucket: Bucket,
        criteria: &QueryCriteria,
    ) -> Result<ActivityIter, Error> {
        // Snapshot under the read lock; the iterator itself never blocks
        // writers.
        let matching: Vec<Activity> = self
            .inner
            .read()
            .bucket(bucket)
            .values()
            .filter(|activity| criteria.matches(activity))
            .cloned()
            .collect();
        Ok(ActivityIter::new(matching.into_iter()))
    }

    fn put_actor(&self, descriptor: &ServiceDescriptor) -> Result<(), Error> {
        self.inner
            .write()
            .actors
            .insert(descriptor.id().clone(), descriptor.clone());
        Ok(())
    }

    fn get_actor(&self, iri: &Url) -> Result<ServiceDescriptor, Error> {
        self.inner
            .read()
            .actors
            .get(iri)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no actor {iri}")))
    }

    fn add_reference(
        &self,
        ref_type: RefType,
        owner: &Url,
        target: &Url,
    ) -> Result<(), Error> {
        self.inner
            .write()
            .references
            .entry((ref_type, owner.clone()))
            .or_default()
            .insert(target.clone());
        Ok(())
    }

    fn delete_reference(
        &self,
        ref_type: RefType,
        owner: &Url,
        target: &Url,
    ) -> Result<(), Error> {
        if let Some(set) = self
            .inner
            .write()
            .references
            .get_mut(&(ref_type, owner.clone()))
        {
            set.shift_remove(target);
        }
        Ok(())
    }

    fn get_references(&self, ref_type: RefType, owner: &Url) -> Result<Vec<Url>, Error> {
        Ok(self
            .inner
            .read()
            .references
            .get(&(ref_type, owner.clone()))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn put_undeliverable(
        &self,
        activity_id: &Url,
        to_url: &Url,
        reason: &str,
    ) -> Result<(), Error> {
        self.inner.write().undeliverable.push(Undeliverable {
            activity_id: activity_id.clone(),
            to_url: to_url.clone(),
            reason: reason.to_string(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    fn undeliverables(&self) -> Result<Vec<Undeliverable>, Error> {
        Ok(self.inner.read().undeliverable.clone())
    }
}
