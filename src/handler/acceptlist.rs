// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Administratively curated accept lists.
//!
//! Follow and witness-invitation requests are admitted against these lists.
//! An empty list admits everyone (open federation); a non-empty list is a
//! strict allow list. The manager marks transient storage failures and keeps
//! answering with retryable errors until a read succeeds again.

use crate::error::Error;
use indexmap::IndexSet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use url::Url;

/// The interaction types an accept list governs.
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
pub enum AcceptType {
    Follow,
    InviteWitness,
}

const ACCEPT_TYPES: [AcceptType; 2] = [AcceptType::Follow, AcceptType::InviteWitness];

/// Storage seam for accept lists.
pub trait AcceptListStore: Send + Sync {
    fn update(
        &self,
        accept_type: AcceptType,
        additions: &[Url],
        deletions: &[Url],
    ) -> Result<(), Error>;

    fn get(&self, accept_type: AcceptType) -> Result<Vec<Url>, Error>;
}

/// In-memory accept-list storage.
#[derive(Default)]
pub struct MemoryAcceptListStore {
    lists: RwLock<HashMap<AcceptType, IndexSet<Url>>>,
}

impl MemoryAcceptListStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AcceptListStore for MemoryAcceptListStore {
    fn update(
        &self,
        accept_type: AcceptType,
        additions: &[Url],
        deletions: &[Url],
    ) -> Result<(), Error> {
        let mut lists = self.lists.write();
        let list = lists.entry(accept_type).or_default();
        for url in additions {
            list.insert(url.clone());
        }
        for url in deletions {
            list.shift_remove(url);
        }
        Ok(())
    }

    fn get(&self, accept_type: AcceptType) -> Result<Vec<Url>, Error> {
        Ok(self
            .lists
            .read()
            .get(&accept_type)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// The administrative accept-list interface.
pub struct AcceptListManager {
    store: Arc<dyn AcceptListStore>,
    degraded: AtomicBool,
}

impl AcceptListManager {
    pub fn new(store: Arc<dyn AcceptListStore>) -> Self {
        AcceptListManager {
            store,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn update(
        &self,
        accept_type: AcceptType,
        additions: &[Url],
        deletions: &[Url],
    ) -> Result<(), Error> {
        self.track(self.store.update(accept_type, additions, deletions))
    }

    pub fn get(&self, accept_type: AcceptType) -> Result<Vec<Url>, Error> {
        self.track(self.store.get(accept_type))
    }

    pub fn get_all(&self) -> Result<Vec<(AcceptType, Vec<Url>)>, Error> {
        ACCEPT_TYPES
            .iter()
            .map(|accept_type| Ok((*accept_type, self.get(*accept_type)?)))
            .collect()
    }

    /// Whether `actor` is admitted for `accept_type`. An empty list admits
    /// everyone.
    pub fn accepted(&self, accept_type: AcceptType, actor: &Url) -> Result<bool, Error> {
        let list = self.get(accept_type)?;
        Ok(list.is_empty() || list.contains(actor))
    }

    /// Tracks storage health: transient failures mark the manager degraded,
    /// and the mark clears on the next successful operation.
    fn track<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        match result {
            Ok(value) => {
                self.degraded.store(false, Ordering::Release);
                Ok(value)
            }
            Err(e) if e.is_transient() => {
                self.degraded.store(true, Ordering::Release);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn empty_list_admits_everyone() {
        let manager = AcceptListManager::new(Arc::new(MemoryAcceptListStore::new()));
        assert!(
            manager
                .accepted(AcceptType::Follow, &url("https://anyone.example/s"))
                .unwrap()
        );
    }

    #[test]
    fn non_empty_list_is_strict() {
        let manager = AcceptListManager::new(Arc::new(MemoryAcceptListStore::new()));
        manager
            .update(
                AcceptType::Follow,
                &[url("https://beta.example/services/anchor")],
                &[],
            )
            .unwrap();

        assert!(
            manager
                .accepted(AcceptType::Follow, &url("https://beta.example/services/anchor"))
                .unwrap()
        );
        assert!(
            !manager
                .accepted(AcceptType::Follow, &url("https://mallory.example/services/anchor"))
                .unwrap()
        );
        // Follow admissions do not leak into witness admissions.
        assert!(
            manager
                .accepted(
                    AcceptType::InviteWitness,
                    &url("https://mallory.example/services/anchor")
                )
                .unwrap()
        );
    }

    #[test]
    fn update_supports_additions_and_deletions() {
        let manager = AcceptListManager::new(Arc::new(MemoryAcceptListStore::new()));
        let beta = url("https://beta.example/services/anchor");
        let gamma = url("https://gamma.example/services/anchor");

        manager
            .update(AcceptType::InviteWitness, &[beta.clone(), gamma.clone()], &[])
            .unwrap();
        manager
            .update(AcceptType::InviteWitness, &[], &[beta.clone()])
            .unwrap();

        assert_eq!(manager.get(AcceptType::InviteWitness).unwrap(), vec![gamma]);
        let all = manager.get_all().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn transient_storage_failures_mark_degraded() {
        struct FailingStore;

        impl AcceptListStore for FailingStore {
            fn update(&self, _: AcceptType, _: &[Url], _: &[Url]) -> Result<(), Error> {
                Err(Error::transient("storage timeout"))
            }

            fn get(&self, _: AcceptType) -> Result<Vec<Url>, Error> {
                Err(Error::transient("storage timeout"))
            }
        }

        let manager = AcceptListManager::new(Arc::new(FailingStore));
        let err = manager.get(AcceptType::Follow).unwrap_err();
        assert!(err.is_transient());
        assert!(manager.is_degraded());
    }
}
