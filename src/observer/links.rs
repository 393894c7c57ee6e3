// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::anchor::Hashlink;
use indexmap::IndexSet;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::trace;

#[derive(Default, Clone)]
struct LinkEntry {
    alternates: IndexSet<String>,
    processed: bool,
}

/// Bookkeeping of anchor content locations, keyed by canonical resource
/// hash.
///
/// Every spelling of an anchor the node learns about (the notification's
/// hashlink, the local gateway, alternates reported by peers in Like
/// activities) lands here, so discovery queries can return alternate
/// sources. The processed flag backs the observer's duplicate check.
#[derive(Default)]
pub struct AnchorLinkStore {
    entries: RwLock<HashMap<String, LinkEntry>>,
}

impl AnchorLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an additional place the anchor can be fetched from.
    pub fn add_alternate(&self, hash: &str, hashlink: &Hashlink) {
        self.entries
            .write()
            .entry(hash.to_string())
            .or_default()
            .alternates
            .insert(hashlink.to_string());
    }

    /// Marks the anchor as replayed into the operation store, recording the
    /// spellings known at that point.
    pub fn mark_processed(&self, hash: &str, alternates: &[Hashlink]) {
        let mut entries = self.entries.write();
        let entry = entries.entry(hash.to_string()).or_default();
        entry.processed = true;
        for hashlink in alternates {
            entry.alternates.insert(hashlink.to_string());
        }
    }

    pub fn is_processed(&self, hash: &str) -> bool {
        self.entries
            .read()
            .get(hash)
            .is_some_and(|entry| entry.processed)
    }

    pub fn alternates(&self, hash: &str) -> Vec<String> {
        self.entries
            .read()
            .get(hash)
            .map(|entry| entry.alternates.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Per-DID "latest anchor" index, updated in bulk as anchors are applied.
#[derive(Default)]
pub struct DidAnchorIndex {
    latest: RwLock<HashMap<String, Hashlink>>,
}

impl DidAnchorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the latest-anchor entry for every suffix in `updates` under
    /// one lock acquisition. The create flag lets a persistent backend
    /// distinguish first writes from chain extensions.
    pub fn bulk_update(&self, updates: impl IntoIterator<Item = (String, Hashlink, bool)>) {
        let mut latest = self.latest.write();
        for (suffix, hashlink, is_create) in updates {
            trace!(%suffix, %hashlink, is_create, "updating latest anchor");
            latest.insert(suffix, hashlink);
        }
    }

    pub fn latest(&self, suffix: &str) -> Option<Hashlink> {
        self.latest.read().get(suffix).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn alternates_deduplicate_and_keep_order() {
        let store = AnchorLinkStore::new();
        let a = Hashlink::new("uEiAhash")
            .with_hints(vec![url::Url::parse("https://alpha.example/cas/uEiAhash").unwrap()]);
        let b = Hashlink::new("uEiAhash")
            .with_hints(vec![url::Url::parse("https://beta.example/cas/uEiAhash").unwrap()]);

        store.add_alternate("uEiAhash", &a);
        store.add_alternate("uEiAhash", &b);
        store.add_alternate("uEiAhash", &a);

        let alternates = store.alternates("uEiAhash");
        assert_eq!(alternates.len(), 2);
        assert_eq!(alternates[0], a.to_string());
    }

    #[test]
    fn processed_flag_is_per_hash() {
        let store = AnchorLinkStore::new();
        assert!(!store.is_processed("uEiAhash"));
        store.mark_processed("uEiAhash", &[Hashlink::new("uEiAhash")]);
        assert!(store.is_processed("uEiAhash"));
        assert!(!store.is_processed("uEiAother"));
    }

    #[test]
    fn latest_anchor_is_replaced_in_bulk() {
        let index = DidAnchorIndex::new();
        index.bulk_update(vec![
            ("EiAone".to_string(), Hashlink::new("uEiAanchor1"), true),
            ("EiAtwo".to_string(), Hashlink::new("uEiAanchor1"), false),
        ]);
        index.bulk_update(vec![(
            "EiAone".to_string(),
            Hashlink::new("uEiAanchor2"),
            false,
        )]);

        assert_eq!(index.latest("EiAone"), Some(Hashlink::new("uEiAanchor2")));
        assert_eq!(index.latest("EiAtwo"), Some(Hashlink::new("uEiAanchor1")));
        assert_eq!(index.latest("EiAmissing"), None);
    }
}
