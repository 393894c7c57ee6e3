// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::*;
use crate::activity::ActivityType;
use crate::anchor::{AnchorLinkset, AnchorParserRegistry, Hashlink, NAMESPACE, VERSION};
use crate::cas::{CasResolver, ContentStore, MemoryCas};
use crate::processor::ProcessorRegistry;
use crate::pubsub::MemoryPubSub;
use crate::test_utils::{RecordingPoster, RecordingProcessor, sample_linkset, service};
use crate::vc::{AcceptAllVerifier, Credential};
use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use std::time::Duration;

struct Fixture {
    observer: Arc<Observer>,
    cas: Arc<MemoryCas>,
    processor: Arc<RecordingProcessor>,
    poster: Arc<RecordingPoster>,
}

async fn fixture() -> Fixture {
    let local = service("alpha.example");
    let bus: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new(64));
    let cas = Arc::new(MemoryCas::new());
    let processor = Arc::new(RecordingProcessor::default());
    let poster = Arc::new(RecordingPoster::new(local.clone()));

    let mut processors = ProcessorRegistry::new();
    processors.register(NAMESPACE, VERSION, processor.clone());

    let mut config = ObserverConfig::new(local.clone());
    config.redelivery = RedeliveryConfig {
        max_retries: 1,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(10),
        backoff_factor: 2.0,
        max_messages: 32,
    };

    let observer = Observer::new(
        config,
        bus,
        CasResolver::new(cas.clone(), Duration::from_secs(1)).unwrap(),
        Arc::new(AcceptAllVerifier),
        Arc::new(AnchorParserRegistry::default()),
        Arc::new(processors),
        Arc::new(AnchorLinkStore::new()),
        Arc::new(DidAnchorIndex::new()),
        poster.clone(),
    );
    observer.start().await.unwrap();

    Fixture {
        observer,
        cas,
        processor,
        poster,
    }
}

fn store_anchor(cas: &MemoryCas, linkset: &AnchorLinkset) -> Hashlink {
    let bytes = linkset.canonical_bytes().unwrap();
    Hashlink::new(cas.put(&bytes).unwrap())
}

async fn settle<F: Fn() -> bool>(done: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn anchor_is_fetched_verified_and_applied() {
    let fx = fixture().await;
    let beta = service("beta.example");
    let linkset = sample_linkset(&beta);
    let hashlink = store_anchor(&fx.cas, &linkset);

    fx.observer
        .publish_anchor(AnchorInfo {
            hashlink: hashlink.clone(),
            attributed_to: Some(beta.clone()),
            origin: Some(beta.clone()),
        })
        .await
        .unwrap();

    let processor = fx.processor.clone();
    settle(move || processor.call_count() >= 1).await;

    let calls = fx.processor.calls.lock();
    let (transaction, suffixes) = &calls[0];
    assert!(suffixes.is_empty());
    assert_eq!(transaction.canonical_reference, hashlink.resource_hash());
    assert_eq!(
        transaction.anchor_string,
        "2.https://alpha.example/cas/uEiAcoreindex"
    );
    assert_eq!(transaction.transaction_time, linkset.credential().issued());
    assert!(
        transaction
            .equivalent_references
            .iter()
            .any(|r| r.contains("alpha.example"))
    );
    drop(calls);

    assert!(fx.observer.links().is_processed(hashlink.resource_hash()));
    let latest = fx.observer.index().latest("EiAcreated").unwrap();
    assert_eq!(latest.resource_hash(), hashlink.resource_hash());

    // The author learns the local alternate through a Like.
    let likes = fx.poster.posted_of(ActivityType::Like);
    assert_eq!(likes.len(), 1);
    assert_eq!(likes[0].to(), &[beta]);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_notification_has_one_observable_side_effect() {
    let fx = fixture().await;
    let beta = service("beta.example");
    let linkset = sample_linkset(&beta);
    let hashlink = store_anchor(&fx.cas, &linkset);

    let info = AnchorInfo {
        hashlink: hashlink.clone(),
        attributed_to: Some(beta.clone()),
        origin: Some(beta),
    };
    fx.observer.publish_anchor(info.clone()).await.unwrap();
    let processor = fx.processor.clone();
    settle(move || processor.call_count() >= 1).await;

    fx.observer.publish_anchor(info).await.unwrap();
    let processor = fx.processor.clone();
    settle(move || processor.call_count() >= 2).await;

    // The second replay returned zero applied and the link store confirmed
    // prior processing: exactly one application in the operation store.
    assert_eq!(fx.processor.applications(hashlink.resource_hash()), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unsupported_payload_never_reaches_the_processor() {
    let fx = fixture().await;
    let bytes =
        serde_json::to_vec(&serde_json::json!({"namespace": "did:other", "version": 9}))
            .unwrap();
    let hash = fx.cas.put(&bytes).unwrap();

    fx.observer
        .publish_anchor(AnchorInfo {
            hashlink: Hashlink::new(hash),
            attributed_to: None,
            origin: None,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.processor.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn did_catch_up_applies_the_chain_oldest_first() {
    let fx = fixture().await;
    let beta = service("beta.example");
    let suffix = "EiAchained".to_string();

    let genesis = {
        let mut previous = IndexMap::new();
        previous.insert(suffix.clone(), None);
        let mut credential = Credential::new(beta.clone(), serde_json::json!({}));
        credential.add_proof(
            crate::vc::Proof::new(serde_json::json!({"type": "DataIntegrityProof"})).unwrap(),
        );
        AnchorLinkset::new(
            crate::test_utils::url("https://beta.example/cas/uEiAindex1"),
            1,
            previous,
            credential,
        )
    };
    let genesis_link = store_anchor(&fx.cas, &genesis);

    let extension = {
        let mut previous = IndexMap::new();
        previous.insert(suffix.clone(), Some(genesis_link.clone()));
        let mut credential = Credential::new(beta.clone(), serde_json::json!({}));
        credential.add_proof(
            crate::vc::Proof::new(serde_json::json!({"type": "DataIntegrityProof"})).unwrap(),
        );
        AnchorLinkset::new(
            crate::test_utils::url("https://beta.example/cas/uEiAindex2"),
            1,
            previous,
            credential,
        )
    };
    let extension_link = store_anchor(&fx.cas, &extension);

    let did = format!("did:anchorage:{}:{suffix}", extension_link.resource_hash());
    fx.observer.publish_did(&did).await.unwrap();

    let processor = fx.processor.clone();
    settle(move || processor.call_count() >= 2).await;

    let calls = fx.processor.calls.lock();
    assert_eq!(calls[0].0.canonical_reference, genesis_link.resource_hash());
    assert_eq!(calls[0].1, vec![suffix.clone()]);
    assert_eq!(
        calls[1].0.canonical_reference,
        extension_link.resource_hash()
    );
    drop(calls);

    let latest = fx.observer.index().latest(&suffix).unwrap();
    assert_eq!(latest.resource_hash(), extension_link.resource_hash());
}
