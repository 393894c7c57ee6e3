// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The observer pipeline.
//!
//! When an anchor reference becomes known locally (through Create, Announce
//! or direct publication) the observer fetches the anchor from CAS, verifies
//! its credential, selects the operation processor for the payload's
//! namespace/version and replays the batch into the local operation store.
//! Replay is idempotent: a batch that applies nothing is checked against the
//! anchor-link store and retried once, tolerating duplicate-key noise.

mod links;

#[cfg(test)]
mod tests;

pub use links::{AnchorLinkStore, DidAnchorIndex};

use crate::activity::{Activity, ActivityType, Object};
use crate::anchor::{AnchorLinkset, AnchorParserRegistry, Hashlink};
use crate::cas::{CasResolver, gateway_url};
use crate::error::Error;
use crate::lifecycle::{Lifecycle, Runnable, State};
use crate::outbox::ActivityPoster;
use crate::processor::{AnchorTransaction, ProcessorRegistry};
use crate::pubsub::{
    LoggingSink, Message, MessageHandler, PubSub, RedeliveryConfig, TOPIC_ANCHOR, TOPIC_DID,
    spawn_consumers,
};
use crate::vc::CredentialVerifier;
use async_trait::async_trait;
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Longest per-DID anchor chain the catch-up walk will follow.
const MAX_CHAIN_DEPTH: usize = 500;

/// An anchor notification: the reference to fetch plus the actors to thank
/// with a Like once the anchor is applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnchorInfo {
    pub hashlink: Hashlink,
    /// The credential issuer, when the notifier knew it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributed_to: Option<Url>,
    /// The actor the notification came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Url>,
}

/// The observer publisher boundary.
#[async_trait]
pub trait AnchorPublisher: Send + Sync {
    async fn publish_anchor(&self, info: AnchorInfo) -> Result<(), Error>;

    /// Requests catch-up of an out-of-system DID
    /// (`<namespace>:<anchor hash>:<suffix>`).
    async fn publish_did(&self, did: &str) -> Result<(), Error>;
}

#[derive(Clone, Debug)]
pub struct ObserverConfig {
    pub service_iri: Url,
    /// Size of the anchor-topic worker pool.
    pub pool_size: usize,
    /// Verify the anchor credential's proofs before replay. The operation
    /// processor may verify again; this is the policy knob for the
    /// observer-side check.
    pub verify_proofs: bool,
    /// Emit a Like with the local hashlink to the anchor's author/origin.
    pub emit_likes: bool,
    pub redelivery: RedeliveryConfig,
}

impl ObserverConfig {
    pub fn new(service_iri: Url) -> Self {
        ObserverConfig {
            service_iri,
            pool_size: 5,
            verify_proofs: true,
            emit_likes: true,
            redelivery: RedeliveryConfig::default(),
        }
    }
}

/// Everything one replay needs; shared by the worker pool.
struct Pipeline {
    config: ObserverConfig,
    cas: CasResolver,
    credential_verifier: Arc<dyn CredentialVerifier>,
    parsers: Arc<AnchorParserRegistry>,
    processors: Arc<ProcessorRegistry>,
    links: Arc<AnchorLinkStore>,
    index: Arc<DidAnchorIndex>,
    outbox: Arc<dyn ActivityPoster>,
}

impl Pipeline {
    /// Fetches, verifies and parses the anchor behind `hashlink`.
    async fn load(&self, hashlink: &Hashlink) -> Result<AnchorLinkset, Error> {
        let bytes = self.cas.resolve(hashlink).await?;
        let parser = self.parsers.parser_for(&bytes)?;
        let linkset = parser.parse(&bytes)?;
        if self.config.verify_proofs {
            self.credential_verifier
                .verify(linkset.credential())
                .await?;
        }
        Ok(linkset)
    }

    /// The local spelling of an anchor: canonical hash plus our gateway.
    fn local_hashlink(&self, hash: &str) -> Result<Hashlink, Error> {
        Ok(Hashlink::new(hash)
            .with_hints(vec![gateway_url(&self.config.service_iri, hash)?]))
    }

    fn transaction_for(&self, linkset: &AnchorLinkset, hashlink: &Hashlink) -> AnchorTransaction {
        let mut equivalents = vec![hashlink.to_string()];
        if let Ok(local) = self.local_hashlink(hashlink.resource_hash()) {
            equivalents.push(local.to_string());
        }
        AnchorTransaction {
            namespace: linkset.namespace().to_string(),
            version: linkset.version(),
            transaction_time: linkset.credential().issued(),
            anchor_string: linkset.anchor_string(),
            canonical_reference: hashlink.resource_hash().to_string(),
            equivalent_references: equivalents,
        }
    }

    /// Replays one anchor. With an empty suffix list the whole batch is
    /// applied.
    async fn apply(
        &self,
        hashlink: &Hashlink,
        linkset: &AnchorLinkset,
        suffixes: &[String],
    ) -> Result<u64, Error> {
        let processor = self
            .processors
            .get(linkset.namespace(), linkset.version())?;
        let transaction = self.transaction_for(linkset, hashlink);
        let hash = hashlink.resource_hash();

        let applied = processor.process(&transaction, suffixes).await?;
        if applied == 0 {
            if self.links.is_processed(hash) {
                debug!(anchor = %hash, "anchor already processed");
                return Ok(0);
            }
            // First sight of an anchor that applied nothing: replay once
            // more, tolerating duplicate-key noise from the operation store.
            if let Err(e) = processor.process(&transaction, suffixes).await {
                debug!(anchor = %hash, "tolerated replay error: {e}");
            }
        }

        let local = self.local_hashlink(hash)?;
        self.index.bulk_update(linkset.previous().iter().map(|(suffix, previous)| {
            (suffix.clone(), local.clone(), previous.is_none())
        }));
        self.links
            .mark_processed(hash, &[hashlink.clone(), local.clone()]);

        Ok(applied)
    }

    async fn process_anchor(&self, info: &AnchorInfo) -> Result<(), Error> {
        let linkset = self.load(&info.hashlink).await?;
        let applied = self.apply(&info.hashlink, &linkset, &[]).await?;
        info!(
            anchor = %info.hashlink.resource_hash(),
            applied,
            "anchor replayed into the operation store"
        );

        if self.config.emit_likes {
            self.emit_like(info, linkset.credential().issuer()).await;
        }
        Ok(())
    }

    /// Tells the author (and origin) where else the anchor can now be
    /// fetched. Failure here never fails the replay.
    async fn emit_like(&self, info: &AnchorInfo, issuer: &Url) {
        let recipients: Vec<Url> = info
            .attributed_to
            .iter()
            .chain(info.origin.iter())
            .chain(std::iter::once(issuer))
            .filter(|actor| **actor != self.config.service_iri)
            .unique()
            .cloned()
            .collect();
        if recipients.is_empty() {
            return;
        }

        let like = match (
            info.hashlink.canonical_uri(),
            self.local_hashlink(info.hashlink.resource_hash())
                .and_then(|local| local.uri()),
        ) {
            (Ok(object), Ok(result)) => {
                Activity::new(ActivityType::Like, self.config.service_iri.clone())
                    .with_anchor_context()
                    .with_object(Object::Iri(object))
                    .with_result(Object::Iri(result))
                    .with_to(recipients)
            }
            _ => return,
        };
        if let Err(e) = self.outbox.post(like, &[]).await {
            warn!(anchor = %info.hashlink.resource_hash(), "failed to emit like: {e}");
        }
    }

    /// Catch-up for an out-of-system DID: walk the per-suffix anchor chain
    /// back to its create (or the first already-processed link) and apply
    /// oldest-first.
    async fn process_did(&self, did: &str) -> Result<(), Error> {
        let mut parts = did.rsplitn(3, ':');
        let suffix = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::bad_request(format!("DID {did} has no suffix")))?
            .to_string();
        let hash = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::bad_request(format!("DID {did} has no anchor hash")))?;

        let mut chain = Vec::new();
        let mut current = self.local_hashlink(hash)?;
        loop {
            if chain.len() >= MAX_CHAIN_DEPTH {
                warn!(did, "anchor chain exceeds {MAX_CHAIN_DEPTH} links, truncating walk");
                break;
            }
            let linkset = self.load(&current).await?;
            let previous = linkset.previous().get(&suffix).cloned().flatten();
            chain.push((current.clone(), linkset));
            match previous {
                Some(previous) if !self.links.is_processed(previous.resource_hash()) => {
                    current = previous;
                }
                _ => break,
            }
        }

        for (hashlink, linkset) in chain.into_iter().rev() {
            match self.apply(&hashlink, &linkset, &[suffix.clone()]).await {
                Ok(_) => {}
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    warn!(
                        did,
                        anchor = %hashlink.resource_hash(),
                        "skipping anchor with persistent failure: {e}"
                    );
                }
            }
        }
        Ok(())
    }
}

/// The observer component: anchor- and DID-topic subscriber pools around the
/// shared pipeline.
pub struct Observer {
    pipeline: Arc<Pipeline>,
    pubsub: Arc<dyn PubSub>,
    pool_size: usize,
    redelivery: RedeliveryConfig,
    state: Lifecycle,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<Option<flume::Sender<()>>>,
}

impl Observer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ObserverConfig,
        pubsub: Arc<dyn PubSub>,
        cas: CasResolver,
        credential_verifier: Arc<dyn CredentialVerifier>,
        parsers: Arc<AnchorParserRegistry>,
        processors: Arc<ProcessorRegistry>,
        links: Arc<AnchorLinkStore>,
        index: Arc<DidAnchorIndex>,
        outbox: Arc<dyn ActivityPoster>,
    ) -> Arc<Self> {
        let pool_size = config.pool_size;
        let redelivery = config.redelivery.clone();
        Arc::new(Observer {
            pipeline: Arc::new(Pipeline {
                config,
                cas,
                credential_verifier,
                parsers,
                processors,
                links,
                index,
                outbox,
            }),
            pubsub,
            pool_size,
            redelivery,
            state: Lifecycle::new(),
            workers: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
        })
    }

    pub fn links(&self) -> &Arc<AnchorLinkStore> {
        &self.pipeline.links
    }

    pub fn index(&self) -> &Arc<DidAnchorIndex> {
        &self.pipeline.index
    }
}

#[async_trait]
impl AnchorPublisher for Observer {
    async fn publish_anchor(&self, info: AnchorInfo) -> Result<(), Error> {
        self.pubsub
            .publish(TOPIC_ANCHOR, vec![Message::json(&info)?])
            .await
    }

    async fn publish_did(&self, did: &str) -> Result<(), Error> {
        self.pubsub
            .publish(TOPIC_DID, vec![Message::json(&did)?])
            .await
    }
}

struct AnchorTopicWorker {
    pipeline: Arc<Pipeline>,
}

#[async_trait]
impl MessageHandler for AnchorTopicWorker {
    async fn handle(&self, message: &Message) -> Result<(), Error> {
        let info: AnchorInfo = message.parse()?;
        self.pipeline.process_anchor(&info).await
    }
}

struct DidTopicWorker {
    pipeline: Arc<Pipeline>,
}

#[async_trait]
impl MessageHandler for DidTopicWorker {
    async fn handle(&self, message: &Message) -> Result<(), Error> {
        let did: String = message.parse()?;
        self.pipeline.process_did(&did).await
    }
}

#[async_trait]
impl Runnable for Observer {
    async fn start(&self) -> Result<(), Error> {
        self.state.start()?;
        let (shutdown_tx, shutdown_rx) = flume::bounded(1);
        *self.shutdown.lock() = Some(shutdown_tx);

        let mut handles = spawn_consumers(
            self.pubsub.clone(),
            TOPIC_ANCHOR,
            self.pool_size,
            self.redelivery.clone(),
            Arc::new(AnchorTopicWorker {
                pipeline: self.pipeline.clone(),
            }),
            Arc::new(LoggingSink),
            shutdown_rx.clone(),
        )
        .await?;
        handles.extend(
            spawn_consumers(
                self.pubsub.clone(),
                TOPIC_DID,
                1,
                self.redelivery.clone(),
                Arc::new(DidTopicWorker {
                    pipeline: self.pipeline.clone(),
                }),
                Arc::new(LoggingSink),
                shutdown_rx,
            )
            .await?,
        );
        *self.workers.lock() = handles;
        Ok(())
    }

    fn stop(&self) -> Result<(), Error> {
        self.state.stop()?;
        self.shutdown.lock().take();
        Ok(())
    }

    fn state(&self) -> State {
        self.state.state()
    }
}
