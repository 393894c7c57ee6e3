// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The witness-collection side of the anchoring protocol.
//!
//! The coordinator turns a locally proposed anchor into a globally accepted
//! one: it stores the anchor, posts an Offer to the selected witnesses,
//! accumulates the proofs returned in Like activities, and once the witness
//! policy is satisfied announces the witnessed anchor to followers and
//! replays it locally. Offer expiry is authoritative: proofs arriving after
//! `endTime` are dropped, and expired records are reported through the
//! failure callback.

use crate::activity::{Activity, ActivityType, Object, TARGET_ANCHOR_WITNESS};
use crate::anchor::{AnchorLinkset, Hashlink};
use crate::cas::{ContentStore, gateway_url};
use crate::error::Error;
use crate::lifecycle::{Lifecycle, Runnable, State};
use crate::observer::{AnchorInfo, AnchorPublisher};
use crate::outbox::ActivityPoster;
use crate::store::{ActivityStore, RefType};
use crate::vc::Proof;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Quorum definition for witness proofs.
#[derive(Clone, Debug, Deserialize)]
pub struct WitnessPolicy {
    /// Minimum number of distinct witness proofs.
    pub min_witnesses: usize,
    /// Optional minimum share (percent) of the selected witnesses.
    pub min_percent: Option<u8>,
}

impl Default for WitnessPolicy {
    fn default() -> Self {
        WitnessPolicy {
            min_witnesses: 1,
            min_percent: None,
        }
    }
}

impl WitnessPolicy {
    pub fn satisfied(&self, selected: usize, proofs: usize) -> bool {
        if proofs < self.min_witnesses {
            return false;
        }
        if let Some(percent) = self.min_percent {
            if selected > 0 && proofs * 100 < selected * usize::from(percent) {
                return false;
            }
        }
        true
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WitnessStatus {
    Collecting,
    Satisfied,
    Expired,
}

/// Per-anchor proof-collection state. Persisted so a restart keeps in-flight
/// collections alive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WitnessRecord {
    pub anchor_iri: Url,
    pub resource_hash: String,
    pub selected: Vec<Url>,
    pub proofs: Vec<(Url, Proof)>,
    pub expiry: DateTime<Utc>,
    pub status: WitnessStatus,
}

pub trait WitnessRecordStore: Send + Sync {
    fn put(&self, record: &WitnessRecord) -> Result<(), Error>;

    fn get(&self, anchor_iri: &Url) -> Result<WitnessRecord, Error>;

    /// Records still collecting whose expiry has passed.
    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<WitnessRecord>, Error>;

    fn delete(&self, anchor_iri: &Url) -> Result<(), Error>;
}

#[derive(Default)]
pub struct MemoryWitnessRecordStore {
    records: RwLock<HashMap<Url, WitnessRecord>>,
}

impl MemoryWitnessRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WitnessRecordStore for MemoryWitnessRecordStore {
    fn put(&self, record: &WitnessRecord) -> Result<(), Error> {
        self.records
            .write()
            .insert(record.anchor_iri.clone(), record.clone());
        Ok(())
    }

    fn get(&self, anchor_iri: &Url) -> Result<WitnessRecord, Error> {
        self.records
            .read()
            .get(anchor_iri)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no witness record for {anchor_iri}")))
    }

    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<WitnessRecord>, Error> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|record| record.status == WitnessStatus::Collecting && record.expiry < now)
            .cloned()
            .collect())
    }

    fn delete(&self, anchor_iri: &Url) -> Result<(), Error> {
        self.records.write().remove(anchor_iri);
        Ok(())
    }
}

/// Local witness subsystem: produces a proof over an offered anchor.
#[async_trait]
pub trait WitnessProofProvider: Send + Sync {
    async fn prove(&self, anchor_id: &Url, anchor: &[u8]) -> Result<serde_json::Value, Error>;
}

/// Development-grade proof provider: structurally valid, unsigned proofs.
pub struct UnsignedProofProvider {
    verification_method: Url,
}

impl UnsignedProofProvider {
    pub fn new(verification_method: Url) -> Self {
        UnsignedProofProvider {
            verification_method,
        }
    }
}

#[async_trait]
impl WitnessProofProvider for UnsignedProofProvider {
    async fn prove(&self, anchor_id: &Url, _anchor: &[u8]) -> Result<serde_json::Value, Error> {
        Ok(serde_json::json!({
            "type": "DataIntegrityProof",
            "verificationMethod": self.verification_method,
            "proofPurpose": "assertionMethod",
            "created": Utc::now(),
            "domain": anchor_id,
        }))
    }
}

/// Receives witness records that expired without reaching quorum.
pub trait WitnessFailureHandler: Send + Sync {
    fn expired(&self, record: &WitnessRecord);
}

pub struct LoggingWitnessFailureHandler;

impl WitnessFailureHandler for LoggingWitnessFailureHandler {
    fn expired(&self, record: &WitnessRecord) {
        warn!(
            anchor = %record.anchor_iri,
            proofs = record.proofs.len(),
            selected = record.selected.len(),
            "witness offer expired before the policy was satisfied"
        );
    }
}

#[derive(Clone, Debug)]
pub struct WitnessConfig {
    pub service_iri: Url,
    pub policy: WitnessPolicy,
    /// Offer `endTime` distance from proposal.
    pub offer_lifetime: Duration,
    /// Cadence of the expiry sweep.
    pub sweep_interval: Duration,
}

impl WitnessConfig {
    pub fn new(service_iri: Url) -> Self {
        WitnessConfig {
            service_iri,
            policy: WitnessPolicy::default(),
            offer_lifetime: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Owner of the witness records and driver of the Offer → Like exchange.
pub struct WitnessCoordinator {
    config: WitnessConfig,
    store: Arc<dyn ActivityStore>,
    records: Arc<dyn WitnessRecordStore>,
    cas: Arc<dyn ContentStore>,
    outbox: Arc<dyn ActivityPoster>,
    anchors: Arc<dyn AnchorPublisher>,
    failure: Arc<dyn WitnessFailureHandler>,
    state: Lifecycle,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<flume::Sender<()>>>,
}

impl WitnessCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WitnessConfig,
        store: Arc<dyn ActivityStore>,
        records: Arc<dyn WitnessRecordStore>,
        cas: Arc<dyn ContentStore>,
        outbox: Arc<dyn ActivityPoster>,
        anchors: Arc<dyn AnchorPublisher>,
        failure: Arc<dyn WitnessFailureHandler>,
    ) -> Arc<Self> {
        Arc::new(WitnessCoordinator {
            config,
            store,
            records,
            cas,
            outbox,
            anchors,
            failure,
            state: Lifecycle::new(),
            sweeper: Mutex::new(None),
            shutdown: Mutex::new(None),
        })
    }

    /// Proposes a locally built anchor: stores it, opens a witness record and
    /// offers it to the selected witnesses. Returns the anchor's local URL.
    ///
    /// With no witnesses selected and a zero-quorum policy the anchor is
    /// announced immediately.
    pub async fn propose(&self, linkset: AnchorLinkset) -> Result<Url, Error> {
        self.state.ensure_running()?;

        let bytes = linkset.canonical_bytes()?;
        let hash = self.cas.put(&bytes)?;
        let anchor_iri = gateway_url(&self.config.service_iri, &hash)?;

        let witnesses = self
            .store
            .get_references(RefType::Witness, &self.config.service_iri)?;

        if witnesses.is_empty() {
            if self.config.policy.satisfied(0, 0) {
                self.announce_witnessed_linkset(linkset).await?;
                return Ok(anchor_iri);
            }
            return Err(Error::WitnessPolicyNotSatisfied);
        }

        let expiry = Utc::now()
            + ChronoDuration::from_std(self.config.offer_lifetime)
                .map_err(|e| Error::bad_request(format!("offer lifetime: {e}")))?;
        let record = WitnessRecord {
            anchor_iri: anchor_iri.clone(),
            resource_hash: hash,
            selected: witnesses.clone(),
            proofs: Vec::new(),
            expiry,
            status: WitnessStatus::Collecting,
        };
        // The record exists before the offer leaves the node; a crash in
        // between leaves an offer-less record that simply expires.
        self.records.put(&record)?;

        let offered = linkset.with_id(anchor_iri.clone());
        let offer = Activity::new(ActivityType::Offer, self.config.service_iri.clone())
            .with_anchor_context()
            .with_object(Object::Document(serde_json::to_value(&offered)?))
            .with_target(Object::Iri(Url::parse(TARGET_ANCHOR_WITNESS)?))
            .with_end_time(expiry)
            .with_to(witnesses);
        self.outbox.post(offer, &[]).await?;

        info!(anchor = %anchor_iri, "offered anchor to witnesses");
        Ok(anchor_iri)
    }

    /// Feeds a witness proof into the record for `anchor_iri`. `NotFound`
    /// surfaces for unknown offers; proofs for expired or already satisfied
    /// records are dropped silently.
    pub async fn on_like(
        &self,
        anchor_iri: &Url,
        witness: &Url,
        proof: Proof,
    ) -> Result<(), Error> {
        let mut record = self.records.get(anchor_iri)?;

        if record.status == WitnessStatus::Expired || Utc::now() > record.expiry {
            debug!(anchor = %anchor_iri, %witness, "dropping proof for expired offer");
            return Ok(());
        }
        if record.status == WitnessStatus::Satisfied {
            return Ok(());
        }
        if !record.selected.contains(witness) {
            warn!(anchor = %anchor_iri, %witness, "dropping proof from unsolicited witness");
            return Ok(());
        }
        if proof.as_value().get("type").is_none() {
            return Err(Error::bad_request(format!(
                "malformed proof from {witness}"
            )));
        }
        if record.proofs.iter().any(|(seen, _)| seen == witness) {
            return Ok(());
        }

        record.proofs.push((witness.clone(), proof));
        let satisfied = self
            .config
            .policy
            .satisfied(record.selected.len(), record.proofs.len());
        if satisfied {
            record.status = WitnessStatus::Satisfied;
        }
        self.records.put(&record)?;

        if satisfied {
            info!(anchor = %anchor_iri, proofs = record.proofs.len(), "witness policy satisfied");
            self.announce(&record).await?;
        }
        Ok(())
    }

    /// Re-reads the stored anchor, folds the collected proofs into its
    /// credential and announces the witnessed form.
    async fn announce(&self, record: &WitnessRecord) -> Result<(), Error> {
        let bytes = self.cas.get(&record.resource_hash)?;
        let mut linkset: AnchorLinkset = serde_json::from_slice(&bytes)?;
        for (_, proof) in &record.proofs {
            linkset.credential_mut().add_proof(proof.clone());
        }
        self.announce_witnessed_linkset(linkset).await
    }

    async fn announce_witnessed_linkset(&self, linkset: AnchorLinkset) -> Result<(), Error> {
        let witnessed_bytes = linkset.canonical_bytes()?;
        let witnessed_hash = self.cas.put(&witnessed_bytes)?;
        let local_gateway = gateway_url(&self.config.service_iri, &witnessed_hash)?;
        let hashlink = Hashlink::new(witnessed_hash).with_hints(vec![local_gateway.clone()]);

        self.anchors
            .publish_anchor(AnchorInfo {
                hashlink: hashlink.clone(),
                attributed_to: Some(linkset.credential().issuer().clone()),
                origin: Some(self.config.service_iri.clone()),
            })
            .await?;

        let followers = self
            .store
            .get_references(RefType::Follower, &self.config.service_iri)?;
        if !followers.is_empty() {
            let witnessed = linkset.with_id(local_gateway);
            let create = Activity::new(ActivityType::Create, self.config.service_iri.clone())
                .with_anchor_context()
                .with_object(Object::Document(serde_json::to_value(&witnessed)?))
                .with_to(followers);
            self.outbox.post(create, &[]).await?;
        }
        Ok(())
    }
}

fn sweep_expired(records: &dyn WitnessRecordStore, failure: &dyn WitnessFailureHandler) {
    let expired = match records.expired(Utc::now()) {
        Ok(expired) => expired,
        Err(e) => {
            warn!("witness expiry sweep failed: {e}");
            return;
        }
    };
    for mut record in expired {
        record.status = WitnessStatus::Expired;
        if let Err(e) = records.put(&record) {
            warn!(anchor = %record.anchor_iri, "failed to expire witness record: {e}");
            continue;
        }
        failure.expired(&record);
    }
}

#[async_trait]
impl Runnable for WitnessCoordinator {
    /// Starts the expiry sweeper.
    async fn start(&self) -> Result<(), Error> {
        self.state.start()?;
        let (shutdown_tx, shutdown_rx) = flume::bounded::<()>(1);
        *self.shutdown.lock() = Some(shutdown_tx);

        let records = self.records.clone();
        let failure = self.failure.clone();
        let interval = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv_async() => break,
                    _ = tokio::time::sleep(interval) => {
                        sweep_expired(records.as_ref(), failure.as_ref());
                    }
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
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
