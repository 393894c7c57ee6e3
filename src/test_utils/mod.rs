// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Shared fixtures for unit tests: recording doubles for the outbox,
//! observer and processor seams, and sample anchors.

use crate::activity::Activity;
use crate::anchor::{AnchorLinkset, Hashlink};
use crate::error::Error;
use crate::observer::{AnchorInfo, AnchorPublisher};
use crate::outbox::ActivityPoster;
use crate::processor::{AnchorTransaction, OperationProcessor};
use crate::vc::Credential;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use url::Url;
use uuid::Uuid;

pub(crate) fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

pub(crate) fn service(host: &str) -> Url {
    url(&format!("https://{host}/services/anchor"))
}

/// Captures posted activities instead of delivering them, stamping ids the
/// way the real outbox would.
pub(crate) struct RecordingPoster {
    service: Url,
    pub(crate) posted: Mutex<Vec<Activity>>,
}

impl RecordingPoster {
    pub(crate) fn new(service: Url) -> Self {
        RecordingPoster {
            service,
            posted: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn posted_of(&self, kind: crate::activity::ActivityType) -> Vec<Activity> {
        self.posted
            .lock()
            .iter()
            .filter(|activity| activity.has_type(kind))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ActivityPoster for RecordingPoster {
    async fn post(&self, activity: Activity, _exclude: &[Url]) -> Result<Url, Error> {
        let activity = match activity.id() {
            Some(_) => activity,
            None => {
                let id = url(&format!(
                    "{}/activities/{}",
                    self.service.as_str().trim_end_matches('/'),
                    Uuid::new_v4()
                ));
                activity.with_id(id)
            }
        };
        let id = activity.require_id()?.clone();
        self.posted.lock().push(activity);
        Ok(id)
    }
}

/// Captures observer notifications.
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    pub(crate) anchors: Mutex<Vec<AnchorInfo>>,
    #[allow(dead_code)]
    pub(crate) dids: Mutex<Vec<String>>,
}

#[async_trait]
impl AnchorPublisher for RecordingPublisher {
    async fn publish_anchor(&self, info: AnchorInfo) -> Result<(), Error> {
        self.anchors.lock().push(info);
        Ok(())
    }

    async fn publish_did(&self, did: &str) -> Result<(), Error> {
        self.dids.lock().push(did.to_string());
        Ok(())
    }
}

/// Operation-processor double with first-application semantics: the first
/// call for a canonical reference applies the batch, repeats apply nothing.
#[derive(Default)]
pub(crate) struct RecordingProcessor {
    pub(crate) calls: Mutex<Vec<(AnchorTransaction, Vec<String>)>>,
    seen: Mutex<HashSet<String>>,
}

impl RecordingProcessor {
    pub(crate) fn applications(&self, canonical: &str) -> usize {
        usize::from(self.seen.lock().contains(canonical))
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl OperationProcessor for RecordingProcessor {
    async fn process(
        &self,
        transaction: &AnchorTransaction,
        suffixes: &[String],
    ) -> Result<u64, Error> {
        self.calls
            .lock()
            .push((transaction.clone(), suffixes.to_vec()));
        if self
            .seen
            .lock()
            .insert(transaction.canonical_reference.clone())
        {
            let count = transaction
                .anchor_string
                .split('.')
                .next()
                .and_then(|count| count.parse().ok())
                .unwrap_or(1);
            Ok(count)
        } else {
            Ok(0)
        }
    }
}

/// A small anchor batch issued by `issuer`: one created suffix, one updated.
pub(crate) fn sample_linkset(issuer: &Url) -> AnchorLinkset {
    let mut previous = IndexMap::new();
    previous.insert("EiAcreated".to_string(), None);
    previous.insert(
        "EiAupdated".to_string(),
        Some(Hashlink::new("uEiAearlier")),
    );
    let mut credential = Credential::new(
        issuer.clone(),
        serde_json::json!({"batch": "uEiAcoreindex"}),
    );
    credential.add_proof(
        crate::vc::Proof::new(serde_json::json!({
            "type": "DataIntegrityProof",
            "verificationMethod": format!("{issuer}#main-key"),
            "proofPurpose": "assertionMethod",
        }))
        .unwrap(),
    );
    AnchorLinkset::new(
        url("https://alpha.example/cas/uEiAcoreindex"),
        2,
        previous,
        credential,
    )
}
