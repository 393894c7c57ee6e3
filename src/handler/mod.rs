// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Protocol state machines of the federation plane.
//!
//! The inbound handler is a typed dispatcher over the activity vocabulary:
//! each type tag drives one transition against the reference sets, the
//! witness records or the observer. Replies (Accept, Reject, Like) go back
//! out through the outbox; anchors go to the observer topic. Handlers are
//! reentrant and rely on the store's per-operation atomicity only.

pub mod acceptlist;
pub mod witness;


pub use acceptlist::{AcceptListManager, AcceptListStore, AcceptType, MemoryAcceptListStore};
pub use witness::{
    LoggingWitnessFailureHandler, MemoryWitnessRecordStore, UnsignedProofProvider,
    WitnessConfig, WitnessCoordinator, WitnessFailureHandler, WitnessPolicy,
    WitnessProofProvider, WitnessRecord, WitnessRecordStore, WitnessStatus,
};

use crate::activity::{Activity, ActivityType, Collection, Object};
use crate::anchor::AnchorLinkset;
use crate::cas::{ContentStore, gateway_url};
use crate::error::Error;
use crate::observer::{AnchorInfo, AnchorLinkStore, AnchorPublisher};
use crate::outbox::ActivityPoster;
use crate::store::{ActivityStore, RefType};
use crate::vc::Proof;
use async_trait::async_trait;
use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// What the inbox invokes for every received activity.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn handle(&self, activity: &Activity) -> Result<(), Error>;
}

#[derive(Clone, Debug)]
pub struct InboundHandlerConfig {
    pub service_iri: Url,
}

/// The typed inbound dispatcher.
pub struct InboundHandler {
    config: InboundHandlerConfig,
    store: Arc<dyn ActivityStore>,
    cas: Arc<dyn ContentStore>,
    outbox: Arc<dyn ActivityPoster>,
    acceptlist: Arc<AcceptListManager>,
    witness: Arc<WitnessCoordinator>,
    proof_provider: Arc<dyn WitnessProofProvider>,
    anchors: Arc<dyn AnchorPublisher>,
    links: Arc<AnchorLinkStore>,
}

impl InboundHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: InboundHandlerConfig,
        store: Arc<dyn ActivityStore>,
        cas: Arc<dyn ContentStore>,
        outbox: Arc<dyn ActivityPoster>,
        acceptlist: Arc<AcceptListManager>,
        witness: Arc<WitnessCoordinator>,
        proof_provider: Arc<dyn WitnessProofProvider>,
        anchors: Arc<dyn AnchorPublisher>,
        links: Arc<AnchorLinkStore>,
    ) -> Arc<Self> {
        Arc::new(InboundHandler {
            config,
            store,
            cas,
            outbox,
            acceptlist,
            witness,
            proof_provider,
            anchors,
            links,
        })
    }

    fn service(&self) -> &Url {
        &self.config.service_iri
    }

    /// Stores an embedded anchor document locally and returns the
    /// notification for the observer. The origin's gateway (the document's
    /// minted id) becomes a transport hint for everyone downstream.
    fn ingest_anchor_document(
        &self,
        doc: &serde_json::Value,
        origin: &Url,
    ) -> Result<AnchorInfo, Error> {
        let linkset: AnchorLinkset = serde_json::from_value(doc.clone())?;
        let bytes = linkset.canonical_bytes()?;
        let hash = self.cas.put(&bytes)?;

        let mut hints = Vec::new();
        if let Some(id) = linkset.id() {
            hints.push(id.clone());
        }
        hints.push(gateway_url(self.service(), &hash)?);

        Ok(AnchorInfo {
            hashlink: crate::anchor::Hashlink::new(hash).with_hints(hints),
            attributed_to: Some(linkset.credential().issuer().clone()),
            origin: Some(origin.clone()),
        })
    }

    async fn handle_create(&self, activity: &Activity) -> Result<(), Error> {
        let doc = activity
            .object_document()
            .ok_or_else(|| Error::bad_request("create without an embedded anchor"))?;
        let info = self.ingest_anchor_document(doc, activity.actor())?;
        let hashlink = info.hashlink.clone();
        self.anchors.publish_anchor(info).await?;

        // Fan the anchor out to our own followers, skipping whoever sent it.
        let followers = self.store.get_references(RefType::Follower, self.service())?;
        if !followers.is_empty() {
            let announce = Activity::new(ActivityType::Announce, self.service().clone())
                .with_anchor_context()
                .with_object(Object::Collection(Collection::new(vec![Object::Iri(
                    hashlink.uri()?,
                )])))
                .with_to(followers);
            self.outbox
                .post(announce, &[activity.actor().clone()])
                .await?;
        }
        Ok(())
    }

    async fn handle_announce(&self, activity: &Activity) -> Result<(), Error> {
        let collection = activity
            .object()
            .and_then(Object::collection)
            .ok_or_else(|| Error::bad_request("announce without a collection"))?;

        // Announce is informational: every reference goes to the observer,
        // no reference set changes.
        for item in collection.items() {
            match item {
                Object::Iri(url) => match crate::anchor::Hashlink::from_str(url.as_str()) {
                    Ok(hashlink) => {
                        self.anchors
                            .publish_anchor(AnchorInfo {
                                hashlink,
                                attributed_to: None,
                                origin: Some(activity.actor().clone()),
                            })
                            .await?;
                    }
                    Err(e) => debug!("skipping non-hashlink announce item {url}: {e}"),
                },
                Object::Document(doc) => {
                    let info = self.ingest_anchor_document(doc, activity.actor())?;
                    self.anchors.publish_anchor(info).await?;
                }
                other => debug!("skipping unsupported announce item: {other:?}"),
            }
        }
        Ok(())
    }

    async fn handle_follow(&self, activity: &Activity) -> Result<(), Error> {
        self.handle_relationship_request(
            activity,
            AcceptType::Follow,
            // Actors following this service.
            RefType::Follower,
        )
        .await
    }

    async fn handle_invite_witness(&self, activity: &Activity) -> Result<(), Error> {
        self.handle_relationship_request(
            activity,
            AcceptType::InviteWitness,
            // The inviter is someone this service witnesses for.
            RefType::Witnessing,
        )
        .await
    }

    /// Follow and InviteWitness share the accept-list gate and the
    /// persist-before-reply rule.
    async fn handle_relationship_request(
        &self,
        activity: &Activity,
        accept_type: AcceptType,
        ref_type: RefType,
    ) -> Result<(), Error> {
        let target = activity
            .object_iri()
            .ok_or_else(|| Error::bad_request(format!("{accept_type} without a target")))?;
        if target != self.service() {
            return Err(Error::bad_request(format!(
                "{accept_type} of {target} received by {}",
                self.service()
            )));
        }

        let actor = activity.actor().clone();
        let admitted = self.acceptlist.accepted(accept_type, &actor)?;
        let reply_type = if admitted {
            // The relationship exists before the Accept leaves the node.
            self.store.add_reference(ref_type, self.service(), &actor)?;
            ActivityType::Accept
        } else {
            info!(%actor, "{accept_type} rejected by accept list");
            ActivityType::Reject
        };

        let reply = Activity::new(reply_type, self.service().clone())
            .with_object(Object::Activity(Box::new(activity.clone())))
            .with_to(vec![actor]);
        self.outbox.post(reply, &[]).await?;
        Ok(())
    }

    async fn handle_accept(&self, activity: &Activity) -> Result<(), Error> {
        let original = activity
            .embedded_activity()
            .ok_or_else(|| Error::bad_request("accept without the original activity"))?;
        if original.actor() != self.service() {
            return Err(Error::bad_request(format!(
                "accept of an activity by {}, not by this service",
                original.actor()
            )));
        }

        let peer = activity.actor().clone();
        if original.has_type(ActivityType::Follow) {
            self.store
                .add_reference(RefType::Following, self.service(), &peer)?;
            info!(%peer, "follow accepted");
        } else if original.has_type(ActivityType::InviteWitness) {
            self.store
                .add_reference(RefType::Witness, self.service(), &peer)?;
            info!(%peer, "witness invitation accepted");
        } else {
            debug!("ignoring accept of {:?}", original.types());
        }
        Ok(())
    }

    async fn handle_reject(&self, activity: &Activity) -> Result<(), Error> {
        // No set is mutated on rejection.
        if let Some(original) = activity.embedded_activity() {
            info!(
                peer = %activity.actor(),
                "request {:?} was rejected",
                original.types()
            );
        }
        Ok(())
    }

    async fn handle_offer(&self, activity: &Activity) -> Result<(), Error> {
        let expiry = activity
            .end_time()
            .ok_or_else(|| Error::bad_request("offer without an endTime"))?;
        if expiry <= Utc::now() {
            return Err(Error::bad_request("offer is already expired"));
        }

        let offerer = activity.actor().clone();
        let witnessing = self
            .store
            .get_references(RefType::Witnessing, self.service())?;
        if !witnessing.contains(&offerer) {
            // Not someone we agreed to witness for.
            let reject = Activity::new(ActivityType::Reject, self.service().clone())
                .with_object(Object::Activity(Box::new(activity.clone())))
                .with_to(vec![offerer.clone()]);
            self.outbox.post(reject, &[]).await?;
            info!(%offerer, "rejected witness offer from non-principal");
            return Ok(());
        }

        let doc = activity
            .object_document()
            .ok_or_else(|| Error::bad_request("offer without an embedded anchor"))?;
        let linkset: AnchorLinkset = serde_json::from_value(doc.clone())?;
        let anchor_id = linkset
            .id()
            .ok_or_else(|| Error::bad_request("offered anchor has no id"))?
            .clone();

        let bytes = serde_json::to_vec(doc)?;
        let proof = self.proof_provider.prove(&anchor_id, &bytes).await?;

        // Record what we vouched for before the proof leaves the node.
        self.store
            .add_reference(RefType::Liked, self.service(), &anchor_id)?;

        let like = Activity::new(ActivityType::Like, self.service().clone())
            .with_anchor_context()
            .with_object(Object::Iri(anchor_id))
            .with_result(Object::Document(proof))
            .with_to(vec![offerer]);
        self.outbox.post(like, &[]).await?;
        Ok(())
    }

    async fn handle_like(&self, activity: &Activity) -> Result<(), Error> {
        let object = activity
            .object_iri()
            .ok_or_else(|| Error::bad_request("like without an object"))?
            .clone();

        match activity.result() {
            // A witness returned a proof for one of our offers.
            Some(Object::Document(value)) => {
                let proof = Proof::new(value.clone())?;
                match self
                    .witness
                    .on_like(&object, activity.actor(), proof)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        debug!(anchor = %object, "like for an unknown offer, ignoring");
                    }
                    Err(e) => return Err(e),
                }
            }
            // A peer applied one of our anchors and reports where it can
            // also be fetched.
            Some(Object::Iri(alternate)) => {
                if let (Ok(anchor), Ok(alternate)) = (
                    crate::anchor::Hashlink::from_str(object.as_str()),
                    crate::anchor::Hashlink::from_str(alternate.as_str()),
                ) {
                    self.links
                        .add_alternate(anchor.resource_hash(), &alternate);
                }
            }
            _ => debug!(object = %object, "like carries no usable result"),
        }

        if let Some(id) = activity.id() {
            self.store.add_reference(RefType::Like, self.service(), id)?;
        }
        Ok(())
    }

    async fn handle_undo(&self, activity: &Activity) -> Result<(), Error> {
        let original = match activity.embedded_activity() {
            Some(original) => original.clone(),
            None => {
                let id = activity
                    .object_iri()
                    .ok_or_else(|| Error::bad_request("undo without an object"))?;
                let bucket = if activity.actor() == self.service() {
                    crate::store::Bucket::Outbox
                } else {
                    crate::store::Bucket::Inbox
                };
                match self.store.get_activity(bucket, id) {
                    Ok(original) => original,
                    Err(e) if e.is_not_found() => {
                        debug!(object = %id, "undo of an unknown activity, ignoring");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        if original.actor() != activity.actor() {
            return Err(Error::unauthorized(format!(
                "{} cannot undo an activity by {}",
                activity.actor(),
                original.actor()
            )));
        }

        let local = activity.actor() == self.service();
        let peer = activity.actor().clone();
        if original.has_type(ActivityType::Follow) {
            if local {
                if let Some(target) = original.object_iri() {
                    self.store
                        .delete_reference(RefType::Following, self.service(), target)?;
                }
            } else {
                self.store
                    .delete_reference(RefType::Follower, self.service(), &peer)?;
            }
        } else if original.has_type(ActivityType::InviteWitness) {
            if local {
                if let Some(target) = original.object_iri() {
                    self.store
                        .delete_reference(RefType::Witness, self.service(), target)?;
                }
            } else {
                self.store
                    .delete_reference(RefType::Witnessing, self.service(), &peer)?;
            }
        } else if original.has_type(ActivityType::Like) {
            if local {
                if let Some(target) = original.object_iri() {
                    self.store
                        .delete_reference(RefType::Liked, self.service(), target)?;
                }
            } else if let Some(id) = original.id() {
                self.store
                    .delete_reference(RefType::Like, self.service(), id)?;
            }
        } else {
            debug!("undo of {:?} has no set effect", original.types());
        }
        Ok(())
    }
}

#[async_trait]
impl ActivityHandler for InboundHandler {
    async fn handle(&self, activity: &Activity) -> Result<(), Error> {
        let kind = activity
            .types()
            .first()
            .ok_or_else(|| Error::bad_request("untyped activity"))?;
        debug!(activity = ?activity.id(), actor = %activity.actor(), "dispatching {kind}");

        match kind {
            ActivityType::Create => self.handle_create(activity).await,
            ActivityType::Follow => self.handle_follow(activity).await,
            ActivityType::Accept => self.handle_accept(activity).await,
            ActivityType::Reject => self.handle_reject(activity).await,
            ActivityType::Announce => self.handle_announce(activity).await,
            ActivityType::Offer => self.handle_offer(activity).await,
            ActivityType::Like => self.handle_like(activity).await,
            ActivityType::Undo => self.handle_undo(activity).await,
            ActivityType::InviteWitness => self.handle_invite_witness(activity).await,
        }
        .inspect_err(|e| {
            if !e.is_transient() {
                warn!(activity = ?activity.id(), "{kind} handling failed: {e}");
            }
        })
    }
}
