// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Outbound half of the message plane.
//!
//! `post` stamps, persists and fans an activity out into one delivery task
//! per recipient inbox; a fixed pool of delivery workers signs and POSTs each
//! task. Transport failures and throttling are redelivered with backoff;
//! permanent rejections and exhausted retries produce exactly one
//! undeliverable record apiece, through the callback and the store.

use crate::activity::{Activity, ActivityType};
use crate::error::Error;
use crate::httpsig::RequestSigner;
use crate::lifecycle::{Lifecycle, Runnable, State};
use crate::pubsub::{
    Message, MessageHandler, PubSub, RedeliveryConfig, TOPIC_INBOX, TOPIC_OUTBOX,
    UndeliverableSink, spawn_consumers,
};
use crate::service::{FEDERATION_CONTENT_TYPE, ServiceResolver};
use crate::store::{ActivityStore, Bucket};
use async_trait::async_trait;
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct OutboxConfig {
    /// IRI of the local service; every posted activity must carry it as
    /// actor.
    pub service_iri: Url,
    /// Size of the delivery worker pool.
    pub delivery_pool: usize,
    /// Deadline for each outbound POST.
    pub request_timeout: Duration,
    pub redelivery: RedeliveryConfig,
}

impl OutboxConfig {
    pub fn new(service_iri: Url) -> Self {
        OutboxConfig {
            service_iri,
            delivery_pool: 5,
            request_timeout: Duration::from_secs(10),
            redelivery: RedeliveryConfig::default(),
        }
    }
}

/// The outbox invocation boundary exposed to collaborating subsystems.
#[async_trait]
pub trait ActivityPoster: Send + Sync {
    /// Delivers `activity` to every recipient in its `to` list except
    /// `exclude`, returning the local activity URL.
    async fn post(&self, activity: Activity, exclude: &[Url]) -> Result<Url, Error>;
}

/// Callback for deliveries whose retry budget is exhausted or that were
/// permanently rejected.
pub trait UndeliverableHandler: Send + Sync {
    fn undeliverable(&self, activity_id: &Url, to_url: &Url, reason: &str);
}

/// Default handler: the store already keeps the record, so just log.
pub struct LoggingUndeliverableHandler;

impl UndeliverableHandler for LoggingUndeliverableHandler {
    fn undeliverable(&self, activity_id: &Url, to_url: &Url, reason: &str) {
        warn!(activity = %activity_id, to = %to_url, "undeliverable: {reason}");
    }
}

/// One (activity, recipient inbox) pair on the outbox topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct DeliveryTask {
    inbox: Url,
    to: Url,
    activity: Activity,
}

pub struct Outbox {
    config: OutboxConfig,
    pubsub: Arc<dyn PubSub>,
    store: Arc<dyn ActivityStore>,
    resolver: Arc<ServiceResolver>,
    signer: Arc<dyn RequestSigner>,
    client: reqwest::Client,
    undeliverable: Arc<dyn UndeliverableHandler>,
    state: Lifecycle,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<Option<flume::Sender<()>>>,
}

impl Outbox {
    pub fn new(
        config: OutboxConfig,
        pubsub: Arc<dyn PubSub>,
        store: Arc<dyn ActivityStore>,
        resolver: Arc<ServiceResolver>,
        signer: Arc<dyn RequestSigner>,
        undeliverable: Arc<dyn UndeliverableHandler>,
    ) -> Result<Arc<Self>, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Arc::new(Outbox {
            config,
            pubsub,
            store,
            resolver,
            signer,
            client,
            undeliverable,
            state: Lifecycle::new(),
            workers: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
        }))
    }

    fn mint_id(&self) -> Result<Url, Error> {
        let base = self.config.service_iri.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}/activities/{}", Uuid::new_v4()))?)
    }

    fn record_undeliverable(&self, activity_id: &Url, to_url: &Url, reason: &str) {
        if let Err(e) = self.store.put_undeliverable(activity_id, to_url, reason) {
            warn!(activity = %activity_id, "failed to persist undeliverable: {e}");
        }
        self.undeliverable.undeliverable(activity_id, to_url, reason);
    }

    /// Whether a locally posted activity has side effects the inbound
    /// handler must realize. Implemented by republishing to the inbox topic
    /// rather than calling the handler reentrantly.
    fn needs_local_apply(activity: &Activity) -> bool {
        activity.has_type(ActivityType::Undo)
    }
}

#[async_trait]
impl ActivityPoster for Outbox {
    async fn post(&self, activity: Activity, exclude: &[Url]) -> Result<Url, Error> {
        self.state.ensure_running()?;

        let activity = match activity.id() {
            Some(_) => activity,
            None => {
                let id = self.mint_id()?;
                activity.with_id(id)
            }
        };
        let id = activity.require_id()?.clone();

        if activity.actor() != &self.config.service_iri {
            return Err(Error::bad_request(format!(
                "activity actor {} is not this service",
                activity.actor()
            )));
        }

        self.store.put_activity(Bucket::Outbox, &activity)?;

        if Self::needs_local_apply(&activity) {
            self.pubsub
                .publish(TOPIC_INBOX, vec![Message::new(activity.to_json()?)])
                .await?;
        }

        let recipients: Vec<Url> = activity
            .to()
            .iter()
            .filter(|&recipient| {
                !exclude.contains(recipient) && recipient != &self.config.service_iri
            })
            .unique()
            .cloned()
            .collect();

        let mut tasks = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            match self.resolver.resolve_inbox(&recipient).await {
                Ok(inbox) => tasks.push(Message::json(&DeliveryTask {
                    inbox,
                    to: recipient,
                    activity: activity.clone(),
                })?),
                Err(e) => {
                    // No inbox, no retry loop: the recipient is undeliverable
                    // right away.
                    self.record_undeliverable(&id, &recipient, &e.to_string());
                }
            }
        }
        if !tasks.is_empty() {
            self.pubsub.publish(TOPIC_OUTBOX, tasks).await?;
        }

        Ok(id)
    }
}

#[async_trait]
impl Runnable for Outbox {
    async fn start(&self) -> Result<(), Error> {
        self.state.start()?;
        let (shutdown_tx, shutdown_rx) = flume::bounded(1);
        *self.shutdown.lock() = Some(shutdown_tx);

        let worker = Arc::new(DeliveryWorker {
            client: self.client.clone(),
            signer: self.signer.clone(),
            store: self.store.clone(),
            undeliverable: self.undeliverable.clone(),
        });
        let sink = Arc::new(ExhaustedDeliverySink {
            store: self.store.clone(),
            undeliverable: self.undeliverable.clone(),
        });
        let handles = spawn_consumers(
            self.pubsub.clone(),
            TOPIC_OUTBOX,
            self.config.delivery_pool,
            self.config.redelivery.clone(),
            worker,
            sink,
            shutdown_rx,
        )
        .await?;
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

struct DeliveryWorker {
    client: reqwest::Client,
    signer: Arc<dyn RequestSigner>,
    store: Arc<dyn ActivityStore>,
    undeliverable: Arc<dyn UndeliverableHandler>,
}

impl DeliveryWorker {
    async fn deliver(&self, task: &DeliveryTask) -> Result<DeliveryOutcome, Error> {
        let body = task.activity.to_json()?;
        let mut request = self
            .client
            .post(task.inbox.clone())
            .header(http::header::CONTENT_TYPE.as_str(), FEDERATION_CONTENT_TYPE)
            .body(body.clone())
            .build()?;
        self.signer.sign(&mut request, &body)?;

        let response = self.client.execute(request).await?;
        let status = response.status();
        if status.is_success() {
            debug!(inbox = %task.inbox, "delivered activity");
            return Ok(DeliveryOutcome::Delivered);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(Error::transient(format!(
                "inbox {} answered {status}",
                task.inbox
            )));
        }
        Ok(DeliveryOutcome::Rejected(status))
    }
}

enum DeliveryOutcome {
    Delivered,
    Rejected(reqwest::StatusCode),
}

#[async_trait]
impl MessageHandler for DeliveryWorker {
    async fn handle(&self, message: &Message) -> Result<(), Error> {
        let task: DeliveryTask = message.parse()?;
        match self.deliver(&task).await? {
            DeliveryOutcome::Delivered => Ok(()),
            DeliveryOutcome::Rejected(status) => {
                // Permanent rejection: no retry, one undeliverable record.
                let id = task.activity.require_id()?;
                let reason = format!("rejected with {status}");
                if let Err(e) = self.store.put_undeliverable(id, &task.to, &reason) {
                    warn!(activity = %id, "failed to persist undeliverable: {e}");
                }
                self.undeliverable.undeliverable(id, &task.to, &reason);
                Ok(())
            }
        }
    }
}

/// Sink receiving delivery tasks whose retry budget ran out.
struct ExhaustedDeliverySink {
    store: Arc<dyn ActivityStore>,
    undeliverable: Arc<dyn UndeliverableHandler>,
}

impl UndeliverableSink for ExhaustedDeliverySink {
    fn undeliverable(&self, message: &Message, reason: &str) {
        let Ok(task) = message.parse::<DeliveryTask>() else {
            warn!("undeliverable outbox message is not a delivery task");
            return;
        };
        let Some(id) = task.activity.id() else {
            return;
        };
        if let Err(e) = self.store.put_undeliverable(id, &task.to, reason) {
            warn!(activity = %id, "failed to persist undeliverable: {e}");
        }
        self.undeliverable.undeliverable(id, &task.to, reason);
    }
}
