// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Inbound half of the message plane.
//!
//! The HTTP handler verifies the signature, parses the activity and enqueues
//! the raw body on the inbox topic; everything after the 202 response is
//! asynchronous. A subscriber pool persists each activity and dispatches it
//! to the inbound activity handler, acking or nacking on the error kind.

use crate::activity::Activity;
use crate::error::Error;
use crate::handler::ActivityHandler;
use crate::httpsig::SignatureVerifier;
use crate::lifecycle::{Lifecycle, Runnable, State};
use crate::pubsub::{
    LoggingSink, Message, MessageHandler, PubSub, RedeliveryConfig, TOPIC_INBOX,
    spawn_consumers,
};
use crate::store::{ActivityStore, Bucket};
use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State as AxumState;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

#[derive(Clone, Debug)]
pub struct InboxConfig {
    /// IRI of the local service; inbound activities must be addressed to it.
    pub service_iri: Url,
    /// Path the HTTP handler is mounted at.
    pub inbox_path: String,
    /// Require the actor recovered from the signature to match the
    /// activity's declared actor.
    pub verify_actor_in_signature: bool,
    /// Size of the dispatcher pool consuming the inbox topic.
    pub subscriber_pool: usize,
    pub redelivery: RedeliveryConfig,
}

impl InboxConfig {
    pub fn new(service_iri: Url) -> Self {
        let inbox_path = format!("{}/inbox", service_iri.path().trim_end_matches('/'));
        InboxConfig {
            service_iri,
            inbox_path,
            verify_actor_in_signature: true,
            subscriber_pool: 2,
            redelivery: RedeliveryConfig::default(),
        }
    }
}

/// The service inbox: HTTP ingress plus the topic subscriber that realizes
/// activities against the store and the inbound handler.
pub struct Inbox {
    config: InboxConfig,
    pubsub: Arc<dyn PubSub>,
    store: Arc<dyn ActivityStore>,
    verifier: Arc<dyn SignatureVerifier>,
    handler: Arc<dyn ActivityHandler>,
    state: Lifecycle,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<Option<flume::Sender<()>>>,
    local_tx: flume::Sender<Activity>,
    local_rx: flume::Receiver<Activity>,
}

impl Inbox {
    pub fn new(
        config: InboxConfig,
        pubsub: Arc<dyn PubSub>,
        store: Arc<dyn ActivityStore>,
        verifier: Arc<dyn SignatureVerifier>,
        handler: Arc<dyn ActivityHandler>,
    ) -> Arc<Self> {
        let (local_tx, local_rx) = flume::unbounded();
        Arc::new(Inbox {
            config,
            pubsub,
            store,
            verifier,
            handler,
            state: Lifecycle::new(),
            workers: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
            local_tx,
            local_rx,
        })
    }

    /// The HTTP surface, ready to be merged into the embedder's router.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(&self.config.inbox_path, post(Inbox::handle_post))
            .with_state(self.clone())
    }

    /// Local fan-out of successfully handled activities.
    pub fn subscribe(&self) -> flume::Receiver<Activity> {
        self.local_rx.clone()
    }

    async fn start_dispatchers(&self) -> Result<(), Error> {
        self.state.start()?;
        let (shutdown_tx, shutdown_rx) = flume::bounded(1);
        *self.shutdown.lock() = Some(shutdown_tx);

        let dispatcher = Arc::new(Dispatcher {
            store: self.store.clone(),
            handler: self.handler.clone(),
            local_tx: self.local_tx.clone(),
        });
        let handles = spawn_consumers(
            self.pubsub.clone(),
            TOPIC_INBOX,
            self.config.subscriber_pool,
            self.config.redelivery.clone(),
            dispatcher,
            Arc::new(LoggingSink),
            shutdown_rx,
        )
        .await?;
        *self.workers.lock() = handles;
        Ok(())
    }

    async fn handle_post(
        AxumState(inbox): AxumState<Arc<Inbox>>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        match inbox.receive(&headers, &method, &uri, &body).await {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(e) => {
                debug!("rejecting inbound post: {e}");
                // Internal detail never leaks; the reason stays terse.
                let (status, reason) = match e {
                    Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "invalid signature"),
                    Error::BadRequest(_) | Error::NotFound(_) | Error::NotSupported(_) => {
                        (StatusCode::BAD_REQUEST, "malformed activity")
                    }
                    _ => (StatusCode::SERVICE_UNAVAILABLE, "temporarily unavailable"),
                };
                (status, reason).into_response()
            }
        }
    }

    async fn receive(
        &self,
        headers: &HeaderMap,
        method: &Method,
        uri: &Uri,
        body: &[u8],
    ) -> Result<(), Error> {
        self.state.ensure_running()?;

        let signer = self.verifier.verify(headers, method, uri, body).await?;

        let activity = Activity::from_json(body)?;
        activity.require_id()?;
        if self.config.verify_actor_in_signature && activity.actor() != &signer {
            return Err(Error::unauthorized(format!(
                "signature actor {signer} does not match activity actor {}",
                activity.actor()
            )));
        }

        // Durably enqueued; processing continues asynchronously.
        self.pubsub
            .publish(TOPIC_INBOX, vec![Message::new(body.to_vec())])
            .await
    }
}

#[async_trait]
impl Runnable for Inbox {
    /// Starts the dispatcher pool. The HTTP handler responds 503 until then.
    async fn start(&self) -> Result<(), Error> {
        self.start_dispatchers().await
    }

    fn stop(&self) -> Result<(), Error> {
        self.state.stop()?;
        // Dropping the sender lets workers drain in-flight messages and
        // then exit.
        self.shutdown.lock().take();
        Ok(())
    }

    fn state(&self) -> State {
        self.state.state()
    }
}

struct Dispatcher {
    store: Arc<dyn ActivityStore>,
    handler: Arc<dyn ActivityHandler>,
    local_tx: flume::Sender<Activity>,
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, message: &Message) -> Result<(), Error> {
        let activity = Activity::from_json(message.payload())?;
        let id = activity.require_id()?.clone();

        // Duplicate short-circuit applies to fresh deliveries only; a
        // redelivered message is our own retry and must reach the handler
        // again.
        if message.redelivery_count() == 0 && self.store.activity_exists(Bucket::Inbox, &id)? {
            debug!(activity = %id, "duplicate inbox activity, short-circuiting");
            return Ok(());
        }

        self.store.put_activity(Bucket::Inbox, &activity)?;
        self.handler.handle(&activity).await?;

        if self.local_tx.send(activity).is_err() {
            warn!("inbox fan-out channel closed");
        }
        Ok(())
    }
}
