// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Consumer-side redelivery policy.
//!
//! The bus redelivers nacked messages immediately; pacing and the retry
//! budget belong to the component consuming the topic. A worker that hits a
//! transient failure sleeps the backoff, republishes the message with an
//! incremented redelivery count and acks the original. A message that
//! exhausts its budget goes to the undeliverable sink.

use super::{Delivery, Message, PubSub};
use crate::error::Error;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct RedeliveryConfig {
    /// Redeliveries before a message becomes undeliverable.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    /// Bound on queued messages per topic (publish-side backpressure and
    /// broker prefetch).
    pub max_messages: usize,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        RedeliveryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_messages: 20,
        }
    }
}

/// Backoff before redelivery `attempt` (zero-based), capped at
/// `max_backoff`.
pub fn backoff_delay(config: &RedeliveryConfig, attempt: u32) -> Duration {
    let factor = config.backoff_factor.powi(attempt.min(i32::MAX as u32) as i32);
    let delay = config.initial_backoff.as_secs_f64() * factor;
    config.max_backoff.min(Duration::from_secs_f64(delay))
}

/// What a subscriber pool runs for each message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), Error>;
}

/// Receives messages whose retry budget is exhausted.
pub trait UndeliverableSink: Send + Sync {
    fn undeliverable(&self, message: &Message, reason: &str);
}

/// Default sink: log and move on.
pub struct LoggingSink;

impl UndeliverableSink for LoggingSink {
    fn undeliverable(&self, message: &Message, reason: &str) {
        warn!(message_id = %message.id(), "undeliverable after retry exhaustion: {reason}");
    }
}

/// Spawns a fixed pool of competing consumers on `topic`, each processing one
/// message at a time through `handler` under the redelivery policy. The pool
/// winds down when `shutdown` fires or the subscription ends.
pub async fn spawn_consumers(
    pubsub: Arc<dyn PubSub>,
    topic: impl Into<String>,
    workers: usize,
    config: RedeliveryConfig,
    handler: Arc<dyn MessageHandler>,
    sink: Arc<dyn UndeliverableSink>,
    shutdown: flume::Receiver<()>,
) -> Result<Vec<JoinHandle<()>>, Error> {
    let topic = topic.into();
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let rx = pubsub.subscribe(&topic).await?;
        handles.push(tokio::spawn(consume(
            pubsub.clone(),
            topic.clone(),
            rx,
            config.clone(),
            handler.clone(),
            sink.clone(),
            shutdown.clone(),
        )));
    }
    Ok(handles)
}

async fn consume(
    pubsub: Arc<dyn PubSub>,
    topic: String,
    rx: flume::Receiver<Delivery>,
    config: RedeliveryConfig,
    handler: Arc<dyn MessageHandler>,
    sink: Arc<dyn UndeliverableSink>,
    shutdown: flume::Receiver<()>,
) {
    loop {
        let delivery = tokio::select! {
            _ = shutdown.recv_async() => break,
            received = rx.recv_async() => match received {
                Ok(delivery) => delivery,
                Err(_) => break,
            },
        };

        let message = delivery.message().clone();
        match handler.handle(&message).await {
            Ok(()) => delivery.ack(),
            Err(e) if e.is_transient() => {
                let attempt = message.redelivery_count();
                if attempt >= config.max_retries {
                    warn!(
                        message_id = %message.id(),
                        %topic,
                        "retry budget exhausted after {attempt} redeliveries: {e}"
                    );
                    sink.undeliverable(&message, &e.to_string());
                    delivery.ack();
                } else {
                    let delay = backoff_delay(&config, attempt);
                    debug!(
                        message_id = %message.id(),
                        %topic,
                        attempt,
                        "transient failure, redelivering in {delay:?}: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    let retry = message.clone().with_redelivery_count(attempt + 1);
                    match pubsub.publish(&topic, vec![retry]).await {
                        Ok(()) => delivery.ack(),
                        // Republish failed; fall back to bus-level redelivery.
                        Err(_) => delivery.nack(),
                    }
                }
            }
            Err(e) => {
                warn!(message_id = %message.id(), %topic, "dropping message: {e}");
                delivery.ack();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::MemoryPubSub;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyHandler {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(&self, _message: &Message) -> Result<(), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                Err(Error::transient("flaky"))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<uuid::Uuid>>,
    }

    impl UndeliverableSink for RecordingSink {
        fn undeliverable(&self, message: &Message, _reason: &str) {
            self.seen.lock().push(message.id());
        }
    }

    fn fast_config(max_retries: u32) -> RedeliveryConfig {
        RedeliveryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            backoff_factor: 2.0,
            max_messages: 16,
        }
    }

    #[test]
    fn backoff_is_bounded() {
        let config = RedeliveryConfig::default();
        assert_eq!(backoff_delay(&config, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 10), config.max_backoff);
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let bus: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new(16));
        let handler = Arc::new(FlakyHandler {
            failures: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let (_shutdown_tx, shutdown_rx) = flume::bounded::<()>(1);

        let _workers = spawn_consumers(
            bus.clone(),
            "flaky",
            1,
            fast_config(5),
            handler.clone(),
            sink.clone(),
            shutdown_rx,
        )
        .await
        .unwrap();

        bus.publish("flaky", vec![Message::new(b"payload".to_vec())])
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while handler.calls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(sink.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_hit_the_sink_once() {
        let bus: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new(16));
        let handler = Arc::new(FlakyHandler {
            failures: AtomicU32::new(u32::MAX),
            calls: AtomicU32::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let (_shutdown_tx, shutdown_rx) = flume::bounded::<()>(1);

        let _workers = spawn_consumers(
            bus.clone(),
            "doomed",
            1,
            fast_config(2),
            handler.clone(),
            sink.clone(),
            shutdown_rx,
        )
        .await
        .unwrap();

        let message = Message::new(b"payload".to_vec());
        let id = message.id();
        bus.publish("doomed", vec![message]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.seen.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Initial delivery plus two redeliveries, then exactly one report.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.seen.lock().as_slice(), &[id]);
    }

    #[tokio::test]
    async fn persistent_failures_are_dropped_without_retry() {
        struct PersistentFailure(AtomicU32);

        #[async_trait]
        impl MessageHandler for PersistentFailure {
            async fn handle(&self, _message: &Message) -> Result<(), Error> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(Error::bad_request("malformed"))
            }
        }

        let bus: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new(16));
        let handler = Arc::new(PersistentFailure(AtomicU32::new(0)));
        let sink = Arc::new(RecordingSink::default());
        let (_shutdown_tx, shutdown_rx) = flume::bounded::<()>(1);

        let _workers = spawn_consumers(
            bus.clone(),
            "malformed",
            1,
            fast_config(5),
            handler.clone(),
            sink.clone(),
            shutdown_rx,
        )
        .await
        .unwrap();

        bus.publish("malformed", vec![Message::new(vec![])])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
        assert!(sink.seen.lock().is_empty());
    }
}
