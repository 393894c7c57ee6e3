// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Internal pub/sub that decouples the message-plane components.
//!
//! Two interchangeable implementations satisfy the same contract: an
//! in-process multiplexer ([`MemoryPubSub`]) and an AMQP client
//! ([`AmqpPubSub`]). Delivery is at-least-once; subscribers on the same topic
//! compete for messages; every delivery must be acked or nacked, and a
//! delivery dropped unsettled counts as a nack so a dying consumer returns
//! its in-flight message to the queue.

mod amqp;
mod memory;
mod redelivery;

pub use amqp::{AmqpConfig, AmqpPubSub};
pub use memory::MemoryPubSub;
pub use redelivery::{
    LoggingSink, MessageHandler, RedeliveryConfig, UndeliverableSink, backoff_delay,
    spawn_consumers,
};

use crate::error::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Raw inbound activities awaiting verification-side dispatch.
pub const TOPIC_INBOX: &str = "activity.inbox";
/// Per-recipient delivery tasks produced by the outbox.
pub const TOPIC_OUTBOX: &str = "activity.outbox";
/// Anchor notifications consumed by the observer.
pub const TOPIC_ANCHOR: &str = "anchor.linkset";
/// Out-of-system DID catch-up requests.
pub const TOPIC_DID: &str = "anchor.did";

const METADATA_REDELIVERY_COUNT: &str = "redelivery-count";

/// The pub/sub envelope: a UUID, an opaque payload and a metadata map that
/// propagates with every redelivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    metadata: HashMap<String, String>,
}

impl Message {
    pub fn new(payload: Vec<u8>) -> Self {
        Message {
            id: Uuid::new_v4(),
            payload,
            metadata: HashMap::new(),
        }
    }

    /// A message whose payload is the JSON form of `value`.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, Error> {
        Ok(Message::new(serde_json::to_vec(value)?))
    }

    /// Reconstructs a message that already has an identity, e.g. one read
    /// back from a broker.
    pub fn with_id(id: Uuid, payload: Vec<u8>) -> Self {
        Message {
            id,
            payload,
            metadata: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn parse<'a, T: Deserialize<'a>>(&'a self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// How many times this message has been redelivered.
    pub fn redelivery_count(&self) -> u32 {
        self.metadata
            .get(METADATA_REDELIVERY_COUNT)
            .and_then(|count| count.parse().ok())
            .unwrap_or(0)
    }

    pub fn with_redelivery_count(self, count: u32) -> Self {
        self.with_metadata(METADATA_REDELIVERY_COUNT, count.to_string())
    }
}

/// Transport-specific settle mechanism behind a [`Delivery`].
pub trait Acknowledger: Send {
    fn ack(&mut self);
    fn nack(&mut self);
}

/// A received message plus its settle handle. Exactly one of [`Delivery::ack`]
/// or [`Delivery::nack`] must be called; dropping the delivery unsettled
/// nacks it.
pub struct Delivery {
    message: Message,
    acker: Box<dyn Acknowledger>,
    settled: bool,
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn Acknowledger>) -> Self {
        Delivery {
            message,
            acker,
            settled: false,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Permanent disposal.
    pub fn ack(mut self) {
        self.settled = true;
        self.acker.ack();
    }

    /// Transient failure; the message is redelivered.
    pub fn nack(mut self) {
        self.settled = true;
        self.acker.nack();
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            self.acker.nack();
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("settled", &self.settled)
            .finish()
    }
}

#[async_trait]
pub trait PubSub: Send + Sync {
    /// Returns a lazy stream of deliveries. Subscribers to the same topic
    /// share the work: each message goes to exactly one of them.
    async fn subscribe(&self, topic: &str) -> Result<flume::Receiver<Delivery>, Error>;

    /// Publishes with at-least-once semantics. Failures surface to the
    /// caller; there is no implicit retry.
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn redelivery_count_defaults_to_zero() {
        let message = Message::new(b"payload".to_vec());
        assert_eq!(message.redelivery_count(), 0);
        let retried = message.with_redelivery_count(3);
        assert_eq!(retried.redelivery_count(), 3);
    }

    #[test]
    fn json_payload_roundtrip() {
        let message = Message::json(&serde_json::json!({"k": "v"})).unwrap();
        let value: serde_json::Value = message.parse().unwrap();
        assert_eq!(value["k"], "v");
    }
}
