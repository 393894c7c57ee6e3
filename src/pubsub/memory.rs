// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{Acknowledger, Delivery, Message, PubSub};
use crate::error::Error;
use crate::lifecycle::{Lifecycle, Runnable, State};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

struct Topic {
    tx: flume::Sender<Delivery>,
    rx: flume::Receiver<Delivery>,
}

/// In-process pub/sub multiplexer.
///
/// Each topic is a flume MPMC channel: cloning the receiver gives competing
/// consumers, so a message is delivered to exactly one subscriber. A nack (or
/// an unsettled drop) re-enqueues the message with an incremented redelivery
/// count. Capacity is bounded at publish time: the bus sheds new publishes,
/// never redeliveries.
pub struct MemoryPubSub {
    topics: RwLock<HashMap<String, Topic>>,
    capacity: usize,
    state: Lifecycle,
}

impl MemoryPubSub {
    /// A running bus whose per-topic backlog is bounded by `capacity`.
    pub fn new(capacity: usize) -> Self {
        MemoryPubSub {
            topics: RwLock::new(HashMap::new()),
            capacity,
            state: Lifecycle::new_running(),
        }
    }

    fn topic_sender(&self, topic: &str) -> flume::Sender<Delivery> {
        if let Some(existing) = self.topics.read().get(topic) {
            return existing.tx.clone();
        }
        let mut topics = self.topics.write();
        let entry = topics.entry(topic.to_string()).or_insert_with(|| {
            let (tx, rx) = flume::unbounded();
            Topic { tx, rx }
        });
        entry.tx.clone()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(&self, topic: &str) -> Result<flume::Receiver<Delivery>, Error> {
        self.state.ensure_running()?;
        if let Some(existing) = self.topics.read().get(topic) {
            return Ok(existing.rx.clone());
        }
        let mut topics = self.topics.write();
        let entry = topics.entry(topic.to_string()).or_insert_with(|| {
            let (tx, rx) = flume::unbounded();
            Topic { tx, rx }
        });
        Ok(entry.rx.clone())
    }

    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<(), Error> {
        self.state.ensure_running()?;
        let tx = self.topic_sender(topic);
        for message in messages {
            if tx.len() >= self.capacity {
                return Err(Error::transient(format!("topic {topic} is full")));
            }
            let delivery = MemAcker::wrap(message, tx.clone());
            tx.send_async(delivery)
                .await
                .map_err(|_| Error::transient(format!("topic {topic} is closed")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Runnable for MemoryPubSub {
    async fn start(&self) -> Result<(), Error> {
        self.state.start()
    }

    /// Closes every topic. Subscribers drain what is already queued and then
    /// see end-of-stream.
    fn stop(&self) -> Result<(), Error> {
        self.state.stop()?;
        self.topics.write().clear();
        Ok(())
    }

    fn state(&self) -> State {
        self.state.state()
    }
}

/// Settle handle for the in-memory bus. Carries its own copy of the envelope
/// so a nack can re-enqueue without help from the consumer.
struct MemAcker {
    tx: flume::Sender<Delivery>,
    message: Option<Message>,
}

impl MemAcker {
    fn wrap(message: Message, tx: flume::Sender<Delivery>) -> Delivery {
        let acker = MemAcker {
            tx,
            message: Some(message.clone()),
        };
        Delivery::new(message, Box::new(acker))
    }
}

impl Acknowledger for MemAcker {
    fn ack(&mut self) {
        self.message = None;
    }

    fn nack(&mut self) {
        let Some(message) = self.message.take() else {
            return;
        };
        let count = message.redelivery_count();
        let delivery = MemAcker::wrap(message.with_redelivery_count(count + 1), self.tx.clone());
        // Redeliveries bypass the publish-side capacity bound.
        if self.tx.try_send(delivery).is_err() {
            tracing::warn!("dropping redelivery for closed topic");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn publish_subscribe_roundtrip() {
        let bus = MemoryPubSub::new(16);
        let rx = bus.subscribe("test").await.unwrap();
        bus.publish("test", vec![Message::new(b"one".to_vec())])
            .await
            .unwrap();

        let delivery = rx.recv_async().await.unwrap();
        assert_eq!(delivery.message().payload(), b"one");
        delivery.ack();
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn competing_consumers_partition_the_stream() {
        let bus = MemoryPubSub::new(64);
        let a = bus.subscribe("work").await.unwrap();
        let b = bus.subscribe("work").await.unwrap();

        let messages = (0..10u8)
            .map(|i| Message::new(vec![i]))
            .collect::<Vec<_>>();
        bus.publish("work", messages).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..10 {
            // Drain from whichever consumer has the message; between them
            // every message shows up exactly once.
            let delivery = tokio::select! {
                d = a.recv_async() => d.unwrap(),
                d = b.recv_async() => d.unwrap(),
            };
            seen.push(delivery.message().payload()[0]);
            delivery.ack();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..10u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn nack_redelivers_with_incremented_count() {
        let bus = MemoryPubSub::new(16);
        let rx = bus.subscribe("retry").await.unwrap();
        bus.publish("retry", vec![Message::new(b"x".to_vec())])
            .await
            .unwrap();

        let first = rx.recv_async().await.unwrap();
        assert_eq!(first.message().redelivery_count(), 0);
        first.nack();

        let second = rx.recv_async().await.unwrap();
        assert_eq!(second.message().redelivery_count(), 1);
        second.ack();
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered() {
        let bus = MemoryPubSub::new(16);
        let rx = bus.subscribe("drop").await.unwrap();
        bus.publish("drop", vec![Message::new(b"x".to_vec())])
            .await
            .unwrap();

        {
            // Consumer dies mid-processing without settling.
            let _abandoned = rx.recv_async().await.unwrap();
        }

        let redelivered = rx.recv_async().await.unwrap();
        assert_eq!(redelivered.message().redelivery_count(), 1);
        redelivered.ack();
    }

    #[tokio::test]
    async fn stopped_bus_rejects_operations() {
        let bus = MemoryPubSub::new(16);
        let rx = bus.subscribe("t").await.unwrap();
        bus.stop().unwrap();

        assert!(matches!(
            bus.publish("t", vec![Message::new(vec![])]).await,
            Err(Error::AlreadyStopped)
        ));
        assert!(matches!(bus.subscribe("t").await, Err(Error::AlreadyStopped)));
        assert!(matches!(bus.stop(), Err(Error::AlreadyStopped)));

        // The stream ends once the queue drains.
        assert!(rx.recv_async().await.is_err());
    }

    #[tokio::test]
    async fn full_topic_rejects_publish() {
        let bus = MemoryPubSub::new(1);
        let _rx = bus.subscribe("full").await.unwrap();
        bus.publish("full", vec![Message::new(vec![1])])
            .await
            .unwrap();
        let err = bus
            .publish("full", vec![Message::new(vec![2])])
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
