//! Retained message store: at most one message per topic, replayed to new
//! subscriptions.
//!
//! Backed by a `BTreeMap` for deterministic iteration order, behind a
//! reader-writer lock; replay on SUBSCRIBE dominates mutation.

use crate::error::StoreError;
use crate::protocol::{PublishProperties, QoS};
use crate::store::Message;
use crate::topic;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

/// The last retained publish on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub properties: Option<PublishProperties>,
    pub expires_at: Option<SystemTime>,
}

impl RetainedMessage {
    fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Convert to a deliverable for a subscriber with the given maximum
    /// QoS. Replayed retained messages always carry the retain flag.
    pub fn to_message(&self, max_qos: QoS, subscription_ids: Vec<u32>) -> Message {
        Message {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos.min(max_qos),
            retain: true,
            subscription_ids,
            properties: self.properties.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// Per-topic retained message index.
#[async_trait]
pub trait RetainedStore: Send + Sync {
    /// Store the retained message for its topic, replacing any previous
    /// one. An empty payload deletes instead.
    async fn store(&self, message: RetainedMessage) -> Result<(), StoreError>;

    async fn delete(&self, topic: &str) -> Result<(), StoreError>;

    /// All non-expired retained messages whose topic matches `filter`.
    async fn matching(
        &self,
        filter: &str,
        now: SystemTime,
    ) -> Result<Vec<RetainedMessage>, StoreError>;

    /// Drop retained messages whose message expiry elapsed; returns the
    /// number removed.
    async fn prune_expired(&self, now: SystemTime) -> Result<usize, StoreError>;

    fn shutdown(&self);
}

/// In-memory `RetainedStore`.
pub struct MemoryRetainedStore {
    messages: RwLock<BTreeMap<String, RetainedMessage>>,
    closed: AtomicBool,
}

impl MemoryRetainedStore {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(StoreError::Shutdown);
        }
        Ok(())
    }
}

impl Default for MemoryRetainedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RetainedStore for MemoryRetainedStore {
    async fn store(&self, message: RetainedMessage) -> Result<(), StoreError> {
        self.guard()?;
        let mut messages = self.messages.write();
        if message.payload.is_empty() {
            messages.remove(&message.topic);
        } else {
            messages.insert(message.topic.clone(), message);
        }
        Ok(())
    }

    async fn delete(&self, topic: &str) -> Result<(), StoreError> {
        self.guard()?;
        self.messages.write().remove(topic);
        Ok(())
    }

    async fn matching(
        &self,
        filter: &str,
        now: SystemTime,
    ) -> Result<Vec<RetainedMessage>, StoreError> {
        self.guard()?;
        let messages = self.messages.read();
        Ok(messages
            .values()
            .filter(|m| !m.is_expired_at(now) && topic::matches(filter, &m.topic))
            .cloned()
            .collect())
    }

    async fn prune_expired(&self, now: SystemTime) -> Result<usize, StoreError> {
        self.guard()?;
        let mut messages = self.messages.write();
        let before = messages.len();
        messages.retain(|_, m| !m.is_expired_at(now));
        Ok(before - messages.len())
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn retained(topic: &str, payload: &'static [u8]) -> RetainedMessage {
        RetainedMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(payload),
            qos: QoS::AtLeastOnce,
            properties: None,
            expires_at: None,
        }
    }

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_000_000)
    }

    #[tokio::test]
    async fn empty_payload_deletes() {
        let store = MemoryRetainedStore::new();
        store.store(retained("a/b", b"v1")).await.unwrap();
        assert_eq!(store.matching("a/b", now()).await.unwrap().len(), 1);
        store.store(retained("a/b", b"")).await.unwrap();
        assert!(store.matching("a/b", now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn newer_publish_replaces() {
        let store = MemoryRetainedStore::new();
        store.store(retained("a", b"v1")).await.unwrap();
        store.store(retained("a", b"v2")).await.unwrap();
        let found = store.matching("a", now()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(&found[0].payload[..], b"v2");
    }

    #[tokio::test]
    async fn wildcard_replay_respects_dollar_rule() {
        let store = MemoryRetainedStore::new();
        store.store(retained("a/b", b"x")).await.unwrap();
        store.store(retained("$SYS/version", b"1")).await.unwrap();
        let found = store.matching("#", now()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].topic, "a/b");
    }

    #[tokio::test]
    async fn expired_messages_are_invisible_and_prunable() {
        let store = MemoryRetainedStore::new();
        let mut message = retained("a", b"v");
        message.expires_at = Some(now());
        store.store(message).await.unwrap();
        assert!(store.matching("a", now()).await.unwrap().is_empty());
        assert_eq!(store.prune_expired(now()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replay_downgrades_qos() {
        let message = retained("a", b"v");
        let deliverable = message.to_message(QoS::AtMostOnce, vec![3]);
        assert_eq!(deliverable.qos, QoS::AtMostOnce);
        assert!(deliverable.retain);
        assert_eq!(deliverable.subscription_ids, vec![3]);
    }
}
