//! Store capability traits and the shared message shapes they exchange.
//!
//! The broker core talks to sessions, subscriptions and retained messages
//! only through the traits in this module; the bundled implementations are
//! in-memory, and an external backend can replace any of them by honoring
//! the same contracts. Persisted shapes derive serde so a durable backend
//! can serialize them as-is.

pub mod auth;
pub mod retained;
pub mod session;
pub mod subscription;

use crate::protocol::{PublishProperties, QoS, WillProperties};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

pub use auth::{AllowAll, AuthPrincipal, Authenticator};
pub use retained::{MemoryRetainedStore, RetainedMessage, RetainedStore};
pub use session::{
    DetachOutcome, EnqueueOutcome, MemorySessionStore, OpenOutcome, SessionLimits, SessionStore,
    SweepReport,
};
pub use subscription::{
    ClientSubscription, MemorySubscriptionStore, SharedMatch, SubscriptionOptions,
    SubscriptionStore, TopicMatches,
};

/// A per-recipient outbound message: the result of routing one PUBLISH to
/// one subscriber, QoS already downgraded and options already applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Subscription identifiers to forward (v5); merged across matching
    /// subscriptions in `onlyonce` delivery.
    pub subscription_ids: Vec<u32>,
    /// Publisher-supplied v5 properties minus the topic alias.
    pub properties: Option<PublishProperties>,
    /// Absolute expiry; queued messages past this point are dropped and the
    /// remaining lifetime is re-encoded on egress.
    pub expires_at: Option<SystemTime>,
}

impl Message {
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Remaining lifetime in whole seconds, zero when already due.
    pub fn remaining_ttl(&self, now: SystemTime) -> Option<u32> {
        self.expires_at.map(|at| {
            at.duration_since(now)
                .map(|d| d.as_secs().min(u64::from(u32::MAX)) as u32)
                .unwrap_or(0)
        })
    }
}

/// An inbound QoS 2 PUBLISH parked between PUBREC and PUBREL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Option<PublishProperties>,
}

/// A Will registered at CONNECT, held by the session until the connection
/// ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub delay: Duration,
    pub properties: Option<WillProperties>,
}
