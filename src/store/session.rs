//! Session store: durable-across-reconnect per-client state.
//!
//! A session owns the outgoing queue, the outbound inflight window with its
//! packet-identifier allocator, the inbound QoS 2 pending set and the Will
//! registered at CONNECT. The in-memory implementation keeps one mutex per
//! session behind a read-mostly map, so connection actors and the delivery
//! pipeline contend only on the sessions they actually touch. Every
//! operation takes the caller's clock reading; the store itself never looks
//! at wall time.

use crate::error::StoreError;
use crate::protocol::QoS;
use crate::store::{InboundPublish, Message, StoredWill};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Limits the store enforces per session.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Bound on `|queue| + |inflight|`.
    pub max_queue_messages: usize,
    /// Outbound inflight window for QoS 1/2.
    pub max_inflight: usize,
    /// Queue QoS 0 messages for offline sessions.
    pub queue_qos0: bool,
    /// Unacknowledged inflight lifetime; evicted only under queue pressure.
    pub inflight_expiry: Duration,
}

/// What `enqueue` did with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub accepted: bool,
    /// Messages evicted from the queue or inflight window to make room.
    pub evicted: usize,
}

/// What `open` handed back: resume status plus the connection's fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOutcome {
    pub resumed: bool,
    pub epoch: u64,
}

/// What `detach` decided about the session's Will.
#[derive(Debug, Default)]
pub struct DetachOutcome {
    /// Fire this Will immediately (no delay, or the session ended).
    pub will_now: Option<StoredWill>,
    /// A Will was armed to fire at this time.
    pub will_later: Option<SystemTime>,
    /// The session itself was discarded (expiry zero).
    pub removed: bool,
}

/// Result of one sweeper pass.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Sessions dropped because their expiry elapsed.
    pub expired_clients: Vec<String>,
    /// Wills that came due (including those of just-expired sessions).
    pub wills: Vec<(String, StoredWill)>,
    /// Queued messages pruned for message expiry.
    pub pruned_messages: usize,
}

/// Per-client session state behind an abstract capability.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create or resume the session. `resumed` is true only when
    /// `clean_start` is false and a non-expired session existed; any other
    /// combination discards prior state and starts fresh. The returned
    /// epoch fences the connection that opened the session: a displaced
    /// connection's late `detach` carries a stale epoch and is ignored.
    async fn open(
        &self,
        client_id: &str,
        clean_start: bool,
        expiry: Duration,
        will: Option<StoredWill>,
        now: SystemTime,
    ) -> Result<OpenOutcome, StoreError>;

    /// Append to the outgoing queue, applying the drop policy on overflow.
    async fn enqueue(
        &self,
        client_id: &str,
        message: Message,
        now: SystemTime,
    ) -> Result<EnqueueOutcome, StoreError>;

    /// Pop the next message the writer may send: QoS 0 always, QoS 1/2
    /// only while the inflight window has room. Expired messages at the
    /// head are discarded.
    async fn next_deliverable(
        &self,
        client_id: &str,
        now: SystemTime,
    ) -> Result<Option<Message>, StoreError>;

    /// Return a message popped by `next_deliverable` to the queue head;
    /// packet-identifier exhaustion leaves the message queued.
    async fn requeue_front(&self, client_id: &str, message: Message) -> Result<(), StoreError>;

    /// Allocate an unused packet identifier, skipping values still held by
    /// the inflight window or a pending PUBREL.
    async fn alloc_pid(&self, client_id: &str) -> Result<u16, StoreError>;

    async fn mark_inflight(
        &self,
        client_id: &str,
        pid: u16,
        message: Message,
        now: SystemTime,
    ) -> Result<(), StoreError>;

    /// Terminal (QoS 1) or first (QoS 2) acknowledgment of an inflight
    /// message; returns it if the identifier was known.
    async fn ack_inflight(&self, client_id: &str, pid: u16) -> Result<Option<Message>, StoreError>;

    /// PUBREC received: move the identifier from inflight to
    /// PUBREL-pending. True if the identifier is (still) awaiting PUBCOMP.
    async fn store_pubrel(&self, client_id: &str, pid: u16) -> Result<bool, StoreError>;

    /// PUBCOMP received: release the identifier.
    async fn drop_pubrel(&self, client_id: &str, pid: u16) -> Result<bool, StoreError>;

    /// Park an inbound QoS 2 publish until its PUBREL arrives.
    async fn remember_in(
        &self,
        client_id: &str,
        pid: u16,
        publish: InboundPublish,
    ) -> Result<(), StoreError>;

    async fn seen_in(&self, client_id: &str, pid: u16) -> Result<bool, StoreError>;

    /// PUBREL received: hand back the parked publish for committing.
    async fn take_in(
        &self,
        client_id: &str,
        pid: u16,
    ) -> Result<Option<InboundPublish>, StoreError>;

    /// Number of unreleased inbound QoS 2 identifiers (receive maximum).
    async fn inbound_pending(&self, client_id: &str) -> Result<usize, StoreError>;

    /// Inflight messages (in identifier order) and pending PUBRELs to
    /// retransmit after a resume.
    async fn resend_set(
        &self,
        client_id: &str,
    ) -> Result<(Vec<(u16, Message)>, Vec<u16>), StoreError>;

    /// Override the session expiry (v5 DISCONNECT may lower it).
    async fn set_expiry(&self, client_id: &str, expiry: Duration) -> Result<(), StoreError>;

    /// Connection ended. A normal disconnect discards the Will; an abnormal
    /// one schedules it after its delay, capped by the session lifetime.
    /// No-op when `epoch` is stale, i.e. the session has since been handed
    /// to a newer connection.
    async fn detach(
        &self,
        client_id: &str,
        epoch: u64,
        normal: bool,
        now: SystemTime,
    ) -> Result<DetachOutcome, StoreError>;

    /// Atomically claim a Will that has come due; at most one caller wins.
    async fn take_due_will(
        &self,
        client_id: &str,
        now: SystemTime,
    ) -> Result<Option<StoredWill>, StoreError>;

    /// Drop expired sessions, prune expired queued messages, collect due
    /// Wills.
    async fn expire_sweep(&self, now: SystemTime) -> Result<SweepReport, StoreError>;

    fn shutdown(&self);
}

struct InflightEntry {
    message: Message,
    sent_at: SystemTime,
}

struct SessionState {
    /// Bumped on every open; fences stale detaches after takeover.
    epoch: u64,
    expiry: Duration,
    connected: bool,
    last_disconnect_at: Option<SystemTime>,
    will: Option<StoredWill>,
    will_due_at: Option<SystemTime>,
    queue: VecDeque<Message>,
    inflight: BTreeMap<u16, InflightEntry>,
    pubrel_pending: BTreeSet<u16>,
    pending_in: HashMap<u16, InboundPublish>,
    next_pid: u16,
}

impl SessionState {
    fn fresh(expiry: Duration, will: Option<StoredWill>) -> Self {
        Self {
            epoch: 0,
            expiry,
            connected: true,
            last_disconnect_at: None,
            will,
            will_due_at: None,
            queue: VecDeque::new(),
            inflight: BTreeMap::new(),
            pubrel_pending: BTreeSet::new(),
            pending_in: HashMap::new(),
            next_pid: 1,
        }
    }

    fn expired_at(&self, now: SystemTime) -> bool {
        if self.connected {
            return false;
        }
        match self.last_disconnect_at {
            Some(at) => now >= at + self.expiry,
            None => false,
        }
    }

    fn pid_in_use(&self, pid: u16) -> bool {
        self.inflight.contains_key(&pid) || self.pubrel_pending.contains(&pid)
    }

    fn occupancy(&self) -> usize {
        self.queue.len() + self.inflight.len()
    }
}

/// In-memory `SessionStore`.
pub struct MemorySessionStore {
    limits: SessionLimits,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionState>>>>,
    closed: AtomicBool,
}

impl MemorySessionStore {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            limits,
            sessions: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(StoreError::Shutdown);
        }
        Ok(())
    }

    fn session(&self, client_id: &str) -> Result<Arc<Mutex<SessionState>>, StoreError> {
        self.guard()?;
        self.sessions
            .read()
            .get(client_id)
            .cloned()
            .ok_or_else(|| StoreError::SessionGone(client_id.to_string()))
    }

    /// Drop-policy pass: free one slot, preferring cheap losses first.
    /// Returns false when nothing could be evicted.
    fn evict_one(state: &mut SessionState, limits: &SessionLimits, now: SystemTime) -> bool {
        if let Some(pos) = state.queue.iter().position(|m| m.is_expired_at(now)) {
            state.queue.remove(pos);
            return true;
        }
        let expired_inflight = state
            .inflight
            .iter()
            .find(|(_, e)| now >= e.sent_at + limits.inflight_expiry)
            .map(|(pid, _)| *pid);
        if let Some(pid) = expired_inflight {
            state.inflight.remove(&pid);
            return true;
        }
        if let Some(pos) = state.queue.iter().position(|m| m.qos == QoS::AtMostOnce) {
            state.queue.remove(pos);
            return true;
        }
        false
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn open(
        &self,
        client_id: &str,
        clean_start: bool,
        expiry: Duration,
        will: Option<StoredWill>,
        now: SystemTime,
    ) -> Result<OpenOutcome, StoreError> {
        self.guard()?;
        let mut sessions = self.sessions.write();
        if !clean_start {
            if let Some(existing) = sessions.get(client_id) {
                let mut state = existing.lock();
                if !state.expired_at(now) {
                    state.epoch += 1;
                    state.connected = true;
                    state.last_disconnect_at = None;
                    state.expiry = expiry;
                    state.will = will;
                    state.will_due_at = None;
                    return Ok(OpenOutcome {
                        resumed: true,
                        epoch: state.epoch,
                    });
                }
            }
        }
        sessions.insert(
            client_id.to_string(),
            Arc::new(Mutex::new(SessionState::fresh(expiry, will))),
        );
        Ok(OpenOutcome {
            resumed: false,
            epoch: 0,
        })
    }

    async fn enqueue(
        &self,
        client_id: &str,
        message: Message,
        now: SystemTime,
    ) -> Result<EnqueueOutcome, StoreError> {
        let session = self.session(client_id)?;
        let mut state = session.lock();

        if message.is_expired_at(now) {
            return Ok(EnqueueOutcome {
                accepted: false,
                evicted: 0,
            });
        }
        if !state.connected && message.qos == QoS::AtMostOnce && !self.limits.queue_qos0 {
            return Ok(EnqueueOutcome {
                accepted: false,
                evicted: 0,
            });
        }

        let mut evicted = 0;
        while state.occupancy() >= self.limits.max_queue_messages {
            if Self::evict_one(&mut state, &self.limits, now) {
                evicted += 1;
                continue;
            }
            // Only QoS 1/2 queue entries are left to sacrifice.
            if message.qos == QoS::AtMostOnce || state.queue.is_empty() {
                return Ok(EnqueueOutcome {
                    accepted: false,
                    evicted,
                });
            }
            state.queue.pop_front();
            evicted += 1;
        }
        state.queue.push_back(message);
        Ok(EnqueueOutcome {
            accepted: true,
            evicted,
        })
    }

    async fn next_deliverable(
        &self,
        client_id: &str,
        now: SystemTime,
    ) -> Result<Option<Message>, StoreError> {
        let session = self.session(client_id)?;
        let mut state = session.lock();
        loop {
            let Some(head) = state.queue.front() else {
                return Ok(None);
            };
            if head.is_expired_at(now) {
                state.queue.pop_front();
                continue;
            }
            if head.qos != QoS::AtMostOnce && state.inflight.len() >= self.limits.max_inflight {
                return Ok(None);
            }
            return Ok(state.queue.pop_front());
        }
    }

    async fn requeue_front(&self, client_id: &str, message: Message) -> Result<(), StoreError> {
        let session = self.session(client_id)?;
        session.lock().queue.push_front(message);
        Ok(())
    }

    async fn alloc_pid(&self, client_id: &str) -> Result<u16, StoreError> {
        let session = self.session(client_id)?;
        let mut state = session.lock();
        for _ in 0..=u32::from(u16::MAX) {
            let pid = state.next_pid;
            state.next_pid = if pid == u16::MAX { 1 } else { pid + 1 };
            if !state.pid_in_use(pid) {
                return Ok(pid);
            }
        }
        Err(StoreError::PacketIdentifiersExhausted)
    }

    async fn mark_inflight(
        &self,
        client_id: &str,
        pid: u16,
        message: Message,
        now: SystemTime,
    ) -> Result<(), StoreError> {
        let session = self.session(client_id)?;
        let mut state = session.lock();
        debug_assert!(!state.pid_in_use(pid), "packet id {pid} already tracked");
        state.inflight.insert(
            pid,
            InflightEntry {
                message,
                sent_at: now,
            },
        );
        Ok(())
    }

    async fn ack_inflight(&self, client_id: &str, pid: u16) -> Result<Option<Message>, StoreError> {
        let session = self.session(client_id)?;
        let mut state = session.lock();
        Ok(state.inflight.remove(&pid).map(|e| e.message))
    }

    async fn store_pubrel(&self, client_id: &str, pid: u16) -> Result<bool, StoreError> {
        let session = self.session(client_id)?;
        let mut state = session.lock();
        if state.inflight.remove(&pid).is_some() {
            state.pubrel_pending.insert(pid);
            return Ok(true);
        }
        Ok(state.pubrel_pending.contains(&pid))
    }

    async fn drop_pubrel(&self, client_id: &str, pid: u16) -> Result<bool, StoreError> {
        let session = self.session(client_id)?;
        let mut state = session.lock();
        Ok(state.pubrel_pending.remove(&pid))
    }

    async fn remember_in(
        &self,
        client_id: &str,
        pid: u16,
        publish: InboundPublish,
    ) -> Result<(), StoreError> {
        let session = self.session(client_id)?;
        let mut state = session.lock();
        state.pending_in.entry(pid).or_insert(publish);
        Ok(())
    }

    async fn seen_in(&self, client_id: &str, pid: u16) -> Result<bool, StoreError> {
        let session = self.session(client_id)?;
        let state = session.lock();
        Ok(state.pending_in.contains_key(&pid))
    }

    async fn take_in(
        &self,
        client_id: &str,
        pid: u16,
    ) -> Result<Option<InboundPublish>, StoreError> {
        let session = self.session(client_id)?;
        let mut state = session.lock();
        Ok(state.pending_in.remove(&pid))
    }

    async fn inbound_pending(&self, client_id: &str) -> Result<usize, StoreError> {
        let session = self.session(client_id)?;
        let state = session.lock();
        Ok(state.pending_in.len())
    }

    async fn resend_set(
        &self,
        client_id: &str,
    ) -> Result<(Vec<(u16, Message)>, Vec<u16>), StoreError> {
        let session = self.session(client_id)?;
        let state = session.lock();
        let inflight = state
            .inflight
            .iter()
            .map(|(pid, e)| (*pid, e.message.clone()))
            .collect();
        let pubrels = state.pubrel_pending.iter().copied().collect();
        Ok((inflight, pubrels))
    }

    async fn set_expiry(&self, client_id: &str, expiry: Duration) -> Result<(), StoreError> {
        let session = self.session(client_id)?;
        session.lock().expiry = expiry;
        Ok(())
    }

    async fn detach(
        &self,
        client_id: &str,
        epoch: u64,
        normal: bool,
        now: SystemTime,
    ) -> Result<DetachOutcome, StoreError> {
        let session = self.session(client_id)?;
        let mut outcome = DetachOutcome::default();
        let remove = {
            let mut state = session.lock();
            if state.epoch != epoch {
                // A newer connection owns this session now.
                return Ok(outcome);
            }
            state.connected = false;
            state.last_disconnect_at = Some(now);
            let will = state.will.take();
            if let Some(will) = will {
                if !normal {
                    // Delay is bounded by the session lifetime: the Will
                    // fires no later than the session ends.
                    let effective = will.delay.min(state.expiry);
                    if effective.is_zero() {
                        outcome.will_now = Some(will);
                    } else {
                        let due = now + effective;
                        state.will_due_at = Some(due);
                        state.will = Some(will);
                        outcome.will_later = Some(due);
                    }
                }
            }
            state.expiry.is_zero()
        };
        if remove {
            self.sessions.write().remove(client_id);
            outcome.removed = true;
        }
        Ok(outcome)
    }

    async fn take_due_will(
        &self,
        client_id: &str,
        now: SystemTime,
    ) -> Result<Option<StoredWill>, StoreError> {
        let session = match self.session(client_id) {
            Ok(session) => session,
            Err(StoreError::SessionGone(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let mut state = session.lock();
        match state.will_due_at {
            Some(due) if now >= due => {
                state.will_due_at = None;
                Ok(state.will.take())
            }
            _ => Ok(None),
        }
    }

    async fn expire_sweep(&self, now: SystemTime) -> Result<SweepReport, StoreError> {
        self.guard()?;
        let mut report = SweepReport::default();
        let snapshot: Vec<(String, Arc<Mutex<SessionState>>)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();

        for (client_id, session) in snapshot {
            let mut state = session.lock();
            if let Some(due) = state.will_due_at {
                if now >= due {
                    state.will_due_at = None;
                    if let Some(will) = state.will.take() {
                        report.wills.push((client_id.clone(), will));
                    }
                }
            }
            let before = state.queue.len();
            state.queue.retain(|m| !m.is_expired_at(now));
            report.pruned_messages += before - state.queue.len();

            if state.expired_at(now) {
                // A still-armed Will fires when the session ends.
                state.will_due_at = None;
                if let Some(will) = state.will.take() {
                    report.wills.push((client_id.clone(), will));
                }
                report.expired_clients.push(client_id);
            }
        }

        if !report.expired_clients.is_empty() {
            let mut sessions = self.sessions.write();
            for client_id in &report.expired_clients {
                // Re-check under the write lock: the client may have
                // resumed between the scan and now.
                let still_expired = sessions
                    .get(client_id)
                    .is_some_and(|s| s.lock().expired_at(now));
                if still_expired {
                    sessions.remove(client_id);
                }
            }
        }
        Ok(report)
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::UNIX_EPOCH;

    fn limits(max_queue: usize, max_inflight: usize) -> SessionLimits {
        SessionLimits {
            max_queue_messages: max_queue,
            max_inflight,
            queue_qos0: true,
            inflight_expiry: Duration::from_secs(30),
        }
    }

    fn msg(topic: &str, qos: QoS) -> Message {
        Message {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"x"),
            qos,
            retain: false,
            subscription_ids: Vec::new(),
            properties: None,
            expires_at: None,
        }
    }

    fn t0() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_000_000)
    }

    async fn open_store(limits: SessionLimits) -> MemorySessionStore {
        let store = MemorySessionStore::new(limits);
        store
            .open("c1", true, Duration::from_secs(60), None, t0())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn resume_requires_prior_nonexpired_session() {
        let store = MemorySessionStore::new(limits(10, 5));
        let now = t0();
        let opened = store
            .open("c", false, Duration::from_secs(60), None, now)
            .await
            .unwrap();
        assert!(!opened.resumed);
        store.detach("c", opened.epoch, true, now).await.unwrap();
        let opened = store
            .open("c", false, Duration::from_secs(60), None, now + Duration::from_secs(30))
            .await
            .unwrap();
        assert!(opened.resumed);
        store
            .detach("c", opened.epoch, true, now + Duration::from_secs(30))
            .await
            .unwrap();
        // Past the expiry interval the session is gone.
        let opened = store
            .open("c", false, Duration::from_secs(60), None, now + Duration::from_secs(120))
            .await
            .unwrap();
        assert!(!opened.resumed);
    }

    #[tokio::test]
    async fn stale_detach_after_takeover_is_ignored() {
        let store = MemorySessionStore::new(limits(10, 5));
        let now = t0();
        let first = store
            .open("c", false, Duration::from_secs(60), None, now)
            .await
            .unwrap();
        // A second connection resumes the session before the first one
        // finished closing.
        let second = store
            .open("c", false, Duration::from_secs(60), None, now)
            .await
            .unwrap();
        assert!(second.resumed);
        let outcome = store.detach("c", first.epoch, false, now).await.unwrap();
        assert!(outcome.will_now.is_none() && outcome.will_later.is_none());
        // The session still looks connected to its new owner.
        let session = store.session("c").unwrap();
        assert!(session.lock().connected);
    }

    #[tokio::test]
    async fn clean_start_discards_previous_state() {
        let store = open_store(limits(10, 5)).await;
        store.enqueue("c1", msg("t", QoS::AtLeastOnce), t0()).await.unwrap();
        store
            .open("c1", true, Duration::from_secs(60), None, t0())
            .await
            .unwrap();
        assert!(store.next_deliverable("c1", t0()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pid_allocation_skips_in_use_and_wraps() {
        let store = open_store(limits(10, 5)).await;
        let pid1 = store.alloc_pid("c1").await.unwrap();
        assert_eq!(pid1, 1);
        store
            .mark_inflight("c1", pid1, msg("t", QoS::AtLeastOnce), t0())
            .await
            .unwrap();
        assert_eq!(store.alloc_pid("c1").await.unwrap(), 2);
        // Force the counter near the wrap point.
        {
            let session = store.session("c1").unwrap();
            session.lock().next_pid = u16::MAX;
        }
        assert_eq!(store.alloc_pid("c1").await.unwrap(), u16::MAX);
        // Wraps past 0 straight to 1, which is busy, so 2 comes back.
        assert_eq!(store.alloc_pid("c1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn inflight_window_gates_qos1_but_not_qos0() {
        let store = open_store(limits(10, 1)).await;
        let now = t0();
        store.enqueue("c1", msg("a", QoS::AtLeastOnce), now).await.unwrap();
        store.enqueue("c1", msg("b", QoS::AtLeastOnce), now).await.unwrap();

        let first = store.next_deliverable("c1", now).await.unwrap().unwrap();
        let pid = store.alloc_pid("c1").await.unwrap();
        store.mark_inflight("c1", pid, first, now).await.unwrap();
        // Window full: QoS 1 head stays put.
        assert!(store.next_deliverable("c1", now).await.unwrap().is_none());

        store.enqueue("c1", msg("z", QoS::AtMostOnce), now).await.unwrap();
        // ...but QoS 0 does not occupy the window. It sits behind the QoS 1
        // head, so the head still blocks delivery here.
        assert!(store.next_deliverable("c1", now).await.unwrap().is_none());

        store.ack_inflight("c1", pid).await.unwrap().unwrap();
        let second = store.next_deliverable("c1", now).await.unwrap().unwrap();
        assert_eq!(second.topic, "b");
    }

    #[tokio::test]
    async fn drop_policy_prefers_expired_then_qos0() {
        let store = open_store(limits(3, 3)).await;
        let now = t0();
        let mut expired = msg("old", QoS::AtLeastOnce);
        expired.expires_at = Some(now - Duration::from_secs(1));
        store.enqueue("c1", expired, now - Duration::from_secs(10)).await.unwrap();
        store.enqueue("c1", msg("q0", QoS::AtMostOnce), now).await.unwrap();
        store.enqueue("c1", msg("q1", QoS::AtLeastOnce), now).await.unwrap();

        // Queue full: the expired entry goes first.
        let outcome = store.enqueue("c1", msg("new1", QoS::AtLeastOnce), now).await.unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.evicted, 1);

        // Full again: now the oldest QoS 0 is sacrificed.
        let outcome = store.enqueue("c1", msg("new2", QoS::AtLeastOnce), now).await.unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.evicted, 1);

        // Only QoS 1 left; an incoming QoS 0 is the one dropped.
        let outcome = store.enqueue("c1", msg("in0", QoS::AtMostOnce), now).await.unwrap();
        assert!(!outcome.accepted);

        // An incoming QoS 1 displaces the oldest queued QoS 1.
        let outcome = store.enqueue("c1", msg("new3", QoS::AtLeastOnce), now).await.unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.evicted, 1);
        assert_eq!(
            store.next_deliverable("c1", now).await.unwrap().unwrap().topic,
            "new1"
        );
    }

    #[tokio::test]
    async fn queue_bound_holds_under_churn() {
        let store = open_store(limits(5, 2)).await;
        let now = t0();
        for i in 0..20 {
            store
                .enqueue("c1", msg(&format!("t{i}"), QoS::AtLeastOnce), now)
                .await
                .unwrap();
        }
        let session = store.session("c1").unwrap();
        let state = session.lock();
        assert!(state.occupancy() <= 5);
    }

    #[tokio::test]
    async fn qos2_inbound_is_parked_until_taken() {
        let store = open_store(limits(10, 5)).await;
        let publish = InboundPublish {
            topic: "t".into(),
            payload: Bytes::from_static(b"p"),
            qos: QoS::ExactlyOnce,
            retain: false,
            properties: None,
        };
        store.remember_in("c1", 7, publish.clone()).await.unwrap();
        assert!(store.seen_in("c1", 7).await.unwrap());
        assert_eq!(store.inbound_pending("c1").await.unwrap(), 1);
        // A duplicate PUBLISH with the same id does not replace the parked one.
        store.remember_in("c1", 7, publish.clone()).await.unwrap();
        assert_eq!(store.take_in("c1", 7).await.unwrap().unwrap(), publish);
        assert!(store.take_in("c1", 7).await.unwrap().is_none());
        assert!(!store.seen_in("c1", 7).await.unwrap());
    }

    #[tokio::test]
    async fn abnormal_detach_arms_delayed_will() {
        let store = MemorySessionStore::new(limits(10, 5));
        let now = t0();
        let will = StoredWill {
            topic: "state".into(),
            payload: Bytes::from_static(b"gone"),
            qos: QoS::AtMostOnce,
            retain: false,
            delay: Duration::from_secs(5),
            properties: None,
        };
        let opened = store
            .open("c", false, Duration::from_secs(300), Some(will), now)
            .await
            .unwrap();
        let outcome = store.detach("c", opened.epoch, false, now).await.unwrap();
        assert!(outcome.will_now.is_none());
        assert_eq!(outcome.will_later, Some(now + Duration::from_secs(5)));

        // Not due yet.
        assert!(store
            .take_due_will("c", now + Duration::from_secs(2))
            .await
            .unwrap()
            .is_none());
        // Resume cancels it.
        store
            .open("c", false, Duration::from_secs(300), None, now + Duration::from_secs(3))
            .await
            .unwrap();
        assert!(store
            .take_due_will("c", now + Duration::from_secs(10))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn normal_detach_discards_will() {
        let store = MemorySessionStore::new(limits(10, 5));
        let now = t0();
        let will = StoredWill {
            topic: "state".into(),
            payload: Bytes::new(),
            qos: QoS::AtMostOnce,
            retain: false,
            delay: Duration::ZERO,
            properties: None,
        };
        let opened = store
            .open("c", false, Duration::from_secs(300), Some(will), now)
            .await
            .unwrap();
        let outcome = store.detach("c", opened.epoch, true, now).await.unwrap();
        assert!(outcome.will_now.is_none());
        assert!(outcome.will_later.is_none());
    }

    #[tokio::test]
    async fn sweep_drops_expired_sessions_and_fires_their_wills() {
        let store = MemorySessionStore::new(limits(10, 5));
        let now = t0();
        let will = StoredWill {
            topic: "state".into(),
            payload: Bytes::from_static(b"gone"),
            qos: QoS::AtMostOnce,
            retain: false,
            delay: Duration::from_secs(600),
            properties: None,
        };
        let opened = store
            .open("c", false, Duration::from_secs(60), Some(will), now)
            .await
            .unwrap();
        store.detach("c", opened.epoch, false, now).await.unwrap();

        let report = store.expire_sweep(now + Duration::from_secs(30)).await.unwrap();
        assert!(report.expired_clients.is_empty());

        // Session expiry (60 s) beats the Will delay (capped to it).
        let report = store.expire_sweep(now + Duration::from_secs(61)).await.unwrap();
        assert_eq!(report.expired_clients, ["c"]);
        assert_eq!(report.wills.len(), 1);
    }
}
