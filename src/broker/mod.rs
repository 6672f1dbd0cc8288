//! Broker assembly: shared context, the connection registry and shutdown.

pub mod connection;
pub mod delivery;
pub mod listener;
pub mod sweeper;

use crate::core::config::Config;
use crate::core::time::{Clock, SystemClock};
use crate::store::{
    AllowAll, Authenticator, MemoryRetainedStore, MemorySessionStore, MemorySubscriptionStore,
    RetainedStore, SessionLimits, SessionStore, SubscriptionStore,
};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// Signals addressed to a live connection actor. Sessions never point back
/// at their actor; everything goes through this handle in the registry.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    /// Nudge the writer to drain the session queue.
    wake: Arc<Notify>,
    /// Ask the actor to close; the reason is picked up once.
    close: Arc<CloseSignal>,
}

pub struct CloseSignal {
    requested: AtomicBool,
    reason: Mutex<Option<CloseRequest>>,
    notify: Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseRequest {
    /// Another connection presented the same ClientId.
    Takeover,
    /// The broker is terminating.
    Shutdown,
}

impl CloseSignal {
    fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            reason: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn request(&self, reason: CloseRequest) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.requested.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn requested(&self) -> Option<CloseRequest> {
        if self.requested.load(Ordering::Acquire) {
            *self.reason.lock()
        } else {
            None
        }
    }

    pub async fn notified(&self) {
        if self.requested.load(Ordering::Acquire) {
            return;
        }
        self.notify.notified().await;
    }
}

impl ConnectionHandle {
    fn new(id: u64) -> Self {
        Self {
            id,
            wake: Arc::new(Notify::new()),
            close: Arc::new(CloseSignal::new()),
        }
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub(crate) fn close_signal(&self) -> Arc<CloseSignal> {
        self.close.clone()
    }
}

/// `client_id → actor handle`, updated atomically on connect/disconnect so
/// takeover is well-defined.
#[derive(Default)]
pub struct Registry {
    next_id: AtomicU64,
    handles: Mutex<HashMap<String, ConnectionHandle>>,
}

impl Registry {
    /// Install a fresh handle for this client, returning both it and any
    /// displaced predecessor (which the caller signals to close).
    pub fn register(&self, client_id: &str) -> (ConnectionHandle, Option<ConnectionHandle>) {
        let handle = ConnectionHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let previous = self
            .handles
            .lock()
            .insert(client_id.to_string(), handle.clone());
        (handle, previous)
    }

    /// Remove the entry only if `handle` is still the registered owner; a
    /// taken-over actor must not unregister its successor.
    pub fn deregister(&self, client_id: &str, handle: &ConnectionHandle) {
        let mut handles = self.handles.lock();
        if handles.get(client_id).is_some_and(|h| h.id == handle.id) {
            handles.remove(client_id);
        }
    }

    pub fn get(&self, client_id: &str) -> Option<ConnectionHandle> {
        self.handles.lock().get(client_id).cloned()
    }

    pub fn drain(&self) -> Vec<ConnectionHandle> {
        self.handles.lock().values().cloned().collect()
    }
}

/// Shared state every actor and the delivery pipeline reach through.
pub struct BrokerCore<C: Clock> {
    pub cfg: Config,
    pub clock: C,
    pub sessions: Arc<dyn SessionStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub retained: Arc<dyn RetainedStore>,
    pub auth: Arc<dyn Authenticator>,
    pub registry: Registry,
    /// Round-robin cursors per shared-subscription (filter, group).
    pub shared_cursors: Mutex<HashMap<(String, String), usize>>,
    closing: AtomicBool,
    close_notify: Notify,
}

impl<C: Clock> BrokerCore<C> {
    pub fn begin_shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
        self.sessions.shutdown();
        self.subscriptions.shutdown();
        self.retained.shutdown();
        for handle in self.registry.drain() {
            handle.close_signal().request(CloseRequest::Shutdown);
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub async fn closed(&self) {
        if self.is_closing() {
            return;
        }
        self.close_notify.notified().await;
    }
}

/// The broker: stores, registry and listeners behind one entry point.
pub struct Broker<C: Clock = SystemClock> {
    core: Arc<BrokerCore<C>>,
}

impl<C: Clock> Clone for Broker<C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl Broker<SystemClock> {
    /// In-memory broker with the default clock and allow-all authenticator.
    pub fn new(cfg: Config) -> Self {
        Self::with_clock(cfg, SystemClock)
    }
}

impl<C: Clock> Broker<C> {
    pub fn with_clock(cfg: Config, clock: C) -> Self {
        let limits = SessionLimits {
            max_queue_messages: cfg.mqtt.max_queue_messages,
            max_inflight: cfg.mqtt.max_inflight,
            queue_qos0: cfg.mqtt.queue_qos0_messages,
            inflight_expiry: cfg.mqtt.inflight_expiry(),
        };
        Self::with_stores(
            cfg,
            clock,
            Arc::new(MemorySessionStore::new(limits)),
            Arc::new(MemorySubscriptionStore::new()),
            Arc::new(MemoryRetainedStore::new()),
            Arc::new(AllowAll),
        )
    }

    pub fn with_stores(
        cfg: Config,
        clock: C,
        sessions: Arc<dyn SessionStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        retained: Arc<dyn RetainedStore>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            core: Arc::new(BrokerCore {
                cfg,
                clock,
                sessions,
                subscriptions,
                retained,
                auth,
                registry: Registry::default(),
                shared_cursors: Mutex::new(HashMap::new()),
                closing: AtomicBool::new(false),
                close_notify: Notify::new(),
            }),
        }
    }

    pub fn core(&self) -> &Arc<BrokerCore<C>> {
        &self.core
    }

    /// Drive one client connection over any byte stream. This is the seam
    /// a WebSocket adapter (or a test duplex pipe) plugs into.
    pub async fn handle_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        connection::serve_connection(self.core.clone(), stream).await;
    }

    /// Bind the TCP listener, start the sweeper and accept until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind = self.core.cfg.listeners.tcp.clone();
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("failed to bind TCP listener on {bind}"))?;
        tracing::info!("tcp listener bound on {bind}");
        if let Some(ws) = &self.core.cfg.listeners.websocket {
            tracing::warn!(
                "websocket listener {ws} configured but no upgrade adapter is wired in this build"
            );
        }

        let sweeper = {
            let core = self.core.clone();
            tokio::spawn(sweeper::run(core))
        };
        listener::run_tcp(self.core.clone(), listener).await;
        sweeper.abort();
        Ok(())
    }

    /// Begin termination: stop accepting, close actors, fence the stores.
    pub fn shutdown(&self) {
        tracing::info!("broker shutting down");
        self.core.begin_shutdown();
    }
}
