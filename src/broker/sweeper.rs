//! Periodic expiry sweeping: expired sessions, expired queued messages,
//! expired retained messages and Wills that came due.

use crate::broker::{delivery, BrokerCore};
use crate::core::time::Clock;
use std::sync::Arc;

/// Run the sweep loop until shutdown. Each tick is a cancellation point.
pub(crate) async fn run<C: Clock>(core: Arc<BrokerCore<C>>) {
    let interval = core.cfg.mqtt.sweep_interval();
    loop {
        tokio::select! {
            biased;
            () = core.closed() => break,
            () = core.clock.sleep(interval) => {}
        }
        sweep_once(&core).await;
    }
}

pub(crate) async fn sweep_once<C: Clock>(core: &BrokerCore<C>) {
    let now = core.clock.wall();
    match core.sessions.expire_sweep(now).await {
        Ok(report) => {
            for (client_id, will) in report.wills {
                delivery::publish_will(core, &client_id, will, now).await;
            }
            for client_id in &report.expired_clients {
                if let Err(err) = core.subscriptions.unsubscribe_all(client_id).await {
                    tracing::warn!("failed to clear subscriptions of {client_id}: {err}");
                }
            }
            if !report.expired_clients.is_empty() || report.pruned_messages > 0 {
                tracing::debug!(
                    "sweep dropped {} session(s), pruned {} message(s)",
                    report.expired_clients.len(),
                    report.pruned_messages
                );
            }
        }
        Err(err) => tracing::debug!("session sweep skipped: {err}"),
    }
    match core.retained.prune_expired(now).await {
        Ok(0) | Err(_) => {}
        Ok(pruned) => tracing::debug!("pruned {pruned} expired retained message(s)"),
    }
}
