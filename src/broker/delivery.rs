//! Delivery pipeline: one inbound PUBLISH in, per-recipient deliverables
//! out.
//!
//! Routing enumerates matching subscriptions, downgrades QoS per recipient
//! (min of publish and subscription), folds overlapping matches according
//! to the configured delivery mode, picks one shared-group member
//! round-robin, stamps expiry, enqueues into each recipient session and
//! nudges online writers.

use crate::broker::BrokerCore;
use crate::core::config::DeliveryMode;
use crate::core::time::Clock;
use crate::error::StoreError;
use crate::protocol::{PublishProperties, QoS};
use crate::store::{
    InboundPublish, Message, RetainedMessage, StoredWill, SubscriptionOptions,
};
use std::collections::HashMap;
use std::time::SystemTime;

/// Route a committed PUBLISH to every matching session. Returns the number
/// of recipients the message was enqueued for.
pub async fn route_publish<C: Clock>(
    core: &BrokerCore<C>,
    publisher: &str,
    publish: &InboundPublish,
    now: SystemTime,
) -> Result<usize, StoreError> {
    if publish.retain && core.cfg.mqtt.retain_available {
        core.retained
            .store(RetainedMessage {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
                qos: publish.qos,
                properties: forwarded_properties(&publish.properties),
                expires_at: property_expiry(&publish.properties, now),
            })
            .await?;
    }

    let matches = core.subscriptions.matches(&publish.topic).await?;
    let mut recipients: Vec<(String, SubscriptionOptions, Vec<u32>)> = Vec::new();

    match core.cfg.mqtt.delivery_mode {
        DeliveryMode::Overlap => {
            for (client_id, options) in matches.subscribers {
                if options.no_local && client_id == publisher {
                    continue;
                }
                let ids = options.subscription_id.into_iter().collect();
                recipients.push((client_id, options, ids));
            }
        }
        DeliveryMode::OnlyOnce => {
            // One delivery per recipient: max QoS, OR'd retain-as-published,
            // set-union of subscription identifiers.
            let mut merged: HashMap<String, (SubscriptionOptions, Vec<u32>)> = HashMap::new();
            for (client_id, options) in matches.subscribers {
                if options.no_local && client_id == publisher {
                    continue;
                }
                let ids: Vec<u32> = options.subscription_id.into_iter().collect();
                merged
                    .entry(client_id)
                    .and_modify(|(acc, acc_ids)| {
                        merge_options(acc, &options);
                        if let Some(id) = options.subscription_id {
                            if !acc_ids.contains(&id) {
                                acc_ids.push(id);
                            }
                        }
                    })
                    .or_insert((options, ids));
            }
            recipients.extend(
                merged
                    .into_iter()
                    .map(|(client_id, (options, ids))| (client_id, options, ids)),
            );
        }
    }

    // Shared groups deliver to exactly one member, chosen round-robin per
    // (filter, group).
    for shared in matches.shared {
        let mut members = shared.members;
        if members.is_empty() {
            continue;
        }
        members.sort_by(|a, b| a.0.cmp(&b.0));
        let idx = {
            let mut cursors = core.shared_cursors.lock();
            let cursor = cursors
                .entry((shared.filter.clone(), shared.group.clone()))
                .or_insert(0);
            let idx = *cursor % members.len();
            *cursor = cursor.wrapping_add(1);
            idx
        };
        let (client_id, options) = members.swap_remove(idx);
        let ids = options.subscription_id.into_iter().collect();
        recipients.push((client_id, options, ids));
    }

    let mut delivered = 0;
    for (client_id, options, ids) in recipients {
        let message = deliverable(core, publish, &options, ids, now);
        match core.sessions.enqueue(&client_id, message, now).await {
            Ok(outcome) => {
                if outcome.evicted > 0 {
                    tracing::debug!(
                        "queue pressure for client_id={client_id}: evicted {} message(s)",
                        outcome.evicted
                    );
                }
                if outcome.accepted {
                    delivered += 1;
                    if let Some(handle) = core.registry.get(&client_id) {
                        handle.wake();
                    }
                } else {
                    tracing::debug!(
                        "dropped publish on {} for client_id={client_id}: queue full",
                        publish.topic
                    );
                }
            }
            Err(StoreError::SessionGone(_)) => {
                // Raced with expiry or a clean-start teardown; nothing owed.
            }
            Err(err) => return Err(err),
        }
    }
    Ok(delivered)
}

/// Replay retained messages for one freshly subscribed filter, honoring
/// the subscription's retain-handling option.
pub async fn replay_retained<C: Clock>(
    core: &BrokerCore<C>,
    client_id: &str,
    filter: &str,
    options: &SubscriptionOptions,
    existed: bool,
    now: SystemTime,
) -> Result<(), StoreError> {
    if !core.cfg.mqtt.retain_available {
        return Ok(());
    }
    match options.retain_handling {
        crate::protocol::RetainHandling::DontSend => return Ok(()),
        crate::protocol::RetainHandling::SendIfNew if existed => return Ok(()),
        _ => {}
    }
    let ids = options.subscription_id.into_iter().collect::<Vec<_>>();
    for retained in core.retained.matching(filter, now).await? {
        let message = retained.to_message(options.max_qos, ids.clone());
        let outcome = core.sessions.enqueue(client_id, message, now).await?;
        if outcome.accepted {
            if let Some(handle) = core.registry.get(client_id) {
                handle.wake();
            }
        }
    }
    Ok(())
}

/// Publish a Will on behalf of a departed client.
pub async fn publish_will<C: Clock>(
    core: &BrokerCore<C>,
    owner: &str,
    will: StoredWill,
    now: SystemTime,
) {
    tracing::debug!("publishing will of client_id={owner} on {}", will.topic);
    let publish = InboundPublish {
        topic: will.topic,
        payload: will.payload,
        qos: will.qos.min(max_qos(core)),
        retain: will.retain,
        properties: will.properties.map(|p| PublishProperties {
            payload_format_indicator: p.payload_format_indicator,
            message_expiry_interval: p.message_expiry_interval,
            content_type: p.content_type,
            response_topic: p.response_topic,
            correlation_data: p.correlation_data,
            user_properties: p.user_properties,
            ..Default::default()
        }),
    };
    if let Err(err) = route_publish(core, owner, &publish, now).await {
        tracing::warn!("failed to route will of client_id={owner}: {err}");
    }
}

fn max_qos<C: Clock>(core: &BrokerCore<C>) -> QoS {
    match core.cfg.mqtt.maximum_qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn merge_options(acc: &mut SubscriptionOptions, other: &SubscriptionOptions) {
    acc.max_qos = acc.max_qos.max(other.max_qos);
    acc.retain_as_published |= other.retain_as_published;
}

fn deliverable<C: Clock>(
    core: &BrokerCore<C>,
    publish: &InboundPublish,
    options: &SubscriptionOptions,
    subscription_ids: Vec<u32>,
    now: SystemTime,
) -> Message {
    let expires_at = property_expiry(&publish.properties, now).or_else(|| {
        let default = core.cfg.mqtt.message_expiry();
        (!default.is_zero()).then(|| now + default)
    });
    Message {
        topic: publish.topic.clone(),
        payload: publish.payload.clone(),
        qos: publish.qos.min(options.max_qos),
        retain: options.retain_as_published && publish.retain,
        subscription_ids,
        properties: forwarded_properties(&publish.properties),
        expires_at,
    }
}

/// Properties forwarded to recipients: the topic alias is connection-local
/// and never propagates.
fn forwarded_properties(source: &Option<PublishProperties>) -> Option<PublishProperties> {
    source.as_ref().map(|p| {
        let mut out = p.clone();
        out.topic_alias = None;
        out.subscription_identifiers = Vec::new();
        out
    })
}

fn property_expiry(source: &Option<PublishProperties>, now: SystemTime) -> Option<SystemTime> {
    source
        .as_ref()
        .and_then(|p| p.message_expiry_interval)
        .map(|secs| now + std::time::Duration::from_secs(u64::from(secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::time::SystemClock;
    use crate::protocol::RetainHandling;
    use bytes::Bytes;

    fn core_with(delivery_mode: DeliveryMode) -> crate::broker::Broker {
        let mut cfg = Config::default();
        cfg.mqtt.delivery_mode = delivery_mode;
        crate::broker::Broker::with_clock(cfg, SystemClock)
    }

    fn options(max_qos: QoS, sub_id: Option<u32>) -> SubscriptionOptions {
        SubscriptionOptions {
            max_qos,
            no_local: false,
            retain_as_published: false,
            retain_handling: RetainHandling::SendAtSubscribe,
            subscription_id: sub_id,
        }
    }

    fn publish(topic: &str, qos: QoS) -> InboundPublish {
        InboundPublish {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"p"),
            qos,
            retain: false,
            properties: None,
        }
    }

    async fn subscribe<CL: Clock>(
        core: &BrokerCore<CL>,
        client: &str,
        filter: &str,
        opts: SubscriptionOptions,
    ) {
        let shared_group = match crate::topic::SharedFilter::parse(filter) {
            Some(Ok(shared)) => Some(shared.group.to_string()),
            _ => None,
        };
        core.subscriptions
            .subscribe(
                client,
                crate::store::ClientSubscription {
                    filter: filter.to_string(),
                    shared_group,
                    options: opts,
                },
            )
            .await
            .unwrap();
    }

    async fn open_session<CL: Clock>(core: &BrokerCore<CL>, client: &str) {
        core.sessions
            .open(
                client,
                true,
                std::time::Duration::from_secs(60),
                None,
                SystemTime::now(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn onlyonce_folds_overlapping_subscriptions() {
        let broker = core_with(DeliveryMode::OnlyOnce);
        let core = broker.core();
        open_session(core, "a").await;
        subscribe(core, "a", "room/+", options(QoS::AtMostOnce, Some(1))).await;
        subscribe(core, "a", "room/#", options(QoS::AtLeastOnce, Some(2))).await;

        let now = SystemTime::now();
        let delivered = route_publish(core, "p", &publish("room/kitchen", QoS::ExactlyOnce), now)
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        let message = core
            .sessions
            .next_deliverable("a", now)
            .await
            .unwrap()
            .unwrap();
        // Highest matching QoS wins, still capped by the publish QoS; the
        // subscription identifiers of both matches are forwarded.
        assert_eq!(message.qos, QoS::AtLeastOnce);
        assert_eq!(message.subscription_ids.len(), 2);
        assert!(core.sessions.next_deliverable("a", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overlap_delivers_once_per_subscription() {
        let broker = core_with(DeliveryMode::Overlap);
        let core = broker.core();
        open_session(core, "a").await;
        subscribe(core, "a", "room/+", options(QoS::AtMostOnce, None)).await;
        subscribe(core, "a", "room/#", options(QoS::AtLeastOnce, None)).await;

        let now = SystemTime::now();
        let delivered = route_publish(core, "p", &publish("room/kitchen", QoS::AtLeastOnce), now)
            .await
            .unwrap();
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn no_local_skips_the_publisher() {
        let broker = core_with(DeliveryMode::OnlyOnce);
        let core = broker.core();
        open_session(core, "x").await;
        let mut opts = options(QoS::AtLeastOnce, None);
        opts.no_local = true;
        subscribe(core, "x", "loop", opts).await;

        let now = SystemTime::now();
        let delivered = route_publish(core, "x", &publish("loop", QoS::AtLeastOnce), now)
            .await
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn shared_group_round_robin() {
        let broker = core_with(DeliveryMode::OnlyOnce);
        let core = broker.core();
        for client in ["s1", "s2", "s3"] {
            open_session(core, client).await;
            subscribe(core, client, "$share/g/foo", options(QoS::AtMostOnce, None)).await;
        }
        let now = SystemTime::now();
        for _ in 0..6 {
            route_publish(core, "p", &publish("foo", QoS::AtMostOnce), now)
                .await
                .unwrap();
        }
        for client in ["s1", "s2", "s3"] {
            let mut count = 0;
            while core
                .sessions
                .next_deliverable(client, now)
                .await
                .unwrap()
                .is_some()
            {
                count += 1;
            }
            assert_eq!(count, 2, "client {client}");
        }
    }

    #[tokio::test]
    async fn retained_replay_respects_handling() {
        let broker = core_with(DeliveryMode::OnlyOnce);
        let core = broker.core();
        open_session(core, "a").await;
        let now = SystemTime::now();
        let mut retained = publish("door", QoS::AtLeastOnce);
        retained.retain = true;
        route_publish(core, "p", &retained, now).await.unwrap();

        let opts = options(QoS::AtLeastOnce, None);
        replay_retained(core, "a", "door", &opts, false, now)
            .await
            .unwrap();
        let got = core.sessions.next_deliverable("a", now).await.unwrap().unwrap();
        assert!(got.retain);

        // Existing subscription with send-if-new gets nothing.
        let mut opts = options(QoS::AtLeastOnce, None);
        opts.retain_handling = RetainHandling::SendIfNew;
        replay_retained(core, "a", "door", &opts, true, now)
            .await
            .unwrap();
        assert!(core.sessions.next_deliverable("a", now).await.unwrap().is_none());
    }
}
