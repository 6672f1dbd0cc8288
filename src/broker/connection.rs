//! Per-connection actor: CONNECT handshake, reader loop, writer task and
//! keep-alive enforcement.
//!
//! The reader owns the read half, the inbound QoS 2 state and the topic
//! alias table; the writer task owns the write half, the packet-identifier
//! allocator and the inflight window. They cooperate through a bounded
//! response channel (reader → writer) and a wake signal for queue drain, so
//! neither side ever touches the other's half of the socket.

use crate::broker::{delivery, BrokerCore, CloseRequest, CloseSignal};
use crate::core::time::Clock;
use crate::error::{CodecError, StoreError};
use crate::protocol::codes;
use crate::protocol::{
    read_packet, write_packet, Ack, ConnAckProperties, Connack, Disconnect, Packet,
    ProtocolVersion, Publish, QoS, SubAck, Subscribe, SubscriptionRequest, UnsubAck, Unsubscribe,
};
use crate::store::{ClientSubscription, InboundPublish, Message, StoredWill, SubscriptionOptions};
use crate::topic::{self, SharedFilter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use uuid::Uuid;

const RESPONSE_CHANNEL_DEPTH: usize = 32;

/// Why the reader loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseKind {
    /// Normal DISCONNECT; the Will is discarded.
    Clean,
    /// v5 DISCONNECT with reason 0x04; normal close, Will still fires.
    CleanWithWill,
    /// Keep-alive timeout, I/O loss or a protocol violation; Will fires.
    Abnormal,
    /// Superseded by a new connection with the same ClientId; the session
    /// now belongs to the successor.
    Takeover,
    /// Broker termination.
    Shutdown,
}

enum Flow {
    Continue,
    Close(CloseKind),
}

/// Drive one accepted connection through its whole lifecycle.
pub(crate) async fn serve_connection<S, C>(core: Arc<BrokerCore<C>>, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    C: Clock,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let max_packet = core.cfg.mqtt.max_packet_size as usize;

    // Accepted state: the first packet must be CONNECT within the timeout.
    let connect = match tokio::time::timeout(
        core.cfg.mqtt.connect_timeout(),
        read_packet(&mut reader, ProtocolVersion::V3_1_1, max_packet),
    )
    .await
    {
        Err(_) => {
            tracing::debug!("connection dropped: no CONNECT within timeout");
            return;
        }
        Ok(Err(CodecError::UnacceptableVersion(level))) => {
            // Answer in the shape the client is closest to speaking.
            let version = if level > 5 {
                ProtocolVersion::V5
            } else {
                ProtocolVersion::V3_1_1
            };
            reject(&mut writer, version, codes::unacceptable_version(version)).await;
            return;
        }
        Ok(Err(err)) => {
            tracing::debug!("connection dropped before CONNECT: {err}");
            return;
        }
        Ok(Ok(Packet::Connect(connect))) => connect,
        Ok(Ok(packet)) => {
            tracing::debug!("first packet was {:?}, closing", packet.packet_type());
            return;
        }
    };

    let version = connect.version;

    // ClientId policy.
    let mut assigned_id = None;
    let client_id = if connect.client_id.is_empty() {
        if !connect.clean_start || !core.cfg.mqtt.allow_zero_len_client_id {
            reject(&mut writer, version, codes::identifier_rejected(version)).await;
            return;
        }
        let generated = format!("auto-{}", Uuid::new_v4());
        assigned_id = Some(generated.clone());
        generated
    } else {
        if version == ProtocolVersion::V3_1 && connect.client_id.len() > 23 {
            reject(&mut writer, version, codes::identifier_rejected(version)).await;
            return;
        }
        connect.client_id.clone()
    };

    // Authenticating state.
    if let Err(err) = core
        .auth
        .authenticate(
            &client_id,
            connect.username.as_deref(),
            connect.password.as_deref(),
        )
        .await
    {
        tracing::warn!("rejected client_id={client_id}: {err}");
        reject(&mut writer, version, codes::auth_failure(version, &err)).await;
        return;
    }

    let requested_keep_alive = connect.keep_alive;
    let keep_alive = effective_keep_alive(requested_keep_alive, core.cfg.mqtt.max_keepalive);

    let requested_expiry = match version {
        ProtocolVersion::V5 => Duration::from_secs(u64::from(
            connect
                .properties
                .as_ref()
                .and_then(|p| p.session_expiry_interval)
                .unwrap_or(0),
        )),
        _ if connect.clean_start => Duration::ZERO,
        _ => core.cfg.mqtt.session_expiry(),
    };
    let session_expiry = requested_expiry.min(core.cfg.mqtt.session_expiry());

    let will = connect.will.as_ref().map(|w| StoredWill {
        topic: w.topic.clone(),
        payload: w.payload.clone(),
        qos: w.qos.min(config_max_qos(&core)),
        retain: w.retain && core.cfg.mqtt.retain_available,
        delay: Duration::from_secs(u64::from(
            w.properties
                .as_ref()
                .and_then(|p| p.will_delay_interval)
                .unwrap_or(0),
        )),
        properties: w.properties.clone(),
    });
    if let Some(w) = &will {
        if !topic::validate_topic_name(&w.topic) {
            reject(&mut writer, version, match version {
                ProtocolVersion::V5 => codes::v5::TOPIC_NAME_INVALID,
                _ => codes::identifier_rejected(version),
            })
            .await;
            return;
        }
    }

    // Takeover: the previous actor is told to go before the session is
    // handed out.
    let (handle, previous) = core.registry.register(&client_id);
    if let Some(previous) = previous {
        tracing::debug!("client_id={client_id} taken over by a new connection");
        previous.close_signal().request(CloseRequest::Takeover);
    }

    let now = core.clock.wall();
    let opened = match core
        .sessions
        .open(&client_id, connect.clean_start, session_expiry, will, now)
        .await
    {
        Ok(opened) => opened,
        Err(err) => {
            tracing::warn!("session open failed for client_id={client_id}: {err}");
            core.registry.deregister(&client_id, &handle);
            reject(&mut writer, version, match version {
                ProtocolVersion::V5 => codes::v5::SERVER_UNAVAILABLE,
                _ => codes::v3_return::SERVER_UNAVAILABLE,
            })
            .await;
            return;
        }
    };
    let session_present = opened.resumed;

    let connack = Connack {
        session_present,
        code: 0,
        properties: version.is_v5().then(|| ConnAckProperties {
            receive_maximum: Some(core.cfg.mqtt.server_receive_maximum),
            topic_alias_maximum: Some(core.cfg.mqtt.topic_alias_maximum),
            maximum_packet_size: Some(core.cfg.mqtt.max_packet_size),
            maximum_qos: (core.cfg.mqtt.maximum_qos < 2).then_some(core.cfg.mqtt.maximum_qos),
            retain_available: (!core.cfg.mqtt.retain_available).then_some(0),
            wildcard_subscription_available: (!core.cfg.mqtt.wildcard_subscription_available)
                .then_some(0),
            shared_subscription_available: (!core.cfg.mqtt.shared_subscription_available)
                .then_some(0),
            subscription_identifier_available: (!core.cfg.mqtt.subscription_identifier_available)
                .then_some(0),
            server_keep_alive: (keep_alive != requested_keep_alive).then_some(keep_alive),
            session_expiry_interval: (session_expiry != requested_expiry)
                .then_some(session_expiry.as_secs().min(u64::from(u32::MAX)) as u32),
            assigned_client_identifier: assigned_id,
            ..Default::default()
        }),
    };
    if write_packet(&mut writer, &Packet::Connack(connack), version)
        .await
        .is_err()
    {
        core.registry.deregister(&client_id, &handle);
        return;
    }
    tracing::info!(
        "client connected client_id={client_id} version={version:?} clean_start={} session_present={session_present}",
        connect.clean_start
    );

    // Active state: writer task + reader loop.
    let (resp_tx, resp_rx) = mpsc::channel(RESPONSE_CHANNEL_DEPTH);
    let writer_task = tokio::spawn(writer_loop(
        core.clone(),
        client_id.clone(),
        version,
        writer,
        resp_rx,
        handle.waker(),
    ));

    let mut session = LiveSession {
        core: &core,
        client_id: &client_id,
        version,
        resp_tx,
        aliases: HashMap::new(),
        session_expiry,
    };
    let close_kind = session
        .reader_loop(&mut reader, keep_alive, &handle.close_signal())
        .await;
    let session_expiry = session.session_expiry;
    drop(session);
    let _ = writer_task.await;

    // Closing state.
    core.registry.deregister(&client_id, &handle);
    if close_kind != CloseKind::Takeover {
        let now = core.clock.wall();
        let normal = close_kind == CloseKind::Clean;
        match core
            .sessions
            .detach(&client_id, opened.epoch, normal, now)
            .await
        {
            Ok(outcome) => {
                if outcome.removed {
                    let _ = core.subscriptions.unsubscribe_all(&client_id).await;
                }
                if let Some(will) = outcome.will_now {
                    delivery::publish_will(&core, &client_id, will, now).await;
                } else if let Some(due) = outcome.will_later {
                    spawn_will_timer(core.clone(), client_id.clone(), due);
                }
            }
            Err(StoreError::Shutdown | StoreError::SessionGone(_)) => {}
            Err(err) => {
                tracing::warn!("detach failed for client_id={client_id}: {err}");
            }
        }
    }
    tracing::info!(
        "client disconnected client_id={client_id} reason={close_kind:?} session_expiry={}s",
        session_expiry.as_secs()
    );
}

/// State the reader mutates while a connection is active.
struct LiveSession<'a, C: Clock> {
    core: &'a Arc<BrokerCore<C>>,
    client_id: &'a str,
    version: ProtocolVersion,
    resp_tx: mpsc::Sender<Packet>,
    /// v5 inbound topic aliases, connection-scoped.
    aliases: HashMap<u16, String>,
    session_expiry: Duration,
}

impl<C: Clock> LiveSession<'_, C> {
    async fn reader_loop<R>(
        &mut self,
        reader: &mut R,
        keep_alive: u16,
        close: &CloseSignal,
    ) -> CloseKind
    where
        R: AsyncRead + Unpin,
    {
        let max_packet = self.core.cfg.mqtt.max_packet_size as usize;
        // 1.5 × keep-alive grace, per the protocol.
        let idle_limit =
            (keep_alive > 0).then(|| Duration::from_millis(u64::from(keep_alive) * 1500));
        loop {
            let result = tokio::select! {
                biased;
                () = close.notified() => {
                    return match close.requested() {
                        Some(CloseRequest::Takeover) => CloseKind::Takeover,
                        _ => CloseKind::Shutdown,
                    };
                }
                result = read_packet(reader, self.version, max_packet) => result,
                () = idle_sleep(&self.core.clock, idle_limit) => {
                    tracing::debug!("keep-alive timeout for client_id={}", self.client_id);
                    return CloseKind::Abnormal;
                }
            };
            let packet = match result {
                Ok(packet) => packet,
                Err(err) => return self.codec_failure(err).await,
            };
            match self.dispatch(packet).await {
                Flow::Continue => {}
                Flow::Close(kind) => return kind,
            }
        }
    }

    async fn dispatch(&mut self, packet: Packet) -> Flow {
        match packet {
            Packet::Publish(publish) => self.on_publish(publish).await,
            Packet::PubAck(ack) => {
                match self
                    .core
                    .sessions
                    .ack_inflight(self.client_id, ack.packet_id)
                    .await
                {
                    Ok(_) => self.wake_writer(),
                    Err(err) => return self.store_failure(err).await,
                }
                Flow::Continue
            }
            Packet::PubRec(ack) => {
                let known = match self
                    .core
                    .sessions
                    .store_pubrel(self.client_id, ack.packet_id)
                    .await
                {
                    Ok(known) => known,
                    Err(err) => return self.store_failure(err).await,
                };
                let pubrel = if known || !self.version.is_v5() {
                    Ack::new(ack.packet_id)
                } else {
                    Ack::with_reason(ack.packet_id, codes::v5::PACKET_IDENTIFIER_NOT_FOUND)
                };
                self.respond(Packet::PubRel(pubrel)).await
            }
            Packet::PubRel(ack) => {
                let pending = match self.core.sessions.take_in(self.client_id, ack.packet_id).await
                {
                    Ok(pending) => pending,
                    Err(err) => return self.store_failure(err).await,
                };
                let pubcomp = match pending {
                    Some(publish) => {
                        // Commit point for exactly-once: route and retain
                        // only now, then complete the handshake.
                        let now = self.core.clock.wall();
                        if let Err(err) =
                            delivery::route_publish(self.core, self.client_id, &publish, now).await
                        {
                            return self.store_failure(err).await;
                        }
                        Ack::new(ack.packet_id)
                    }
                    None if self.version.is_v5() => {
                        Ack::with_reason(ack.packet_id, codes::v5::PACKET_IDENTIFIER_NOT_FOUND)
                    }
                    None => Ack::new(ack.packet_id),
                };
                self.respond(Packet::PubComp(pubcomp)).await
            }
            Packet::PubComp(ack) => {
                match self
                    .core
                    .sessions
                    .drop_pubrel(self.client_id, ack.packet_id)
                    .await
                {
                    Ok(_) => self.wake_writer(),
                    Err(err) => return self.store_failure(err).await,
                }
                Flow::Continue
            }
            Packet::Subscribe(subscribe) => self.on_subscribe(subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.on_unsubscribe(unsubscribe).await,
            Packet::PingReq => self.respond(Packet::PingResp).await,
            Packet::Disconnect(disconnect) => self.on_disconnect(disconnect).await,
            Packet::Connect(_) => {
                tracing::debug!("second CONNECT from client_id={}", self.client_id);
                self.protocol_violation(codes::v5::PROTOCOL_ERROR).await
            }
            Packet::Auth(_) => {
                // No enhanced authentication method was negotiated.
                self.protocol_violation(codes::v5::PROTOCOL_ERROR).await
            }
            Packet::Connack(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_)
            | Packet::PingResp => self.protocol_violation(codes::v5::PROTOCOL_ERROR).await,
        }
    }

    async fn on_publish(&mut self, publish: Publish) -> Flow {
        let mut topic_name = publish.topic.clone();
        if self.version.is_v5() {
            if let Some(alias) = publish.properties.as_ref().and_then(|p| p.topic_alias) {
                if alias == 0 || alias > self.core.cfg.mqtt.topic_alias_maximum {
                    return self
                        .protocol_violation(codes::v5::TOPIC_ALIAS_INVALID)
                        .await;
                }
                if topic_name.is_empty() {
                    match self.aliases.get(&alias) {
                        Some(resolved) => topic_name = resolved.clone(),
                        None => {
                            return self.protocol_violation(codes::v5::PROTOCOL_ERROR).await;
                        }
                    }
                } else {
                    self.aliases.insert(alias, topic_name.clone());
                }
            }
        }
        if !topic::validate_topic_name(&topic_name) {
            return self.protocol_violation(codes::v5::TOPIC_NAME_INVALID).await;
        }
        if publish.retain && self.version.is_v5() && !self.core.cfg.mqtt.retain_available {
            return self
                .protocol_violation(codes::v5::RETAIN_NOT_SUPPORTED)
                .await;
        }

        let inbound = InboundPublish {
            topic: topic_name,
            payload: publish.payload.clone(),
            qos: publish.qos.min(config_max_qos(self.core)),
            retain: publish.retain,
            properties: publish.properties.clone(),
        };
        let now = self.core.clock.wall();

        match publish.qos {
            QoS::AtMostOnce => {
                if let Err(err) =
                    delivery::route_publish(self.core, self.client_id, &inbound, now).await
                {
                    return self.store_failure(err).await;
                }
                Flow::Continue
            }
            QoS::AtLeastOnce => {
                let Some(pid) = publish.packet_id else {
                    return self.protocol_violation(codes::v5::PROTOCOL_ERROR).await;
                };
                // PUBACK only once the message is enqueued everywhere and
                // the retained store is updated.
                let ack = match delivery::route_publish(self.core, self.client_id, &inbound, now)
                    .await
                {
                    Ok(0) if self.version.is_v5() => {
                        Ack::with_reason(pid, codes::v5::NO_MATCHING_SUBSCRIBERS)
                    }
                    Ok(_) => Ack::new(pid),
                    Err(StoreError::Shutdown) => return Flow::Close(CloseKind::Shutdown),
                    Err(err) => {
                        tracing::warn!(
                            "publish from client_id={} failed: {err}",
                            self.client_id
                        );
                        if self.version.is_v5() {
                            Ack::with_reason(pid, codes::v5::IMPLEMENTATION_SPECIFIC_ERROR)
                        } else {
                            // v3 has no way to signal this; drop silently.
                            return Flow::Continue;
                        }
                    }
                };
                self.respond(Packet::PubAck(ack)).await
            }
            QoS::ExactlyOnce => {
                let Some(pid) = publish.packet_id else {
                    return self.protocol_violation(codes::v5::PROTOCOL_ERROR).await;
                };
                let seen = match self.core.sessions.seen_in(self.client_id, pid).await {
                    Ok(seen) => seen,
                    Err(err) => return self.store_failure(err).await,
                };
                if !seen {
                    let pending = match self.core.sessions.inbound_pending(self.client_id).await {
                        Ok(pending) => pending,
                        Err(err) => return self.store_failure(err).await,
                    };
                    if pending >= usize::from(self.core.cfg.mqtt.server_receive_maximum) {
                        tracing::debug!(
                            "receive maximum exceeded by client_id={}",
                            self.client_id
                        );
                        return self
                            .protocol_violation(codes::v5::RECEIVE_MAXIMUM_EXCEEDED)
                            .await;
                    }
                    if let Err(err) = self
                        .core
                        .sessions
                        .remember_in(self.client_id, pid, inbound)
                        .await
                    {
                        return self.store_failure(err).await;
                    }
                }
                // Duplicate while the identifier is still pending: plain
                // PUBREC again, no second routing.
                self.respond(Packet::PubRec(Ack::new(pid))).await
            }
        }
    }

    async fn on_subscribe(&mut self, subscribe: Subscribe) -> Flow {
        let sub_id = subscribe
            .properties
            .as_ref()
            .and_then(|p| p.subscription_identifier);
        if sub_id.is_some() && !self.core.cfg.mqtt.subscription_identifier_available {
            return self
                .protocol_violation(codes::v5::SUBSCRIPTION_IDENTIFIERS_NOT_SUPPORTED)
                .await;
        }

        let now = self.core.clock.wall();
        let mut reason_codes = Vec::with_capacity(subscribe.filters.len());
        let mut replay = Vec::new();
        for request in &subscribe.filters {
            match self.evaluate_filter(request, sub_id) {
                Ok(subscription) => {
                    let granted = subscription.options.max_qos;
                    match self
                        .core
                        .subscriptions
                        .subscribe(self.client_id, subscription.clone())
                        .await
                    {
                        Ok(previous) => {
                            reason_codes.push(granted as u8);
                            if subscription.shared_group.is_none() {
                                replay.push((subscription, previous.is_some()));
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                "subscribe failed for client_id={}: {err}",
                                self.client_id
                            );
                            reason_codes.push(codes::suback_failure(
                                self.version,
                                codes::v5::IMPLEMENTATION_SPECIFIC_ERROR,
                            ));
                        }
                    }
                }
                Err(code) => reason_codes.push(code),
            }
        }

        // SUBACK goes ahead of any retained replay for these filters.
        let flow = self
            .respond(Packet::SubAck(SubAck {
                packet_id: subscribe.packet_id,
                properties: None,
                codes: reason_codes,
            }))
            .await;
        if let Flow::Close(_) = flow {
            return flow;
        }
        for (subscription, existed) in replay {
            if let Err(err) = delivery::replay_retained(
                self.core,
                self.client_id,
                subscription.match_filter(),
                &subscription.options,
                existed,
                now,
            )
            .await
            {
                tracing::warn!(
                    "retained replay failed for client_id={}: {err}",
                    self.client_id
                );
            }
        }
        Flow::Continue
    }

    fn evaluate_filter(
        &self,
        request: &SubscriptionRequest,
        sub_id: Option<u32>,
    ) -> Result<ClientSubscription, u8> {
        let cfg = &self.core.cfg.mqtt;
        let invalid = codes::suback_failure(self.version, codes::v5::TOPIC_FILTER_INVALID);
        let (shared_group, match_filter) = match SharedFilter::parse(&request.filter) {
            Some(Ok(shared)) => {
                if !cfg.shared_subscription_available {
                    return Err(codes::suback_failure(
                        self.version,
                        codes::v5::SHARED_SUBSCRIPTIONS_NOT_SUPPORTED,
                    ));
                }
                (Some(shared.group.to_string()), shared.filter)
            }
            Some(Err(())) => return Err(invalid),
            None => {
                if !topic::validate_topic_filter(&request.filter) {
                    return Err(invalid);
                }
                (None, request.filter.as_str())
            }
        };
        if !cfg.wildcard_subscription_available && match_filter.contains(['+', '#']) {
            return Err(codes::suback_failure(
                self.version,
                codes::v5::WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED,
            ));
        }
        Ok(ClientSubscription {
            filter: request.filter.clone(),
            shared_group,
            options: SubscriptionOptions {
                max_qos: request.qos.min(config_max_qos(self.core)),
                no_local: request.no_local,
                retain_as_published: request.retain_as_published,
                retain_handling: request.retain_handling,
                subscription_id: sub_id,
            },
        })
    }

    async fn on_unsubscribe(&mut self, unsubscribe: Unsubscribe) -> Flow {
        let mut reason_codes = Vec::with_capacity(unsubscribe.filters.len());
        for filter in &unsubscribe.filters {
            match self
                .core
                .subscriptions
                .unsubscribe(self.client_id, filter)
                .await
            {
                Ok(true) => reason_codes.push(codes::v5::SUCCESS),
                Ok(false) => reason_codes.push(codes::v5::NO_SUBSCRIPTION_EXISTED),
                Err(err) => {
                    tracing::warn!(
                        "unsubscribe failed for client_id={}: {err}",
                        self.client_id
                    );
                    reason_codes.push(codes::v5::IMPLEMENTATION_SPECIFIC_ERROR);
                }
            }
        }
        self.respond(Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
            properties: None,
            codes: if self.version.is_v5() {
                reason_codes
            } else {
                Vec::new()
            },
        }))
        .await
    }

    async fn on_disconnect(&mut self, disconnect: Disconnect) -> Flow {
        if self.version.is_v5() {
            if let Some(secs) = disconnect
                .properties
                .as_ref()
                .and_then(|p| p.session_expiry_interval)
            {
                let requested = Duration::from_secs(u64::from(secs));
                if self.session_expiry.is_zero() && !requested.is_zero() {
                    // Cannot raise the expiry from zero at disconnect.
                    return self.protocol_violation(codes::v5::PROTOCOL_ERROR).await;
                }
                let lowered = requested.min(self.session_expiry);
                self.session_expiry = lowered;
                if let Err(err) = self
                    .core
                    .sessions
                    .set_expiry(self.client_id, lowered)
                    .await
                {
                    tracing::debug!(
                        "expiry override failed for client_id={}: {err}",
                        self.client_id
                    );
                }
            }
        }
        if disconnect.reason_code == codes::v5::DISCONNECT_WITH_WILL {
            Flow::Close(CloseKind::CleanWithWill)
        } else {
            Flow::Close(CloseKind::Clean)
        }
    }

    async fn respond(&mut self, packet: Packet) -> Flow {
        if self.resp_tx.send(packet).await.is_err() {
            // Writer is gone; nothing more to do on this connection.
            return Flow::Close(CloseKind::Abnormal);
        }
        Flow::Continue
    }

    fn wake_writer(&self) {
        if let Some(handle) = self.core.registry.get(self.client_id) {
            handle.wake();
        }
    }

    /// Protocol violation: v5 gets a DISCONNECT with the reason, 3.x an
    /// abrupt close. Either way the connection ends abnormally.
    async fn protocol_violation(&mut self, reason: u8) -> Flow {
        if self.version.is_v5() {
            let _ = self
                .resp_tx
                .send(Packet::Disconnect(Disconnect {
                    reason_code: reason,
                    properties: None,
                }))
                .await;
        }
        Flow::Close(CloseKind::Abnormal)
    }

    async fn codec_failure(&mut self, err: CodecError) -> CloseKind {
        match err {
            CodecError::Malformed(reason) => {
                tracing::debug!(
                    "malformed packet from client_id={}: {reason}",
                    self.client_id
                );
                CloseKind::Abnormal
            }
            CodecError::Protocol(reason) => {
                tracing::debug!(
                    "protocol error from client_id={}: {reason}",
                    self.client_id
                );
                match self.protocol_violation(codes::v5::PROTOCOL_ERROR).await {
                    Flow::Close(kind) => kind,
                    Flow::Continue => CloseKind::Abnormal,
                }
            }
            CodecError::PacketTooLarge { size, limit } => {
                tracing::debug!(
                    "oversized packet ({size} > {limit}) from client_id={}",
                    self.client_id
                );
                match self.protocol_violation(codes::v5::PACKET_TOO_LARGE).await {
                    Flow::Close(kind) => kind,
                    Flow::Continue => CloseKind::Abnormal,
                }
            }
            CodecError::UnacceptableVersion(_) => CloseKind::Abnormal,
            CodecError::Io(err) => {
                tracing::debug!("connection lost client_id={}: {err}", self.client_id);
                CloseKind::Abnormal
            }
        }
    }

    async fn store_failure(&mut self, err: StoreError) -> Flow {
        match err {
            StoreError::Shutdown => Flow::Close(CloseKind::Shutdown),
            StoreError::SessionGone(_) => Flow::Close(CloseKind::Abnormal),
            StoreError::PacketIdentifiersExhausted => {
                self.protocol_violation(codes::v5::QUOTA_EXCEEDED).await
            }
        }
    }
}

/// Writer task: owns the write half, the PID allocator and the inflight
/// window. Replies from the reader take precedence over queue drain, which
/// keeps SUBACK ahead of freshly enqueued retained messages.
async fn writer_loop<W, C>(
    core: Arc<BrokerCore<C>>,
    client_id: String,
    version: ProtocolVersion,
    mut writer: W,
    mut resp_rx: mpsc::Receiver<Packet>,
    wake: Arc<Notify>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
    C: Clock,
{
    // Redeliver the inflight window (DUP=1, identifier order) and pending
    // PUBRELs before anything new.
    if let Ok((inflight, pubrels)) = core.sessions.resend_set(&client_id).await {
        let now = core.clock.wall();
        for (pid, message) in inflight {
            let packet = egress_publish(&message, Some(pid), true, version, now);
            if write_packet(&mut writer, &packet, version).await.is_err() {
                return;
            }
        }
        for pid in pubrels {
            if write_packet(&mut writer, &Packet::PubRel(Ack::new(pid)), version)
                .await
                .is_err()
            {
                return;
            }
        }
    }
    if drain(&core, &client_id, version, &mut writer).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            biased;
            maybe = resp_rx.recv() => match maybe {
                Some(packet) => {
                    let disconnecting = matches!(packet, Packet::Disconnect(_));
                    if write_packet(&mut writer, &packet, version).await.is_err() {
                        break;
                    }
                    if disconnecting {
                        break;
                    }
                }
                // Reader finished; the connection is closing.
                None => break,
            },
            () = wake.notified() => {}
        }
        if drain(&core, &client_id, version, &mut writer).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Move deliverables from the session queue onto the wire while the
/// inflight window allows.
async fn drain<W, C>(
    core: &BrokerCore<C>,
    client_id: &str,
    version: ProtocolVersion,
    writer: &mut W,
) -> Result<(), ()>
where
    W: AsyncWrite + Unpin + Send,
    C: Clock,
{
    loop {
        let now = core.clock.wall();
        let message = match core.sessions.next_deliverable(client_id, now).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(_) => return Ok(()),
        };
        let packet = if message.qos == QoS::AtMostOnce {
            egress_publish(&message, None, false, version, now)
        } else {
            let pid = match core.sessions.alloc_pid(client_id).await {
                Ok(pid) => pid,
                Err(StoreError::PacketIdentifiersExhausted) => {
                    tracing::warn!(
                        "packet identifiers exhausted for client_id={client_id}; delivery paused"
                    );
                    let _ = core.sessions.requeue_front(client_id, message).await;
                    return Ok(());
                }
                Err(_) => return Ok(()),
            };
            if core
                .sessions
                .mark_inflight(client_id, pid, message.clone(), now)
                .await
                .is_err()
            {
                return Ok(());
            }
            egress_publish(&message, Some(pid), false, version, now)
        };
        if write_packet(writer, &packet, version).await.is_err() {
            return Err(());
        }
    }
}

/// Build the outbound PUBLISH for one deliverable, rewriting the message
/// expiry to the remaining lifetime and attaching subscription identifiers.
fn egress_publish(
    message: &Message,
    pid: Option<u16>,
    dup: bool,
    version: ProtocolVersion,
    now: SystemTime,
) -> Packet {
    let properties = if version.is_v5() {
        let mut properties = message.properties.clone();
        if let Some(props) = properties.as_mut() {
            if props.message_expiry_interval.is_some() {
                props.message_expiry_interval = message.remaining_ttl(now);
            }
        }
        if !message.subscription_ids.is_empty() {
            properties
                .get_or_insert_with(Default::default)
                .subscription_identifiers = message.subscription_ids.clone();
        }
        properties
    } else {
        None
    };
    Packet::Publish(Publish {
        dup: dup && message.qos != QoS::AtMostOnce,
        qos: message.qos,
        retain: message.retain,
        topic: message.topic.clone(),
        packet_id: pid,
        properties,
        payload: message.payload.clone(),
    })
}

fn effective_keep_alive(requested: u16, max: u16) -> u16 {
    if requested == 0 || max == 0 {
        requested
    } else {
        requested.min(max)
    }
}

fn config_max_qos<C: Clock>(core: &BrokerCore<C>) -> QoS {
    match core.cfg.mqtt.maximum_qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

async fn idle_sleep<C: Clock>(clock: &C, limit: Option<Duration>) {
    match limit {
        Some(limit) => clock.sleep(limit).await,
        None => std::future::pending().await,
    }
}

fn spawn_will_timer<C: Clock>(core: Arc<BrokerCore<C>>, client_id: String, due: SystemTime) {
    tokio::spawn(async move {
        let delay = due
            .duration_since(core.clock.wall())
            .unwrap_or(Duration::ZERO);
        core.clock.sleep(delay).await;
        let now = core.clock.wall();
        // The sweeper may have claimed it first; take_due_will is atomic.
        if let Ok(Some(will)) = core.sessions.take_due_will(&client_id, now).await {
            delivery::publish_will(&core, &client_id, will, now).await;
        }
    });
}

async fn reject<W: AsyncWrite + Unpin>(writer: &mut W, version: ProtocolVersion, code: u8) {
    let connack = Connack {
        session_present: false,
        code,
        properties: None,
    };
    let _ = write_packet(writer, &Packet::Connack(connack), version).await;
    let _ = writer.shutdown().await;
}
