//! Codec conformance: per-type round-trips across protocol versions, the
//! variable-byte integer boundary table and a malformed-bytes corpus that
//! must never panic.

use beacon::protocol::{
    read_packet, write_packet, Ack, AckProperties, Auth, AuthProperties, ConnAckProperties,
    Connack, Connect, ConnectProperties, Disconnect, DisconnectProperties, LastWill, Packet,
    ProtocolVersion, Publish, PublishProperties, QoS, RetainHandling, SubAck, Subscribe,
    SubscribeProperties, SubscriptionRequest, UnsubAck, Unsubscribe, UnsubscribeProperties,
    WillProperties,
};
use bytes::Bytes;

fn round_trip(packet: &Packet, version: ProtocolVersion) {
    let frame = packet.encode(version).unwrap();
    // Re-frame by hand: fixed header byte, variable-length, body.
    let mut cursor = 1;
    let mut remaining: usize = 0;
    let mut shift = 0;
    loop {
        let byte = frame[cursor];
        cursor += 1;
        remaining |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    assert_eq!(frame.len() - cursor, remaining, "remaining length exact");
    let decoded = Packet::decode(frame[0], &frame[cursor..], version).unwrap();
    assert_eq!(&decoded, packet);
}

#[test]
fn connect_round_trips_all_versions() {
    for version in [
        ProtocolVersion::V3_1,
        ProtocolVersion::V3_1_1,
        ProtocolVersion::V5,
    ] {
        let connect = Connect {
            version,
            clean_start: true,
            keep_alive: 30,
            client_id: "c-1".into(),
            will: Some(LastWill {
                topic: "state/c-1".into(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtLeastOnce,
                retain: true,
                properties: version.is_v5().then(|| WillProperties {
                    will_delay_interval: Some(5),
                    message_expiry_interval: Some(60),
                    ..Default::default()
                }),
            }),
            username: Some("user".into()),
            password: Some(Bytes::from_static(b"secret")),
            properties: version.is_v5().then(|| ConnectProperties {
                session_expiry_interval: Some(300),
                receive_maximum: Some(20),
                topic_alias_maximum: Some(4),
                ..Default::default()
            }),
        };
        round_trip(&Packet::Connect(connect), version);
    }
}

#[test]
fn connack_round_trips() {
    round_trip(
        &Packet::Connack(Connack {
            session_present: true,
            code: 0,
            properties: None,
        }),
        ProtocolVersion::V3_1_1,
    );
    round_trip(
        &Packet::Connack(Connack {
            session_present: false,
            code: 0,
            properties: Some(ConnAckProperties {
                receive_maximum: Some(100),
                server_keep_alive: Some(60),
                assigned_client_identifier: Some("auto-1".into()),
                maximum_qos: Some(1),
                ..Default::default()
            }),
        }),
        ProtocolVersion::V5,
    );
}

#[test]
fn publish_round_trips() {
    let v3 = Publish {
        dup: true,
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: "room/kitchen".into(),
        packet_id: Some(77),
        properties: None,
        payload: Bytes::from_static(b"hello"),
    };
    round_trip(&Packet::Publish(v3), ProtocolVersion::V3_1_1);

    let v5 = Publish {
        dup: false,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: "room/kitchen".into(),
        packet_id: Some(1),
        properties: Some(PublishProperties {
            message_expiry_interval: Some(120),
            topic_alias: Some(3),
            response_topic: Some("replies/1".into()),
            correlation_data: Some(Bytes::from_static(b"\x01\x02")),
            subscription_identifiers: vec![9],
            content_type: Some("text/plain".into()),
            user_properties: vec![("k".into(), "v".into())],
            payload_format_indicator: Some(1),
        }),
        payload: Bytes::from_static(b"payload"),
    };
    round_trip(&Packet::Publish(v5), ProtocolVersion::V5);

    // QoS 0 with no packet id and an empty payload.
    let empty = Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: true,
        topic: "t".into(),
        packet_id: None,
        properties: None,
        payload: Bytes::new(),
    };
    round_trip(&Packet::Publish(empty), ProtocolVersion::V3_1_1);
}

#[test]
fn ack_family_round_trips() {
    for version in [ProtocolVersion::V3_1_1, ProtocolVersion::V5] {
        round_trip(&Packet::PubAck(Ack::new(10)), version);
        round_trip(&Packet::PubRec(Ack::new(11)), version);
        round_trip(&Packet::PubRel(Ack::new(12)), version);
        round_trip(&Packet::PubComp(Ack::new(13)), version);
    }
    round_trip(
        &Packet::PubAck(Ack::with_reason(10, 0x10)),
        ProtocolVersion::V5,
    );
    round_trip(
        &Packet::PubAck(Ack {
            packet_id: 10,
            reason_code: 0x80,
            properties: Some(AckProperties {
                reason_string: Some("nope".into()),
                user_properties: Vec::new(),
            }),
        }),
        ProtocolVersion::V5,
    );
}

#[test]
fn subscribe_round_trips() {
    let v3 = Subscribe {
        packet_id: 2,
        properties: None,
        filters: vec![
            SubscriptionRequest {
                filter: "a/+".into(),
                qos: QoS::AtLeastOnce,
                no_local: false,
                retain_as_published: false,
                retain_handling: RetainHandling::SendAtSubscribe,
            },
            SubscriptionRequest {
                filter: "b/#".into(),
                qos: QoS::ExactlyOnce,
                no_local: false,
                retain_as_published: false,
                retain_handling: RetainHandling::SendAtSubscribe,
            },
        ],
    };
    round_trip(&Packet::Subscribe(v3), ProtocolVersion::V3_1_1);

    let v5 = Subscribe {
        packet_id: 3,
        properties: Some(SubscribeProperties {
            subscription_identifier: Some(42),
            user_properties: Vec::new(),
        }),
        filters: vec![SubscriptionRequest {
            filter: "$share/workers/jobs/#".into(),
            qos: QoS::AtLeastOnce,
            no_local: true,
            retain_as_published: true,
            retain_handling: RetainHandling::DontSend,
        }],
    };
    round_trip(&Packet::Subscribe(v5), ProtocolVersion::V5);
}

#[test]
fn suback_unsub_round_trips() {
    round_trip(
        &Packet::SubAck(SubAck {
            packet_id: 2,
            properties: None,
            codes: vec![0x00, 0x01, 0x80],
        }),
        ProtocolVersion::V3_1_1,
    );
    round_trip(
        &Packet::Unsubscribe(Unsubscribe {
            packet_id: 4,
            properties: None,
            filters: vec!["a/+".into()],
        }),
        ProtocolVersion::V3_1_1,
    );
    round_trip(
        &Packet::Unsubscribe(Unsubscribe {
            packet_id: 5,
            properties: Some(UnsubscribeProperties {
                user_properties: vec![("why".into(), "done".into())],
            }),
            filters: vec!["a/+".into(), "b".into()],
        }),
        ProtocolVersion::V5,
    );
    round_trip(
        &Packet::UnsubAck(UnsubAck {
            packet_id: 4,
            properties: None,
            codes: Vec::new(),
        }),
        ProtocolVersion::V3_1_1,
    );
    round_trip(
        &Packet::UnsubAck(UnsubAck {
            packet_id: 5,
            properties: None,
            codes: vec![0x00, 0x11],
        }),
        ProtocolVersion::V5,
    );
}

#[test]
fn ping_disconnect_auth_round_trips() {
    for version in [ProtocolVersion::V3_1_1, ProtocolVersion::V5] {
        round_trip(&Packet::PingReq, version);
        round_trip(&Packet::PingResp, version);
        round_trip(&Packet::Disconnect(Disconnect::default()), version);
    }
    round_trip(
        &Packet::Disconnect(Disconnect {
            reason_code: 0x8E,
            properties: Some(DisconnectProperties {
                session_expiry_interval: Some(0),
                reason_string: Some("taken over".into()),
                ..Default::default()
            }),
        }),
        ProtocolVersion::V5,
    );
    round_trip(
        &Packet::Auth(Auth {
            reason_code: 0x18,
            properties: Some(AuthProperties {
                authentication_method: Some("SCRAM-SHA-1".into()),
                authentication_data: Some(Bytes::from_static(b"nonce")),
                ..Default::default()
            }),
        }),
        ProtocolVersion::V5,
    );
}

/// Malformed and protocol-violating byte sequences must produce errors,
/// never panics.
#[test]
fn malformed_corpus_is_rejected() {
    let corpus: &[(&str, u8, &[u8])] = &[
        ("connect reserved flag", 0x10, &[
            0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x03, 0x00, 0x3C, 0x00, 0x01, b'c',
        ]),
        ("connect truncated", 0x10, &[0x00, 0x04, b'M', b'Q']),
        ("connect bad name", 0x10, &[
            0x00, 0x04, b'H', b'T', b'T', b'P', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x01, b'c',
        ]),
        ("publish qos3", 0x36, &[0x00, 0x01, b'a', 0x00, 0x01]),
        ("publish dup on qos0", 0x38, &[0x00, 0x01, b'a']),
        ("publish zero pid", 0x32, &[0x00, 0x01, b'a', 0x00, 0x00]),
        ("puback truncated", 0x40, &[0x00]),
        ("pubrel wrong flags", 0x60, &[0x00, 0x01]),
        ("subscribe no filters", 0x82, &[0x00, 0x01]),
        ("subscribe bad options", 0x82, &[0x00, 0x01, 0x00, 0x01, b'a', 0x43]),
        ("subscribe qos3 option", 0x82, &[0x00, 0x01, 0x00, 0x01, b'a', 0x03]),
        ("unsubscribe empty", 0xA2, &[0x00, 0x01]),
        ("unsubscribe wrong flags", 0xA0, &[0x00, 0x01, 0x00, 0x01, b'a']),
        ("bad utf8 topic", 0x30, &[0x00, 0x02, 0xC3, 0x28]),
        ("nul in topic", 0x30, &[0x00, 0x01, 0x00]),
        ("pingreq with body", 0xC0, &[0x00]),
        ("connack reserved flags", 0x20, &[0x02, 0x00]),
        ("type zero", 0x00, &[]),
    ];
    for (name, first, body) in corpus {
        for version in [ProtocolVersion::V3_1_1, ProtocolVersion::V5] {
            assert!(
                Packet::decode(*first, body, version).is_err(),
                "{name} decoded under {version:?}"
            );
        }
    }
    // 3.x acknowledgments are exactly two bytes; v5 reads a reason code.
    assert!(Packet::decode(0x40, &[0x00, 0x01, 0xFF], ProtocolVersion::V3_1_1).is_err());
}

#[test]
fn v5_only_shapes_rejected_downlevel() {
    // AUTH under 3.1.1.
    assert!(Packet::decode(0xF0, &[], ProtocolVersion::V3_1_1).is_err());
    // Empty topic publish is v5-only (alias-based).
    let empty_topic = [0x00, 0x00];
    assert!(Packet::decode(0x30, &empty_topic, ProtocolVersion::V3_1_1).is_err());
}

#[tokio::test]
async fn framed_read_enforces_max_packet_size() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let publish = Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: "t".into(),
        packet_id: None,
        properties: None,
        payload: Bytes::from(vec![0u8; 128]),
    });
    write_packet(&mut client, &publish, ProtocolVersion::V3_1_1)
        .await
        .unwrap();
    let err = read_packet(&mut server, ProtocolVersion::V3_1_1, 64)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        beacon::CodecError::PacketTooLarge { .. }
    ));
}

#[tokio::test]
async fn framed_round_trip_over_stream() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let packet = Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: "x/y".into(),
        packet_id: Some(5),
        properties: None,
        payload: Bytes::from_static(b"data"),
    });
    write_packet(&mut client, &packet, ProtocolVersion::V3_1_1)
        .await
        .unwrap();
    let decoded = read_packet(&mut server, ProtocolVersion::V3_1_1, 1 << 20)
        .await
        .unwrap();
    assert_eq!(decoded, packet);
}
