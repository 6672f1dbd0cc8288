//! MQTT wire protocol: binary primitives, v5 properties and the
//! version-aware control packet codec.

pub mod codes;
pub mod packet;
pub mod primitives;
pub mod properties;

pub use packet::{
    read_packet, write_packet, Ack, Auth, Connack, Connect, Disconnect, LastWill, Packet,
    PacketType, ProtocolVersion, Publish, QoS, RetainHandling, SubAck, Subscribe,
    SubscriptionRequest, UnsubAck, Unsubscribe,
};
pub use properties::{
    AckProperties, AuthProperties, ConnAckProperties, ConnectProperties, DisconnectProperties,
    PublishProperties, SubscribeProperties, UnsubscribeProperties, WillProperties,
};
