use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const TCP_BIND_DEFAULT: &str = "0.0.0.0:1883";

/// Top-level configuration for the beacon broker.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub listeners: ListenerConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// TCP bind address for the plain MQTT listener.
    #[serde(default = "default_tcp_bind")]
    pub tcp: String,
    /// Optional WebSocket bind address. The upgrade adapter is supplied by
    /// the embedding application; beacon only validates the address here.
    #[serde(default)]
    pub websocket: Option<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            tcp: default_tcp_bind(),
            websocket: None,
        }
    }
}

fn default_tcp_bind() -> String {
    TCP_BIND_DEFAULT.to_string()
}

/// MQTT protocol options.
///
/// Field semantics follow the OASIS specifications; durations are plain
/// seconds so the file stays diffable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Default session lifetime after disconnect, in seconds. A v5 client
    /// may request a shorter interval; it can never extend past this cap.
    pub session_expiry_seconds: u64,
    /// Period of the session/message expiry sweeper, in seconds.
    pub session_expiry_check_interval_seconds: u64,
    /// Default lifetime of a queued outbound message, in seconds. Expired
    /// messages are pruned by the sweeper and skipped on delivery.
    pub message_expiry_seconds: u64,
    /// Lifetime of an unacknowledged inflight message, in seconds. Expired
    /// inflight entries are evicted only while making room in a full queue;
    /// an idle session keeps them indefinitely.
    pub inflight_expiry_seconds: u64,
    /// Largest inbound packet the broker accepts, in bytes. Larger packets
    /// terminate the connection with a PacketTooLarge disconnect.
    pub max_packet_size: u32,
    /// Number of QoS 1/2 inbound publishes the broker processes
    /// concurrently per client (server receive maximum).
    pub server_receive_maximum: u16,
    /// Cap on the client-requested keep-alive, in seconds. v5 clients learn
    /// the capped value from CONNACK; v3 clients cannot be informed.
    pub max_keepalive: u16,
    /// Highest topic alias value accepted from v5 clients.
    pub topic_alias_maximum: u16,
    /// Whether subscription identifiers are supported (v5).
    pub subscription_identifier_available: bool,
    /// Whether `$share/<group>/<filter>` subscriptions are supported.
    pub shared_subscription_available: bool,
    /// Whether `+`/`#` wildcards are accepted in subscription filters.
    pub wildcard_subscription_available: bool,
    /// Whether retained messages are supported.
    pub retain_available: bool,
    /// Per-session bound on queued plus inflight outbound messages. On
    /// overflow the drop order is: expired queued messages, inflight
    /// entries past `inflight_expiry_seconds`, the oldest queued QoS 0
    /// message, the incoming message itself if it is QoS 0, and finally the
    /// oldest queued QoS 1/2 message.
    pub max_queue_messages: usize,
    /// Per-session outbound inflight window for QoS 1/2.
    pub max_inflight: usize,
    /// Clamp applied to the QoS of every inbound publish (and Will).
    pub maximum_qos: u8,
    /// Whether QoS 0 messages are queued for offline sessions.
    pub queue_qos0_messages: bool,
    /// How overlapping subscriptions of one client combine: `overlap`
    /// delivers once per matching subscription, `onlyonce` delivers a
    /// single message at the highest matching QoS.
    pub delivery_mode: DeliveryMode,
    /// Accept a zero-length ClientId (requires CleanStart; the broker
    /// assigns an identifier).
    pub allow_zero_len_client_id: bool,
    /// Seconds a freshly accepted connection may take to present CONNECT.
    pub connect_timeout_seconds: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            session_expiry_seconds: 7200,
            session_expiry_check_interval_seconds: 20,
            message_expiry_seconds: 7200,
            inflight_expiry_seconds: 30,
            max_packet_size: 268_435_460,
            server_receive_maximum: 100,
            max_keepalive: 300,
            topic_alias_maximum: 10,
            subscription_identifier_available: true,
            shared_subscription_available: true,
            wildcard_subscription_available: true,
            retain_available: true,
            max_queue_messages: 1000,
            max_inflight: 100,
            maximum_qos: 2,
            queue_qos0_messages: true,
            delivery_mode: DeliveryMode::OnlyOnce,
            allow_zero_len_client_id: false,
            connect_timeout_seconds: 10,
        }
    }
}

impl MqttConfig {
    pub fn session_expiry(&self) -> Duration {
        Duration::from_secs(self.session_expiry_seconds)
    }

    pub fn message_expiry(&self) -> Duration {
        Duration::from_secs(self.message_expiry_seconds)
    }

    pub fn inflight_expiry(&self) -> Duration {
        Duration::from_secs(self.inflight_expiry_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_expiry_check_interval_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// One delivery per matching subscription, each at its own QoS.
    Overlap,
    /// One delivery per recipient at the highest matching QoS.
    OnlyOnce,
}

impl FromStr for DeliveryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "overlap" => Ok(Self::Overlap),
            "onlyonce" => Ok(Self::OnlyOnce),
            other => bail!("invalid mqtt.delivery_mode {}", other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter directive passed to the tracing subscriber.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a path resolved via BEACON_CONFIG or the
    /// default `config/beacon.toml`.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let cfg = Self::load(&path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from a specific TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        toml::from_str(&data)
            .with_context(|| format!("invalid TOML config {}", path_ref.display()))
    }

    /// Reject settings the broker cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.listeners.tcp.parse::<std::net::SocketAddr>().is_err() {
            bail!(
                "listeners.tcp {} is not a socket address",
                self.listeners.tcp
            );
        }
        if let Some(ws) = &self.listeners.websocket {
            if ws.parse::<std::net::SocketAddr>().is_err() {
                bail!("listeners.websocket {} is not a socket address", ws);
            }
        }
        let m = &self.mqtt;
        if m.session_expiry_check_interval_seconds == 0 {
            bail!("mqtt.session_expiry_check_interval_seconds must be non-zero");
        }
        if m.max_inflight == 0 {
            bail!("mqtt.max_inflight must be at least 1");
        }
        if m.max_inflight > m.max_queue_messages {
            bail!(
                "mqtt.max_inflight {} exceeds mqtt.max_queue_messages {}",
                m.max_inflight,
                m.max_queue_messages
            );
        }
        if m.maximum_qos > 2 {
            bail!("mqtt.maximum_qos {} is not a QoS level", m.maximum_qos);
        }
        if m.connect_timeout_seconds == 0 {
            bail!("mqtt.connect_timeout_seconds must be non-zero");
        }
        Ok(())
    }
}

fn env_config_path() -> PathBuf {
    std::env::var_os("BEACON_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/beacon.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(doc: &str) -> Config {
        toml::from_str(doc).unwrap()
    }

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.listeners.tcp, "0.0.0.0:1883");
        assert_eq!(cfg.mqtt.delivery_mode, DeliveryMode::OnlyOnce);
    }

    #[test]
    fn parses_partial_document() {
        let cfg = parsed(
            r#"
            [mqtt]
            max_inflight = 8
            delivery_mode = "overlap"
            "#,
        );
        assert_eq!(cfg.mqtt.max_inflight, 8);
        assert_eq!(cfg.mqtt.delivery_mode, DeliveryMode::Overlap);
        assert_eq!(cfg.mqtt.max_queue_messages, 1000);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_window_larger_than_queue() {
        let cfg = parsed(
            r#"
            [mqtt]
            max_inflight = 64
            max_queue_messages = 32
            "#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_listener_address() {
        let cfg = parsed(
            r#"
            [listeners]
            tcp = "not-an-address"
            "#,
        );
        assert!(cfg.validate().is_err());
    }
}
