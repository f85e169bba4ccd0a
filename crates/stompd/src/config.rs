use std::{fs, io, net::IpAddr, path::Path};

use serde::Deserialize;
use thiserror::Error;

/// Broker-wide settings. Defaults match a bare `stompd` invocation; a JSON
/// config file and CLI flags override them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Listen address, IPv4 or IPv6.
    pub listen_addr: IpAddr,
    pub port: u16,
    /// Per-readiness-event socket read chunk, in bytes.
    pub read_size: usize,
    /// When set, connections idle past twice their negotiated inbound
    /// heartbeat interval are closed, and outbound keep-alive line feeds are
    /// emitted on schedule.
    pub enforce_heartbeats: bool,
    /// Template applied to queues auto-created on first reference.
    pub queue: QueueConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1]), // ::1
            port: 61613,
            read_size: crate::connection::NETWORK_READ_SIZE,
            enforce_heartbeats: false,
            queue: QueueConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Per-queue policy knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Which storage backend queues use.
    pub storage: StorageBackend,
    /// Maximum frames held by a queue's storage.
    pub size_max: usize,
    /// What to do with a SEND arriving at a full queue.
    pub full_action: FullAction,
    /// Rejections (NACKs) a frame survives before it is dropped outright.
    pub nack_max: u32,
    /// What to do with a NACKed delivery.
    pub nack_action: RejectAction,
    /// Maximum frame age in milliseconds; zero disables retirement.
    pub age_max_ms: u64,
    /// What to do with a frame past `age_max_ms`.
    pub retire_action: RejectAction,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            storage: StorageBackend::Memory,
            size_max: 1024,
            full_action: FullAction::Error,
            nack_max: 20,
            nack_action: RejectAction::Drop,
            age_max_ms: 0,
            retire_action: RejectAction::Drop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FullAction {
    /// Report an ERROR frame to the producer.
    Error,
    /// Evict the oldest stored frame to make room.
    DropOldest,
    /// Silently drop the incoming frame.
    DropNewest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectAction {
    Drop,
    Requeue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    Memory,
    /// Placeholder backend; declared for configuration compatibility but
    /// stores nothing.
    ServerInfo,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_loopback_stomp_port() {
        let config = BrokerConfig::default();
        assert_eq!(config.listen_addr.to_string(), "::1");
        assert_eq!(config.port, 61613);
        assert_eq!(config.queue.size_max, 1024);
        assert_eq!(config.queue.full_action, FullAction::Error);
        assert!(!config.enforce_heartbeats);
    }

    #[test]
    fn json_overrides_defaults() {
        let config: BrokerConfig = serde_json::from_str(
            r#"{
                "listen_addr": "127.0.0.1",
                "port": 6163,
                "queue": { "size_max": 4, "full_action": "drop-oldest" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1");
        assert_eq!(config.port, 6163);
        assert_eq!(config.queue.size_max, 4);
        assert_eq!(config.queue.full_action, FullAction::DropOldest);
        // Unset fields keep their defaults.
        assert_eq!(config.queue.nack_max, 20);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<BrokerConfig>(r#"{"prot": 1}"#).is_err());
    }
}
