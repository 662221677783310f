use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::ExchangeKind;

/// Where the relay's broker lives and which exchange it talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub exchange_durable: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            exchange: "barter.chat".to_string(),
            exchange_kind: ExchangeKind::Topic,
            exchange_durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    pub consumer_tag_prefix: String,
    pub command_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            consumer_tag_prefix: "barter".to_string(),
            command_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub database_path: PathBuf,
    pub backup_path: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("barter_chat.db"),
            backup_path: PathBuf::from("chat_backup.json"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub relay: RelayConfig,
    pub backup: BackupConfig,
    pub log_level: Option<String>,
}

impl AppConfig {
    /// Reads a JSON config file; absent keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(raw).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let broker = &self.relay.broker;
        if broker.host.trim().is_empty() {
            anyhow::bail!("broker host must not be empty");
        }
        if broker.port == 0 {
            anyhow::bail!("broker port must not be zero");
        }
        if self.relay.command_capacity == 0 {
            anyhow::bail!("relay command_capacity must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_broker() {
        let config = AppConfig::default();
        assert_eq!(config.relay.broker.host, "localhost");
        assert_eq!(config.relay.broker.port, 5672);
        assert_eq!(config.relay.broker.virtual_host, "/");
        assert_eq!(config.relay.broker.exchange_kind, ExchangeKind::Topic);
        assert_eq!(config.backup.backup_path, PathBuf::from("chat_backup.json"));
        assert!(config.log_level.is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = AppConfig::from_json(
            r#"{"relay": {"broker": {"host": "mq.barter.li", "exchange_kind": "fanout"}}, "log_level": "debug"}"#,
        )
        .unwrap();
        assert_eq!(config.relay.broker.host, "mq.barter.li");
        assert_eq!(config.relay.broker.exchange_kind, ExchangeKind::Fanout);
        assert_eq!(config.relay.broker.port, 5672);
        assert_eq!(config.relay.consumer_tag_prefix, "barter");
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn rejects_unknown_exchange_kind() {
        assert!(AppConfig::from_json(r#"{"relay": {"broker": {"exchange_kind": "headers"}}}"#).is_err());
    }

    #[test]
    fn rejects_zero_port() {
        assert!(AppConfig::from_json(r#"{"relay": {"broker": {"port": 0}}}"#).is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("barter.json");
        std::fs::write(&path, r#"{"backup": {"backup_path": "/tmp/chats.json"}}"#).unwrap();
        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.backup.backup_path, PathBuf::from("/tmp/chats.json"));
        assert!(AppConfig::from_file(dir.path().join("missing.json")).is_err());
    }
}
