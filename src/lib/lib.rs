pub mod backup;
pub mod broker;
pub mod config;
pub mod core;
#[cfg(feature = "tracing")]
pub mod logging;
pub mod relay;
pub mod storage;

#[cfg(test)]
mod tests;

pub use backup::{BackupSummary, ChatBackup, RestoreSummary};
pub use broker::{AmqpConnector, BrokerChannel, BrokerConnector, MemoryBroker};
pub use config::{AppConfig, BackupConfig, BrokerConfig, RelayConfig};
pub use crate::core::{BackupError, ChatRecord, Delivery, ExchangeKind, MessageRecord, QueueOptions, RelayError};
pub use relay::{MessageRelay, RelayState};
