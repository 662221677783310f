use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use barter_chat::backup::ChatBackup;
use barter_chat::logging::init_tracing;
use barter_chat::relay::{dispatch_queue, MessageRelay, RelayState};
use barter_chat::storage::SqliteChatStore;
use barter_chat::{AmqpConnector, AppConfig, QueueOptions};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "barter-chat", about = "barter.li chat relay and backup tool")]
struct Cli {
    /// JSON config file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write every local chat and message to the backup file
    Backup {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Load a backup file back into the local database
    Restore {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// Consume a queue and print each delivery until Ctrl-C
    Listen {
        #[arg(long, default_value = "")]
        queue: String,
        #[arg(long = "bind")]
        bindings: Vec<String>,
        #[arg(long)]
        durable: bool,
    },
    /// Publish one message to the configured exchange
    Publish {
        #[arg(long)]
        key: String,
        #[arg(long)]
        message: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };
    init_tracing(config.log_level.as_deref());

    match cli.command {
        Command::Backup { db, out } => {
            let db = db.unwrap_or(config.backup.database_path);
            let out = out.unwrap_or(config.backup.backup_path);
            let summary = tokio::task::spawn_blocking(move || {
                let store = SqliteChatStore::open(&db)?;
                ChatBackup::new(store, out).backup_chats()
            })
            .await?
            .context("Chat backup failed")?;
            println!(
                "Backed up {} chats and {} messages to {}",
                summary.chats,
                summary.messages,
                summary.path.display()
            );
        }
        Command::Restore { db, from } => {
            let db = db.unwrap_or(config.backup.database_path);
            let from = from.unwrap_or(config.backup.backup_path);
            let summary = tokio::task::spawn_blocking(move || {
                let store = SqliteChatStore::open(&db)?;
                ChatBackup::new(store, from).restore_chats()
            })
            .await?
            .context("Chat restore failed")?;
            println!(
                "Restored {} chats and {} messages from {}",
                summary.chats,
                summary.messages,
                summary.path.display()
            );
        }
        Command::Listen {
            queue,
            bindings,
            durable,
        } => {
            let (dispatcher, mut deliveries) = dispatch_queue();
            let relay = MessageRelay::spawn(config.relay, Arc::new(AmqpConnector::new()), Arc::new(dispatcher));
            relay
                .set_delivery_callback(|delivery| {
                    println!("[{}] {}", delivery.routing_key, delivery.payload_str());
                })
                .await?;

            let options = QueueOptions::named(queue)
                .durable(durable)
                .exclusive(!durable)
                .auto_delete(!durable);
            let name = relay.connect(options).await.context("Failed to connect relay")?;
            for key in bindings {
                relay
                    .add_binding(key.clone())
                    .await
                    .with_context(|| format!("Failed to bind '{key}'"))?;
            }
            tracing::info!(queue = %name, "Listening, press Ctrl-C to stop");

            let mut state = relay.watch_state();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    more = deliveries.run_next() => if !more { break },
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = state.borrow_and_update().clone();
                        if let RelayState::Disconnected { reason } = current {
                            tracing::warn!(%reason, "Relay disconnected");
                            break;
                        }
                    }
                }
            }
            relay.dispose().await;
        }
        Command::Publish { key, message } => {
            let (dispatcher, _deliveries) = dispatch_queue();
            let relay = MessageRelay::spawn(config.relay, Arc::new(AmqpConnector::new()), Arc::new(dispatcher));
            relay
                .connect(QueueOptions::default().exclusive(true).auto_delete(true))
                .await
                .context("Failed to connect relay")?;
            let sent = relay.publish(key.clone(), message).await?;
            relay.dispose().await;
            if !sent {
                anyhow::bail!("relay was not connected, nothing published to '{key}'");
            }
            println!("Published to '{key}'");
        }
    }
    Ok(())
}
