//! Chat backup and restore.
//!
//! A backup is a single JSON document holding every chat row and message row, written
//! atomically next to its final path and renamed into place. Restoring upserts the rows
//! back, so running it twice on the same file changes nothing the second time.

pub mod document;

pub use document::{read_document, write_document, BackupDocument, RowCounts, BACKUP_VERSION};

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::core::BackupError;
use crate::storage::{ChatSink, ChatSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub path: PathBuf,
    pub chats: usize,
    pub messages: usize,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub path: PathBuf,
    pub chats: usize,
    pub messages: usize,
}

pub struct ChatBackup<S> {
    store: S,
    target: PathBuf,
}

impl<S> ChatBackup<S> {
    pub fn new(store: S, target: impl Into<PathBuf>) -> Self {
        Self {
            store,
            target: target.into(),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: ChatSource> ChatBackup<S> {
    /// Writes the full backup. The previous backup stays intact until the new one is
    /// completely on disk.
    #[instrument(skip(self), fields(target = %self.target.display()))]
    pub fn backup_chats(&self) -> Result<BackupSummary, BackupError> {
        let staging = staging_path(&self.target);
        match self.write_staged(&staging) {
            Ok(counts) => {
                fs::rename(&staging, &self.target)?;
                info!(chats = counts.chats, messages = counts.messages, "Chat backup written");
                Ok(BackupSummary {
                    path: self.target.clone(),
                    chats: counts.chats,
                    messages: counts.messages,
                    written_at: Utc::now(),
                })
            }
            Err(e) => {
                warn!(error = %e, "Chat backup failed");
                if let Err(cleanup) = fs::remove_file(&staging) {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(error = %cleanup, path = %staging.display(), "Failed to remove staging file");
                    }
                }
                Err(e)
            }
        }
    }

    fn write_staged(&self, staging: &Path) -> Result<RowCounts, BackupError> {
        if let Some(parent) = staging.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(staging)?;
        let mut writer = BufWriter::new(file);
        let counts = write_document(&self.store, &mut writer)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| BackupError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(counts)
    }

    /// Streams the backup document into any writer instead of the target file.
    pub fn backup_to_writer<W: Write>(&self, writer: W) -> Result<RowCounts, BackupError> {
        write_document(&self.store, writer)
    }
}

impl<S: ChatSink> ChatBackup<S> {
    #[instrument(skip(self), fields(target = %self.target.display()))]
    pub fn restore_chats(&self) -> Result<RestoreSummary, BackupError> {
        let file = File::open(&self.target)?;
        let document = read_document(BufReader::new(file))?;
        self.store.upsert_records(&document.chats, &document.messages)?;
        info!(chats = document.chats.len(), messages = document.messages.len(), "Chat backup restored");
        Ok(RestoreSummary {
            path: self.target.clone(),
            chats: document.chats.len(),
            messages: document.messages.len(),
        })
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_file_sits_next_to_target() {
        assert_eq!(
            staging_path(Path::new("/data/chat_backup.json")),
            PathBuf::from("/data/chat_backup.json.partial")
        );
    }
}
