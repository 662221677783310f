use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{BackupError, ChatRecord, MessageRecord};
use crate::storage::ChatSource;

pub const BACKUP_VERSION: i64 = 1;

/// `{"version":1,"chats":[...],"messages":[...]}`, with `version` always first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDocument {
    pub version: i64,
    pub chats: Vec<ChatRecord>,
    pub messages: Vec<MessageRecord>,
}

impl BackupDocument {
    pub fn new(chats: Vec<ChatRecord>, messages: Vec<MessageRecord>) -> Self {
        Self {
            version: BACKUP_VERSION,
            chats,
            messages,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub chats: usize,
    pub messages: usize,
}

/// Streams every chat and message row from `source` straight into `writer`.
///
/// Only one row is held at a time. The bytes match `serde_json::to_vec` of the
/// equivalent [`BackupDocument`].
pub fn write_document<W: Write>(source: &dyn ChatSource, mut writer: W) -> Result<RowCounts, BackupError> {
    let mut counts = RowCounts::default();

    writer.write_all(b"{\"version\":")?;
    serde_json::to_writer(&mut writer, &BACKUP_VERSION)?;

    writer.write_all(b",\"chats\":[")?;
    source.for_each_chat(&mut |chat| {
        if counts.chats > 0 {
            writer.write_all(b",")?;
        }
        serde_json::to_writer(&mut writer, &chat)?;
        counts.chats += 1;
        Ok(())
    })?;

    writer.write_all(b"],\"messages\":[")?;
    source.for_each_message(&mut |message| {
        if counts.messages > 0 {
            writer.write_all(b",")?;
        }
        serde_json::to_writer(&mut writer, &message)?;
        counts.messages += 1;
        Ok(())
    })?;

    writer.write_all(b"]}")?;
    writer.flush()?;
    Ok(counts)
}

/// Parses a backup, checking `version` before trusting the rest of the layout.
pub fn read_document<R: Read>(reader: R) -> Result<BackupDocument, BackupError> {
    let value: Value = serde_json::from_reader(reader)?;
    let object = value
        .as_object()
        .ok_or_else(|| BackupError::InvalidDocument("top level is not an object".to_string()))?;
    let version = object
        .get("version")
        .ok_or_else(|| BackupError::InvalidDocument("missing version".to_string()))?
        .as_i64()
        .ok_or_else(|| BackupError::InvalidDocument("version is not an integer".to_string()))?;
    if version != BACKUP_VERSION {
        return Err(BackupError::UnsupportedVersion(version));
    }

    let document: BackupDocument = serde_json::from_value(value)?;
    Ok(document)
}
