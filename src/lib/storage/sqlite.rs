use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, Row};

use super::{ChatSink, ChatSource, Visit};
use crate::core::{BackupError, ChatRecord, MessageRecord};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS chats (
        chat_id TEXT PRIMARY KEY,
        chat_type TEXT,
        last_message_id TEXT,
        user_id TEXT,
        unread_count INTEGER,
        timestamp TEXT,
        timestamp_human TEXT,
        timestamp_epoch INTEGER
    );
    CREATE TABLE IF NOT EXISTS chat_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        chat_id TEXT,
        sender_id TEXT,
        receiver_id TEXT,
        user_id TEXT,
        sent_at TEXT,
        message TEXT,
        timestamp TEXT,
        timestamp_human TEXT,
        timestamp_epoch INTEGER,
        chat_status INTEGER
    );
    CREATE INDEX IF NOT EXISTS chat_messages_by_sender
        ON chat_messages (chat_id, sender_id, sent_at, timestamp);
";

pub struct SqliteChatStore {
    conn: Mutex<Connection>,
}

impl SqliteChatStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackupError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, BackupError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, BackupError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, BackupError> {
        self.conn
            .lock()
            .map_err(|_| BackupError::Storage("sqlite connection lock poisoned".to_string()))
    }

    pub fn insert_chat(&self, chat: &ChatRecord) -> Result<(), BackupError> {
        self.upsert_records(std::slice::from_ref(chat), &[])
    }

    pub fn insert_message(&self, message: &MessageRecord) -> Result<(), BackupError> {
        self.upsert_records(&[], std::slice::from_ref(message))
    }

    pub fn chat_count(&self) -> Result<i64, BackupError> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM chats", [], |row| row.get(0))?)
    }

    pub fn message_count(&self) -> Result<i64, BackupError> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM chat_messages", [], |row| row.get(0))?)
    }
}

// Columns are nullable; a NULL projects to "" or 0.
fn text(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
}

fn int(row: &Row<'_>, idx: usize) -> rusqlite::Result<i64> {
    Ok(row.get::<_, Option<i64>>(idx)?.unwrap_or_default())
}

fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<ChatRecord> {
    Ok(ChatRecord {
        chat_id: text(row, 0)?,
        chat_type: text(row, 1)?,
        last_message_id: text(row, 2)?,
        user_id: text(row, 3)?,
        unread_count: int(row, 4)?,
        timestamp: text(row, 5)?,
        timestamp_human: text(row, 6)?,
        timestamp_epoch: int(row, 7)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        chat_id: text(row, 0)?,
        sender_id: text(row, 1)?,
        receiver_id: text(row, 2)?,
        user_id: text(row, 3)?,
        sent_at: text(row, 4)?,
        message: text(row, 5)?,
        timestamp: text(row, 6)?,
        timestamp_human: text(row, 7)?,
        timestamp_epoch: int(row, 8)?,
        chat_status: int(row, 9)?,
    })
}

impl ChatSource for SqliteChatStore {
    fn for_each_chat(&self, visit: Visit<'_, ChatRecord>) -> Result<(), BackupError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT chat_id, chat_type, last_message_id, user_id, unread_count,
                    timestamp, timestamp_human, timestamp_epoch
             FROM chats ORDER BY rowid",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            visit(chat_from_row(row)?)?;
        }
        Ok(())
    }

    fn for_each_message(&self, visit: Visit<'_, MessageRecord>) -> Result<(), BackupError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT chat_id, sender_id, receiver_id, user_id, sent_at, message,
                    timestamp, timestamp_human, timestamp_epoch, chat_status
             FROM chat_messages ORDER BY id",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            visit(message_from_row(row)?)?;
        }
        Ok(())
    }
}

impl ChatSink for SqliteChatStore {
    fn upsert_records(&self, chats: &[ChatRecord], messages: &[MessageRecord]) -> Result<(), BackupError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chats (chat_id, chat_type, last_message_id, user_id, unread_count,
                                    timestamp, timestamp_human, timestamp_epoch)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(chat_id) DO UPDATE SET
                    chat_type = excluded.chat_type,
                    last_message_id = excluded.last_message_id,
                    user_id = excluded.user_id,
                    unread_count = excluded.unread_count,
                    timestamp = excluded.timestamp,
                    timestamp_human = excluded.timestamp_human,
                    timestamp_epoch = excluded.timestamp_epoch",
            )?;
            for chat in chats {
                stmt.execute(params![
                    chat.chat_id,
                    chat.chat_type,
                    chat.last_message_id,
                    chat.user_id,
                    chat.unread_count,
                    chat.timestamp,
                    chat.timestamp_human,
                    chat.timestamp_epoch,
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                // The n-th copy of a message in a batch is inserted only while fewer than n
                // identical rows exist. NULL columns compare as their backup projection.
                "INSERT INTO chat_messages (chat_id, sender_id, receiver_id, user_id, sent_at, message,
                                            timestamp, timestamp_human, timestamp_epoch, chat_status)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
                 WHERE (
                    SELECT COUNT(*) FROM chat_messages
                    WHERE IFNULL(chat_id, '') = ?1
                      AND IFNULL(sender_id, '') = ?2
                      AND IFNULL(receiver_id, '') = ?3
                      AND IFNULL(user_id, '') = ?4
                      AND IFNULL(sent_at, '') = ?5
                      AND IFNULL(message, '') = ?6
                      AND IFNULL(timestamp, '') = ?7
                      AND IFNULL(timestamp_human, '') = ?8
                      AND IFNULL(timestamp_epoch, 0) = ?9
                      AND IFNULL(chat_status, 0) = ?10
                 ) < ?11",
            )?;
            let mut copies: HashMap<&MessageRecord, i64> = HashMap::new();
            for message in messages {
                let copy = copies.entry(message).or_default();
                *copy += 1;
                stmt.execute(params![
                    message.chat_id,
                    message.sender_id,
                    message.receiver_id,
                    message.user_id,
                    message.sent_at,
                    message.message,
                    message.timestamp,
                    message.timestamp_human,
                    message.timestamp_epoch,
                    message.chat_status,
                    *copy,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
