pub mod memory;
#[cfg(feature = "storage")]
pub mod sqlite;

pub use memory::MemoryChatStore;
#[cfg(feature = "storage")]
pub use sqlite::SqliteChatStore;

use std::sync::Arc;

use crate::core::{BackupError, ChatRecord, MessageRecord};

pub type Visit<'a, T> = &'a mut dyn FnMut(T) -> Result<(), BackupError>;

/// Read-only, ordered view over local chat rows. Rows are handed out one at a time so
/// callers never need the whole history in memory.
pub trait ChatSource {
    fn for_each_chat(&self, visit: Visit<'_, ChatRecord>) -> Result<(), BackupError>;
    fn for_each_message(&self, visit: Visit<'_, MessageRecord>) -> Result<(), BackupError>;
}

/// Write side used by restore. Chats upsert on `chat_id`. Messages have no key, so a
/// message is added only while the store holds fewer identical rows than the batch does.
/// Restoring the same rows twice therefore changes nothing.
pub trait ChatSink {
    fn upsert_records(&self, chats: &[ChatRecord], messages: &[MessageRecord]) -> Result<(), BackupError>;
}

impl<T: ChatSource + ?Sized> ChatSource for Arc<T> {
    fn for_each_chat(&self, visit: Visit<'_, ChatRecord>) -> Result<(), BackupError> {
        (**self).for_each_chat(visit)
    }

    fn for_each_message(&self, visit: Visit<'_, MessageRecord>) -> Result<(), BackupError> {
        (**self).for_each_message(visit)
    }
}

impl<T: ChatSink + ?Sized> ChatSink for Arc<T> {
    fn upsert_records(&self, chats: &[ChatRecord], messages: &[MessageRecord]) -> Result<(), BackupError> {
        (**self).upsert_records(chats, messages)
    }
}
