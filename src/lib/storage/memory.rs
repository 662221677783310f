use std::collections::HashMap;
use std::sync::RwLock;

use super::{ChatSink, ChatSource, Visit};
use crate::core::{BackupError, ChatRecord, MessageRecord};

/// Vec-backed chat store, iterated in insertion order.
#[derive(Default)]
pub struct MemoryChatStore {
    chats: RwLock<Vec<ChatRecord>>,
    messages: RwLock<Vec<MessageRecord>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(chats: Vec<ChatRecord>, messages: Vec<MessageRecord>) -> Self {
        Self {
            chats: RwLock::new(chats),
            messages: RwLock::new(messages),
        }
    }

    pub fn chats(&self) -> Result<Vec<ChatRecord>, BackupError> {
        Ok(self.chats.read().map_err(poisoned)?.clone())
    }

    pub fn messages(&self) -> Result<Vec<MessageRecord>, BackupError> {
        Ok(self.messages.read().map_err(poisoned)?.clone())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> BackupError {
    BackupError::Storage("chat store lock poisoned".to_string())
}

impl ChatSource for MemoryChatStore {
    fn for_each_chat(&self, visit: Visit<'_, ChatRecord>) -> Result<(), BackupError> {
        let chats = self.chats.read().map_err(poisoned)?;
        for chat in chats.iter() {
            visit(chat.clone())?;
        }
        Ok(())
    }

    fn for_each_message(&self, visit: Visit<'_, MessageRecord>) -> Result<(), BackupError> {
        let messages = self.messages.read().map_err(poisoned)?;
        for message in messages.iter() {
            visit(message.clone())?;
        }
        Ok(())
    }
}

impl ChatSink for MemoryChatStore {
    fn upsert_records(&self, chats: &[ChatRecord], messages: &[MessageRecord]) -> Result<(), BackupError> {
        let mut stored_chats = self.chats.write().map_err(poisoned)?;
        let mut chat_index: HashMap<String, usize> = stored_chats
            .iter()
            .enumerate()
            .map(|(i, c)| (c.chat_id.clone(), i))
            .collect();
        for chat in chats {
            match chat_index.get(&chat.chat_id) {
                Some(&i) => stored_chats[i] = chat.clone(),
                None => {
                    chat_index.insert(chat.chat_id.clone(), stored_chats.len());
                    stored_chats.push(chat.clone());
                }
            }
        }

        let mut stored_messages = self.messages.write().map_err(poisoned)?;
        let mut held: HashMap<MessageRecord, usize> = HashMap::new();
        for message in stored_messages.iter() {
            *held.entry(message.clone()).or_default() += 1;
        }
        let mut copies: HashMap<&MessageRecord, usize> = HashMap::new();
        for message in messages {
            let copy = copies.entry(message).or_default();
            *copy += 1;
            let existing = held.entry(message.clone()).or_default();
            if *existing < *copy {
                *existing += 1;
                stored_messages.push(message.clone());
            }
        }
        Ok(())
    }
}
