use serde::{Deserialize, Serialize};

/// One conversation row. Field order is the backup document's field order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatRecord {
    pub chat_id: String,
    pub chat_type: String,
    pub last_message_id: String,
    pub user_id: String,
    pub unread_count: i64,
    pub timestamp: String,
    pub timestamp_human: String,
    pub timestamp_epoch: i64,
}

/// One message row inside a conversation. Messages carry no id of their own, so two rows
/// are the same message only when every field matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageRecord {
    pub chat_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub user_id: String,
    pub sent_at: String,
    pub message: String,
    pub timestamp: String,
    pub timestamp_human: String,
    pub timestamp_epoch: i64,
    pub chat_status: i64,
}

