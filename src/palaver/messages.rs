use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::{ConversationId, MessageId, deserialize_timestamp};

/// A chat message as stored by the gateway. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Assigned by the gateway on insert
    pub id: MessageId,

    #[serde(rename = "chat_id")]
    pub conversation_id: ConversationId,

    /// Email address of the author at send time
    pub sender: String,

    /// Plain text, or the public URL of an uploaded attachment
    pub content: String,

    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar_url: Option<String>,
}

/// The insert payload the composer writes. The gateway assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(rename = "chat_id")]
    pub conversation_id: ConversationId,
    pub sender: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn new(conversation_id: ConversationId, sender: String, content: String) -> Self {
        Self {
            conversation_id,
            sender,
            content,
            created_at: Utc::now(),
        }
    }

    /// Materializes the stored row once the gateway has picked an id.
    pub(crate) fn into_message(self, id: MessageId) -> Message {
        Message {
            id,
            conversation_id: self.conversation_id,
            sender: self.sender,
            content: self.content,
            created_at: self.created_at,
            sender_avatar_url: None,
        }
    }
}

/// The slice of a message the conversation list needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub content: String,

    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessagePreview {
    fn from(message: &Message) -> Self {
        Self {
            content: message.content.clone(),
            created_at: message.created_at,
        }
    }
}
