use serde::{Deserialize, Serialize};

use crate::gateway::{ConversationId, GatewayError, Session};
use crate::palaver::{
    Palaver,
    error::{PalaverError, Result},
    messages::MessagePreview,
};

/// Title shown when a conversation has no usable name.
pub const DEFAULT_CONVERSATION_TITLE: &str = "Chat";

/// A conversation ("chats" row). Read-only from the client's side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// A conversation together with the content and time of each of its messages,
/// as returned by the conversation listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    #[serde(flatten)]
    pub conversation: Conversation,

    #[serde(default, deserialize_with = "deserialize_nullable_list")]
    pub messages: Vec<MessagePreview>,
}

fn deserialize_nullable_list<'de, D>(
    deserializer: D,
) -> core::result::Result<Vec<MessagePreview>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<MessagePreview>>::deserialize(deserializer)?.unwrap_or_default())
}

/// What the thread view shows above the messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationHeader {
    pub title: String,
    pub avatar_url: Option<String>,
}

impl ConversationHeader {
    pub fn from_conversation(conversation: Option<&Conversation>) -> Self {
        match conversation {
            Some(conversation) => Self {
                title: display_name(&conversation.name).to_string(),
                avatar_url: conversation
                    .avatar_url
                    .clone()
                    .filter(|url| !url.is_empty()),
            },
            None => Self {
                title: DEFAULT_CONVERSATION_TITLE.to_string(),
                avatar_url: None,
            },
        }
    }
}

fn display_name(name: &str) -> &str {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        DEFAULT_CONVERSATION_TITLE
    } else {
        trimmed
    }
}

impl Palaver {
    /// Fetches a single conversation's details.
    pub async fn get_conversation(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> Result<Conversation> {
        match self
            .gateway
            .get_conversation(session, conversation_id)
            .await
        {
            Ok(conversation) => Ok(conversation),
            Err(GatewayError::NotFound) => Err(PalaverError::ConversationNotFound(
                conversation_id.to_string(),
            )),
            Err(e) => Err(PalaverError::Fetch(e.to_string())),
        }
    }

    /// Resolves the thread header. Lookup failures fall back to the default title
    /// rather than failing the thread view.
    pub async fn conversation_header(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> ConversationHeader {
        match self.get_conversation(session, conversation_id).await {
            Ok(conversation) => ConversationHeader::from_conversation(Some(&conversation)),
            Err(e) => {
                tracing::warn!(
                    target: "palaver::conversations::conversation_header",
                    "Failed to load details for conversation {}: {}",
                    conversation_id,
                    e
                );
                ConversationHeader::from_conversation(None)
            }
        }
    }
}
