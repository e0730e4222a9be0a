use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::{ConversationId, Session};
use crate::palaver::{
    Palaver,
    conversations::ConversationRecord,
    error::{PalaverError, Result},
    messages::MessagePreview,
    rendering::format_timestamp,
};

/// Preview line for a conversation that has no messages.
pub const NO_MESSAGES_PLACEHOLDER: &str = "No messages yet";

/// Shown instead of the list when there are no conversations at all.
pub const NO_CONVERSATIONS_PLACEHOLDER: &str = "No chats available";

/// Summary of a conversation for the chat list screen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatListItem {
    pub id: ConversationId,

    pub name: String,

    pub avatar_url: Option<String>,

    /// Avatar fallback when there is no avatar URL
    pub initial: char,

    /// Content of the most recent message, or [`NO_MESSAGES_PLACEHOLDER`]
    pub preview: String,

    /// Formatted time of the most recent message, empty when there is none
    pub preview_time: String,

    pub last_message_at: Option<DateTime<Utc>>,
}

/// Picks the message with the latest `created_at`. On ties the later entry wins,
/// matching the gateway's insertion order.
fn latest_message(messages: &[MessagePreview]) -> Option<&MessagePreview> {
    messages
        .iter()
        .fold(None, |latest: Option<&MessagePreview>, candidate| match latest {
            Some(current) if current.created_at > candidate.created_at => Some(current),
            _ => Some(candidate),
        })
}

/// Upper-cased first letter of the name, `?` when the name is blank.
fn name_initial(name: &str) -> char {
    name.trim()
        .chars()
        .next()
        .and_then(|c| c.to_uppercase().next())
        .unwrap_or('?')
}

/// Assembles chat list items from conversation records, keeping the gateway's order.
pub(crate) fn build_chat_list<Tz>(records: &[ConversationRecord], now: DateTime<Tz>) -> Vec<ChatListItem>
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    records
        .iter()
        .map(|record| {
            let conversation = &record.conversation;
            let last = latest_message(&record.messages);

            let (preview, preview_time) = match last {
                Some(message) if !message.content.is_empty() => (
                    message.content.clone(),
                    format_timestamp(message.created_at, now.clone()),
                ),
                Some(message) => (
                    NO_MESSAGES_PLACEHOLDER.to_string(),
                    format_timestamp(message.created_at, now.clone()),
                ),
                None => (NO_MESSAGES_PLACEHOLDER.to_string(), String::new()),
            };

            ChatListItem {
                id: conversation.id.clone(),
                name: conversation.name.clone(),
                avatar_url: conversation
                    .avatar_url
                    .clone()
                    .filter(|url| !url.is_empty()),
                initial: name_initial(&conversation.name),
                preview,
                preview_time,
                last_message_at: last.map(|m| m.created_at),
            }
        })
        .collect()
}

impl Palaver {
    /// Retrieves the conversation list with a preview of each conversation's latest message.
    pub async fn get_chat_list(&self, session: &Session) -> Result<Vec<ChatListItem>> {
        let records = self
            .gateway
            .list_conversations(session)
            .await
            .map_err(|e| {
                tracing::warn!(
                    target: "palaver::chat_list::get_chat_list",
                    "Failed to list conversations: {}",
                    e
                );
                PalaverError::Fetch(e.to_string())
            })?;

        tracing::debug!(
            target: "palaver::chat_list::get_chat_list",
            "Loaded {} conversations",
            records.len()
        );

        Ok(build_chat_list(&records, Local::now()))
    }
}
