//! Backend gateway seam.
//!
//! Everything the client persists or receives goes through a [`Gateway`]: sign-in,
//! conversation and message queries, message inserts, the per-conversation insert
//! feed, and blob uploads. [`supabase::SupabaseGateway`] talks to the hosted backend;
//! [`memory::MemoryGateway`] keeps everything in process for tests and offline use.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::palaver::conversations::{Conversation, ConversationRecord};
use crate::palaver::messages::{Message, NewMessage};

pub mod memory;
pub mod supabase;
mod types;

pub(crate) use types::deserialize_timestamp;
pub use types::{ConversationId, MessageId, Session, User};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Record not found")]
    NotFound,

    #[error("Gateway returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Realtime error: {0}")]
    Realtime(String),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

/// Something delivered on a live insert feed.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A message row was inserted into the subscribed conversation.
    Insert(Message),

    /// The feed failed or was dropped by the gateway. No further inserts will
    /// arrive on this subscription.
    Error(String),
}

/// A live insert feed scoped to one conversation.
///
/// Closing consumes the subscription, so it can only happen once; dropping an
/// unclosed subscription closes it as well.
pub struct Subscription {
    conversation_id: ConversationId,
    events: mpsc::Receiver<SubscriptionEvent>,
    close_signal: Option<oneshot::Sender<()>>,
}

impl Subscription {
    /// Wraps the receiving half of a feed. The producer must stop delivering once
    /// `close_signal` fires (or its receiver observes the sender being dropped).
    pub fn new(
        conversation_id: ConversationId,
        events: mpsc::Receiver<SubscriptionEvent>,
        close_signal: oneshot::Sender<()>,
    ) -> Self {
        Self {
            conversation_id,
            events,
            close_signal: Some(close_signal),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Waits for the next event. `None` means the producer went away.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    pub fn close(mut self) {
        self.signal_close();
    }

    fn signal_close(&mut self) {
        if let Some(signal) = self.close_signal.take() {
            tracing::debug!(
                target: "palaver::gateway::subscription",
                "Closing insert feed for conversation {}",
                self.conversation_id
            );
            // The producer may already be gone
            let _ = signal.send(());
        }
        self.events.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.signal_close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("conversation_id", &self.conversation_id)
            .field("closed", &self.close_signal.is_none())
            .finish()
    }
}

/// The operations a chat client needs from its backend.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Exchanges a credential pair for a session.
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, GatewayError>;

    /// Looks up the user behind a session. `None` when the session is no longer valid.
    async fn current_user(&self, session: &Session) -> Result<Option<User>, GatewayError>;

    /// Every conversation visible to the session, each with its messages' content
    /// and creation time.
    async fn list_conversations(
        &self,
        session: &Session,
    ) -> Result<Vec<ConversationRecord>, GatewayError>;

    async fn get_conversation(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> Result<Conversation, GatewayError>;

    /// All messages of a conversation ordered by `created_at` ascending.
    async fn list_messages(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, GatewayError>;

    async fn insert_message(
        &self,
        session: &Session,
        message: &NewMessage,
    ) -> Result<(), GatewayError>;

    /// Opens a feed of message inserts filtered to one conversation.
    async fn subscribe_inserts(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> Result<Subscription, GatewayError>;

    async fn upload_blob(
        &self,
        session: &Session,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), GatewayError>;

    /// Publicly resolvable address of an uploaded blob.
    fn public_url(&self, path: &str) -> String;
}
