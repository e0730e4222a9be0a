use thiserror::Error;

use crate::gateway::GatewayError;

pub type Result<T> = core::result::Result<T, PalaverError>;

/// Nothing here is fatal to the process: each variant is either shown inline by
/// the caller or written to the operational log.
#[derive(Error, Debug)]
pub enum PalaverError {
    /// Bad credentials. Shown inline on the login screen.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A read from the gateway failed: the conversation list, a conversation's
    /// details or its message history.
    #[error("Failed to load: {0}")]
    Fetch(String),

    /// A message insert or blob upload failed. The draft is kept for a retry.
    #[error("Failed to send: {0}")]
    Write(String),

    /// No authenticated user (or no email) at send time. Nothing was written.
    #[error("No authenticated user with an email address")]
    MissingIdentity,

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}
