//! Types for the message stream reconciler.

use serde::{Deserialize, Serialize};

use crate::gateway::ConversationId;
use crate::palaver::messages::Message;
use crate::palaver::retry::RetryPolicy;

/// Observable state of the selected conversation's stream.
///
/// `Loading` and `Failed` are distinct from an empty `Ready`, so a view can tell
/// "still loading", "failed with reason" and "no messages" apart.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    /// No conversation selected
    #[default]
    Idle,

    /// History fetch in flight
    Loading,

    /// History loaded. Messages are unique by id.
    Ready(Vec<Message>),

    /// History fetch failed; the reason is kept verbatim
    Failed(String),
}

impl StreamState {
    pub fn is_loading(&self) -> bool {
        matches!(self, StreamState::Loading)
    }

    pub fn messages(&self) -> &[Message] {
        match self {
            StreamState::Ready(messages) => messages,
            _ => &[],
        }
    }
}

/// What happened to a live insert handed to the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendOutcome {
    /// Added to the displayed stream
    Inserted,

    /// A message with the same id is already present
    Dropped,

    /// History is still loading; held until it lands
    Buffered,

    /// The stream failed to load, or the message belongs to another conversation
    Ignored,
}

/// Where live inserts are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AppendOrdering {
    /// Append to the end, trusting the gateway to deliver inserts in
    /// non-decreasing `created_at` order after the history tail.
    #[default]
    TrustGateway,

    /// Insert after the last message whose `created_at` is not later than the
    /// new one, so the stream stays sorted even if delivery is out of order.
    SortByTimestamp,
}

/// Identifies one selection. Results presented with a token from an earlier
/// selection are discarded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeToken {
    pub(crate) conversation_id: ConversationId,
    pub(crate) generation: u64,
}

impl ScopeToken {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }
}

/// Pushed to views whenever the stream changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamUpdate {
    /// A new selection replaced the previous stream. `None` means deselected.
    Selected {
        conversation_id: Option<ConversationId>,
    },

    /// History landed, including any inserts buffered while it loaded.
    Loaded {
        conversation_id: ConversationId,
        count: usize,
    },

    Failed {
        conversation_id: ConversationId,
        reason: String,
    },

    Appended {
        conversation_id: ConversationId,
        message: Message,
    },

    /// Messages recovered by refetching history after the live feed reconnected.
    Resynced {
        conversation_id: ConversationId,
        added: Vec<Message>,
    },

    /// The live feed could not be re-established. The stream keeps what it has.
    LiveFeedLost {
        conversation_id: ConversationId,
        reason: String,
    },
}

/// Configuration for the message stream reconciler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub ordering: AppendOrdering,

    /// Backoff used to re-open a dropped live feed
    pub resubscribe: RetryPolicy,

    /// Capacity of the update broadcast channel
    pub update_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ordering: AppendOrdering::TrustGateway,
            resubscribe: RetryPolicy::default(),
            update_buffer: 256,
        }
    }
}
