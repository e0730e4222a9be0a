//! Message Stream Module
//!
//! Maintains, for the selected conversation, an ordered and duplicate-free list of
//! messages built from a historical fetch plus the live insert feed. The merge rules
//! live in the synchronous [`MessageStream`]; [`MessageReconciler`] drives it from a
//! gateway in a background task per selection.

mod reconciler;
mod stream;
mod types;

#[cfg(test)]
mod tests;

pub use reconciler::MessageReconciler;
pub use stream::MessageStream;
pub use types::{AppendOrdering, AppendOutcome, ScopeToken, StreamConfig, StreamState, StreamUpdate};

use crate::gateway::Session;
use crate::palaver::Palaver;

impl Palaver {
    /// Creates a reconciler bound to `session`. Nothing is fetched until a
    /// conversation is selected.
    pub fn open_message_stream(&self, session: &Session) -> MessageReconciler {
        MessageReconciler::new(
            self.gateway.clone(),
            session.clone(),
            self.config.stream.clone(),
        )
    }
}
