//! Synchronous core of the reconciler: selection scoping, history replacement,
//! and the idempotent merge of live inserts.

use std::collections::HashSet;

use crate::gateway::{ConversationId, MessageId};
use crate::palaver::messages::Message;

use super::types::{AppendOrdering, AppendOutcome, ScopeToken, StreamState};

/// The displayed message stream of the selected conversation.
///
/// Invariant: while `Ready`, messages are unique by id. With
/// [`AppendOrdering::SortByTimestamp`] they are also non-decreasing by `created_at`;
/// with [`AppendOrdering::TrustGateway`] that holds as long as the gateway
/// delivers in order.
#[derive(Debug, Default)]
pub struct MessageStream {
    ordering: AppendOrdering,
    generation: u64,
    scope: Option<ScopeToken>,
    state: StreamState,
    seen: HashSet<MessageId>,
    pending: Vec<Message>,
}

impl MessageStream {
    pub fn new(ordering: AppendOrdering) -> Self {
        Self {
            ordering,
            ..Default::default()
        }
    }

    /// Discards the current stream and scopes it to `conversation_id`.
    ///
    /// Returns the token that history and live results for this selection must
    /// carry, or `None` when nothing is selected.
    pub fn select(&mut self, conversation_id: Option<ConversationId>) -> Option<ScopeToken> {
        self.generation += 1;
        self.seen.clear();
        self.pending.clear();

        match conversation_id {
            None => {
                self.scope = None;
                self.state = StreamState::Idle;
                None
            }
            Some(conversation_id) => {
                let token = ScopeToken {
                    conversation_id,
                    generation: self.generation,
                };
                self.scope = Some(token.clone());
                self.state = StreamState::Loading;
                Some(token)
            }
        }
    }

    pub fn is_current(&self, token: &ScopeToken) -> bool {
        self.scope.as_ref() == Some(token)
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.scope.as_ref().map(|scope| &scope.conversation_id)
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// Messages currently displayed; empty unless `Ready`.
    pub fn messages(&self) -> &[Message] {
        self.state.messages()
    }

    /// Applies the historical fetch. The result replaces the stream, then any
    /// inserts buffered during the load are merged in.
    ///
    /// Returns `false` when the token is stale or history was already applied.
    pub fn apply_history(
        &mut self,
        token: &ScopeToken,
        result: Result<Vec<Message>, String>,
    ) -> bool {
        if !self.is_current(token) {
            tracing::debug!(
                target: "palaver::message_stream::apply_history",
                "Discarding late history for conversation {} (generation {})",
                token.conversation_id,
                token.generation
            );
            return false;
        }
        if !self.state.is_loading() {
            return false;
        }

        match result {
            Ok(history) => {
                self.seen.clear();
                let mut messages = Vec::with_capacity(history.len() + self.pending.len());
                for message in history {
                    if self.seen.insert(message.id.clone()) {
                        messages.push(message);
                    }
                }
                self.state = StreamState::Ready(messages);

                for message in std::mem::take(&mut self.pending) {
                    self.merge(message);
                }
            }
            Err(reason) => {
                self.pending.clear();
                self.state = StreamState::Failed(reason);
            }
        }
        true
    }

    /// Merges one live insert. `None` when the token is stale.
    pub fn apply_live(&mut self, token: &ScopeToken, message: Message) -> Option<AppendOutcome> {
        if !self.is_current(token) {
            tracing::debug!(
                target: "palaver::message_stream::apply_live",
                "Discarding live insert {} for stale selection of conversation {}",
                message.id,
                token.conversation_id
            );
            return None;
        }
        if message.conversation_id != token.conversation_id {
            tracing::warn!(
                target: "palaver::message_stream::apply_live",
                "Ignoring insert {} for conversation {} on the feed of {}",
                message.id,
                message.conversation_id,
                token.conversation_id
            );
            return Some(AppendOutcome::Ignored);
        }

        let outcome = match self.state {
            StreamState::Loading => {
                if self.pending.iter().any(|p| p.id == message.id) {
                    AppendOutcome::Dropped
                } else {
                    self.pending.push(message);
                    AppendOutcome::Buffered
                }
            }
            StreamState::Ready(_) => self.merge(message),
            StreamState::Idle | StreamState::Failed(_) => AppendOutcome::Ignored,
        };
        Some(outcome)
    }

    /// Merges a refetched history after the live feed reconnected, appending every
    /// message not already present. Returns what was added.
    pub fn apply_resync(&mut self, token: &ScopeToken, history: Vec<Message>) -> Vec<Message> {
        if !self.is_current(token) || !matches!(self.state, StreamState::Ready(_)) {
            return Vec::new();
        }

        history
            .into_iter()
            .filter(|message| message.conversation_id == token.conversation_id)
            .filter_map(|message| match self.merge(message.clone()) {
                AppendOutcome::Inserted => Some(message),
                _ => None,
            })
            .collect()
    }

    fn merge(&mut self, message: Message) -> AppendOutcome {
        let StreamState::Ready(messages) = &mut self.state else {
            return AppendOutcome::Ignored;
        };
        if !self.seen.insert(message.id.clone()) {
            return AppendOutcome::Dropped;
        }

        match self.ordering {
            AppendOrdering::TrustGateway => messages.push(message),
            AppendOrdering::SortByTimestamp => {
                let position = messages.partition_point(|m| m.created_at <= message.created_at);
                messages.insert(position, message);
            }
        }
        AppendOutcome::Inserted
    }
}
