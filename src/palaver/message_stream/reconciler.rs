//! Async driver that feeds a [`MessageStream`] from the gateway.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::gateway::{ConversationId, Gateway, Session, Subscription, SubscriptionEvent};
use crate::palaver::messages::Message;
use crate::palaver::retry::execute_with_retry;

use super::stream::MessageStream;
use super::types::{AppendOutcome, ScopeToken, StreamConfig, StreamState, StreamUpdate};

struct ActiveScope {
    token: ScopeToken,
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Keeps the selected conversation's message stream in sync with the gateway.
///
/// Each selection runs in its own background task that opens the live insert feed,
/// loads history, and merges inserts as they arrive. Selecting another conversation
/// (or tearing down) cancels that task, which closes its feed; results that still
/// trickle in for the old selection are discarded by scope token.
pub struct MessageReconciler {
    gateway: Arc<dyn Gateway>,
    session: Session,
    config: StreamConfig,
    stream: Arc<Mutex<MessageStream>>,
    updates: broadcast::Sender<StreamUpdate>,
    active: Option<ActiveScope>,
}

impl MessageReconciler {
    pub fn new(gateway: Arc<dyn Gateway>, session: Session, config: StreamConfig) -> Self {
        let (updates, _) = broadcast::channel(config.update_buffer.max(1));
        Self {
            stream: Arc::new(Mutex::new(MessageStream::new(config.ordering))),
            gateway,
            session,
            config,
            updates,
            active: None,
        }
    }

    /// Receiver for stream changes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamUpdate> {
        self.updates.subscribe()
    }

    pub async fn snapshot(&self) -> StreamState {
        self.stream.lock().await.state().clone()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.stream.lock().await.messages().to_vec()
    }

    pub fn selected(&self) -> Option<&ConversationId> {
        self.active.as_ref().map(|active| &active.token.conversation_id)
    }

    /// Switches the stream to `conversation_id`, or clears it for `None`.
    ///
    /// The previous selection's task is stopped before the new one starts. With
    /// `None` no gateway call is made.
    pub async fn select(&mut self, conversation_id: Option<ConversationId>) {
        self.stop_active().await;

        let token = self.stream.lock().await.select(conversation_id.clone());
        let _ = self.updates.send(StreamUpdate::Selected { conversation_id });

        let Some(token) = token else {
            return;
        };

        tracing::debug!(
            target: "palaver::message_stream::select",
            "Selected conversation {}",
            token.conversation_id
        );

        let (cancel, cancelled) = oneshot::channel();
        let task = ScopeTask {
            gateway: self.gateway.clone(),
            session: self.session.clone(),
            config: self.config.clone(),
            stream: self.stream.clone(),
            updates: self.updates.clone(),
            token: token.clone(),
        };
        let handle = tokio::spawn(task.run(cancelled));

        self.active = Some(ActiveScope {
            token,
            cancel,
            handle,
        });
    }

    /// Stops the live feed and clears the stream.
    pub async fn teardown(&mut self) {
        let was_active = self.active.is_some();
        self.stop_active().await;
        self.stream.lock().await.select(None);
        if was_active {
            let _ = self.updates.send(StreamUpdate::Selected {
                conversation_id: None,
            });
        }
    }

    async fn stop_active(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        // The task may already have finished
        let _ = active.cancel.send(());
        if let Err(e) = active.handle.await {
            tracing::warn!(
                target: "palaver::message_stream::stop_active",
                "Stream task for conversation {} ended abnormally: {}",
                active.token.conversation_id,
                e
            );
        }
    }
}

impl Drop for MessageReconciler {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.cancel.send(());
        }
    }
}

impl std::fmt::Debug for MessageReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReconciler")
            .field("config", &self.config)
            .field("selected", &self.selected())
            .field("session", &self.session)
            .finish()
    }
}

enum LoadStep {
    History(Result<Vec<Message>, String>),
    Event(Option<SubscriptionEvent>),
}

/// Everything one selection's background task needs.
struct ScopeTask {
    gateway: Arc<dyn Gateway>,
    session: Session,
    config: StreamConfig,
    stream: Arc<Mutex<MessageStream>>,
    updates: broadcast::Sender<StreamUpdate>,
    token: ScopeToken,
}

impl ScopeTask {
    async fn run(self, cancelled: oneshot::Receiver<()>) {
        let conversation_id = self.token.conversation_id.clone();
        // Dropping `drive` drops its subscription, which closes the feed
        tokio::select! {
            biased;
            _ = cancelled => {
                tracing::debug!(
                    target: "palaver::message_stream::run",
                    "Stream task for conversation {} cancelled",
                    conversation_id
                );
            }
            _ = self.drive() => {}
        }
    }

    async fn drive(&self) {
        let conversation_id = &self.token.conversation_id;

        // Open the feed before fetching so nothing inserted during the fetch is missed
        let mut feed = match self
            .gateway
            .subscribe_inserts(&self.session, conversation_id)
            .await
        {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                tracing::warn!(
                    target: "palaver::message_stream::drive",
                    "Failed to open live feed for conversation {}: {}",
                    conversation_id,
                    e
                );
                None
            }
        };

        let history = self.gateway.list_messages(&self.session, conversation_id);
        tokio::pin!(history);

        loop {
            let step = tokio::select! {
                result = &mut history => LoadStep::History(result.map_err(|e| e.to_string())),
                event = next_event(&mut feed) => LoadStep::Event(event),
            };

            match step {
                LoadStep::History(result) => {
                    if !self.apply_history(result).await {
                        return;
                    }
                    break;
                }
                LoadStep::Event(Some(SubscriptionEvent::Insert(message))) => {
                    self.apply_live(message).await;
                }
                LoadStep::Event(Some(SubscriptionEvent::Error(reason))) => {
                    tracing::warn!(
                        target: "palaver::message_stream::drive",
                        "Live feed for conversation {} failed while loading: {}",
                        conversation_id,
                        reason
                    );
                    feed = None;
                }
                LoadStep::Event(None) => {
                    feed = None;
                }
            }
        }

        self.follow(feed).await;
    }

    /// Pumps live inserts until cancelled, re-opening the feed when it drops.
    ///
    /// Every re-opened feed is followed by a history refetch, since inserts made
    /// while the feed was down were never delivered.
    async fn follow(&self, mut feed: Option<Subscription>) {
        let conversation_id = &self.token.conversation_id;

        loop {
            if feed.is_none() {
                match self.resubscribe().await {
                    Ok(subscription) => {
                        feed = Some(subscription);
                        self.resync().await;
                    }
                    Err(reason) => {
                        tracing::warn!(
                            target: "palaver::message_stream::follow",
                            "Giving up on live feed for conversation {}: {}",
                            conversation_id,
                            reason
                        );
                        let _ = self.updates.send(StreamUpdate::LiveFeedLost {
                            conversation_id: conversation_id.clone(),
                            reason,
                        });
                        return;
                    }
                }
            }

            let Some(subscription) = feed.as_mut() else {
                continue;
            };

            match subscription.next().await {
                Some(SubscriptionEvent::Insert(message)) => {
                    self.apply_live(message).await;
                }
                Some(SubscriptionEvent::Error(reason)) => {
                    tracing::warn!(
                        target: "palaver::message_stream::follow",
                        "Live feed for conversation {} dropped: {}",
                        conversation_id,
                        reason
                    );
                    feed = None;
                }
                None => {
                    tracing::warn!(
                        target: "palaver::message_stream::follow",
                        "Live feed for conversation {} ended",
                        conversation_id
                    );
                    feed = None;
                }
            }
        }
    }

    async fn resubscribe(&self) -> Result<Subscription, String> {
        let conversation_id = self.token.conversation_id.clone();
        let description = format!("resubscribe to conversation {}", conversation_id);

        execute_with_retry(
            description,
            &self.config.resubscribe,
            || {
                let gateway = self.gateway.clone();
                let session = self.session.clone();
                let conversation_id = conversation_id.clone();
                async move {
                    gateway
                        .subscribe_inserts(&session, &conversation_id)
                        .await
                }
            },
            |attempt, max_attempts, delay, e| {
                tracing::info!(
                    target: "palaver::message_stream::resubscribe",
                    "Resubscribe attempt {}/{} for conversation {} failed, retrying in {:?}: {}",
                    attempt,
                    max_attempts,
                    conversation_id,
                    delay,
                    e
                );
            },
        )
        .await
        .map_err(|e| e.to_string())
    }

    /// Refetches history after a reconnect and appends whatever the feed missed.
    async fn resync(&self) {
        let conversation_id = &self.token.conversation_id;
        let history = match self
            .gateway
            .list_messages(&self.session, conversation_id)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(
                    target: "palaver::message_stream::resync",
                    "Failed to refetch history for conversation {}: {}",
                    conversation_id,
                    e
                );
                return;
            }
        };

        let added = self.stream.lock().await.apply_resync(&self.token, history);
        if !added.is_empty() {
            tracing::debug!(
                target: "palaver::message_stream::resync",
                "Recovered {} messages for conversation {}",
                added.len(),
                conversation_id
            );
            let _ = self.updates.send(StreamUpdate::Resynced {
                conversation_id: conversation_id.clone(),
                added,
            });
        }
    }

    /// Returns `false` when the stream should stop (load failed or selection moved on).
    async fn apply_history(&self, result: Result<Vec<Message>, String>) -> bool {
        let conversation_id = self.token.conversation_id.clone();
        let loaded = {
            let mut stream = self.stream.lock().await;
            if !stream.apply_history(&self.token, result) {
                return false;
            }
            match stream.state() {
                StreamState::Ready(messages) => Ok(messages.len()),
                StreamState::Failed(reason) => Err(reason.clone()),
                StreamState::Idle | StreamState::Loading => return false,
            }
        };

        match loaded {
            Ok(count) => {
                tracing::debug!(
                    target: "palaver::message_stream::apply_history",
                    "Loaded {} messages for conversation {}",
                    count,
                    conversation_id
                );
                let _ = self.updates.send(StreamUpdate::Loaded {
                    conversation_id,
                    count,
                });
                true
            }
            Err(reason) => {
                tracing::warn!(
                    target: "palaver::message_stream::apply_history",
                    "Failed to load messages for conversation {}: {}",
                    conversation_id,
                    reason
                );
                let _ = self.updates.send(StreamUpdate::Failed {
                    conversation_id,
                    reason,
                });
                false
            }
        }
    }

    async fn apply_live(&self, message: Message) {
        let outcome = self
            .stream
            .lock()
            .await
            .apply_live(&self.token, message.clone());

        match outcome {
            Some(AppendOutcome::Inserted) => {
                let _ = self.updates.send(StreamUpdate::Appended {
                    conversation_id: self.token.conversation_id.clone(),
                    message,
                });
            }
            Some(AppendOutcome::Dropped) => {
                tracing::debug!(
                    target: "palaver::message_stream::apply_live",
                    "Dropped duplicate insert {}",
                    message.id
                );
            }
            Some(AppendOutcome::Buffered) | Some(AppendOutcome::Ignored) | None => {}
        }
    }
}

/// Next event of the feed, or never when there is no feed.
async fn next_event(feed: &mut Option<Subscription>) -> Option<SubscriptionEvent> {
    match feed {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}
