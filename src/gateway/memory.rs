//! In-process gateway.
//!
//! Keeps users, conversations, messages and blobs in memory and delivers inserts
//! through per-conversation broadcast feeds. Besides backing tests it carries a few
//! hooks for provoking the failure modes of a hosted backend: failing an operation,
//! slowing down message fetches, re-delivering records and dropping live feeds.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::{
    ConversationId, Gateway, GatewayError, MessageId, Session, Subscription, SubscriptionEvent,
    User,
};
use crate::palaver::DEFAULT_STORAGE_BUCKET;
use crate::palaver::conversations::{Conversation, ConversationRecord};
use crate::palaver::messages::{Message, MessagePreview, NewMessage};

const FEED_BUFFER_SIZE: usize = 100;
const SESSION_LIFETIME_SECS: i64 = 3600;

/// Gateway operations, for failure injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    SignIn,
    CurrentUser,
    ListConversations,
    GetConversation,
    ListMessages,
    InsertMessage,
    SubscribeInserts,
    UploadBlob,
}

#[derive(Debug, Clone)]
enum FeedEvent {
    Insert(Message),
    Dropped(String),
}

/// Per-conversation broadcast channels, created on first subscribe and removed
/// once nobody listens any more.
struct FeedManager {
    feeds: DashMap<ConversationId, broadcast::Sender<FeedEvent>>,
}

impl FeedManager {
    fn new() -> Self {
        Self {
            feeds: DashMap::new(),
        }
    }

    fn subscribe(&self, conversation_id: &ConversationId) -> broadcast::Receiver<FeedEvent> {
        self.feeds
            .entry(conversation_id.clone())
            .or_insert_with(|| broadcast::channel(FEED_BUFFER_SIZE).0)
            .subscribe()
    }

    fn emit(&self, conversation_id: &ConversationId, event: FeedEvent) {
        if let Some(sender) = self.feeds.get(conversation_id) {
            if sender.send(event).is_err() && sender.receiver_count() == 0 {
                drop(sender);
                self.feeds.remove(conversation_id);
            }
        }
    }

    /// Ends every feed of a conversation. Later subscribers get a fresh channel.
    fn drop_all(&self, conversation_id: &ConversationId, reason: &str) {
        if let Some((_, sender)) = self.feeds.remove(conversation_id) {
            let _ = sender.send(FeedEvent::Dropped(reason.to_string()));
        }
    }

    fn listener_count(&self, conversation_id: &ConversationId) -> usize {
        self.feeds
            .get(conversation_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

struct Account {
    user: User,
    password: String,
}

#[derive(Default)]
struct Store {
    /// Keyed by login (the email, or any other handle for users without one)
    accounts: HashMap<String, Account>,
    /// Access token to login
    sessions: HashMap<String, String>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    blobs: HashMap<String, (Vec<u8>, String)>,
    failing: HashSet<GatewayOp>,
    calls: HashMap<GatewayOp, usize>,
    list_delays: HashMap<ConversationId, Duration>,
}

pub struct MemoryGateway {
    store: RwLock<Store>,
    feeds: FeedManager,
    storage_bucket: String,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(Store::default()),
            feeds: FeedManager::new(),
            storage_bucket: DEFAULT_STORAGE_BUCKET.to_string(),
        }
    }

    // A panicking test thread must not wedge every other caller
    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a user who signs in with `email`.
    pub fn add_user(&self, email: &str, password: &str) -> User {
        self.insert_account(email, Some(email.to_string()), password)
    }

    /// Registers a user whose account has no email, e.g. a phone login.
    pub fn add_user_without_email(&self, login: &str, password: &str) -> User {
        self.insert_account(login, None, password)
    }

    fn insert_account(&self, login: &str, email: Option<String>, password: &str) -> User {
        let user = User {
            id: Uuid::new_v4().to_string(),
            email,
        };
        self.write().accounts.insert(
            login.to_string(),
            Account {
                user: user.clone(),
                password: password.to_string(),
            },
        );
        user
    }

    /// Invalidates every session handed out so far.
    pub fn revoke_sessions(&self) {
        self.write().sessions.clear();
    }

    pub fn add_conversation(&self, name: &str, avatar_url: Option<&str>) -> ConversationId {
        let id = ConversationId::new(Uuid::new_v4().to_string());
        self.write().conversations.push(Conversation {
            id: id.clone(),
            name: name.to_string(),
            avatar_url: avatar_url.map(str::to_string),
        });
        id
    }

    /// Stores a message as if another client had inserted it, and delivers it to
    /// the conversation's live feeds.
    pub fn add_message(
        &self,
        conversation_id: &ConversationId,
        sender: &str,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Message {
        let message = NewMessage {
            conversation_id: conversation_id.clone(),
            sender: sender.to_string(),
            content: content.to_string(),
            created_at,
        }
        .into_message(MessageId::new(Uuid::new_v4().to_string()));

        self.write().messages.push(message.clone());
        self.feeds
            .emit(conversation_id, FeedEvent::Insert(message.clone()));
        message
    }

    /// Stored messages of a conversation, in insertion order.
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.read()
            .messages
            .iter()
            .filter(|message| &message.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Uploaded bytes and content type at `path`.
    pub fn blob(&self, path: &str) -> Option<(Vec<u8>, String)> {
        self.read().blobs.get(path).cloned()
    }

    /// Makes `op` fail with [`GatewayError::Unavailable`] until restored.
    pub fn fail(&self, op: GatewayOp) {
        self.write().failing.insert(op);
    }

    pub fn restore(&self, op: GatewayOp) {
        self.write().failing.remove(&op);
    }

    /// How often `op` was called, including failed calls.
    pub fn call_count(&self, op: GatewayOp) -> usize {
        self.read().calls.get(&op).copied().unwrap_or(0)
    }

    /// Holds back `list_messages` responses for a conversation. The response still
    /// reflects the messages stored when the call was made.
    pub fn delay_list_messages(&self, conversation_id: &ConversationId, delay: Duration) {
        self.write()
            .list_delays
            .insert(conversation_id.clone(), delay);
    }

    /// Delivers `message` on the conversation's live feeds without storing it.
    pub fn redeliver(&self, conversation_id: &ConversationId, message: Message) {
        self.feeds.emit(conversation_id, FeedEvent::Insert(message));
    }

    /// Ends every live feed of a conversation; subscribers see an error event.
    pub fn drop_feeds(&self, conversation_id: &ConversationId) {
        tracing::debug!(
            target: "palaver::gateway::memory::drop_feeds",
            "Dropping live feeds for conversation {}",
            conversation_id
        );
        self.feeds.drop_all(conversation_id, "connection dropped");
    }

    /// Number of open live feeds for a conversation.
    pub fn live_feed_count(&self, conversation_id: &ConversationId) -> usize {
        self.feeds.listener_count(conversation_id)
    }

    fn enter(&self, op: GatewayOp) -> Result<(), GatewayError> {
        let mut store = self.write();
        *store.calls.entry(op).or_insert(0) += 1;
        if store.failing.contains(&op) {
            return Err(GatewayError::Unavailable(format!("{:?} is failing", op)));
        }
        Ok(())
    }

    fn authorize(&self, session: &Session) -> Result<(), GatewayError> {
        if self.read().sessions.contains_key(&session.access_token) {
            Ok(())
        } else {
            Err(GatewayError::Auth("Invalid session".to_string()))
        }
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.read();
        f.debug_struct("MemoryGateway")
            .field("accounts", &store.accounts.len())
            .field("conversations", &store.conversations.len())
            .field("messages", &store.messages.len())
            .field("blobs", &store.blobs.len())
            .finish()
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, GatewayError> {
        self.enter(GatewayOp::SignIn)?;

        let mut store = self.write();
        let user = match store.accounts.get(email) {
            Some(account) if account.password == password => account.user.clone(),
            _ => return Err(GatewayError::Auth("Invalid login credentials".to_string())),
        };

        let access_token = Uuid::new_v4().to_string();
        store
            .sessions
            .insert(access_token.clone(), email.to_string());

        Ok(Session {
            access_token,
            refresh_token: Some(Uuid::new_v4().to_string()),
            expires_at: Some(Utc::now() + chrono::Duration::seconds(SESSION_LIFETIME_SECS)),
            user,
        })
    }

    async fn current_user(&self, session: &Session) -> Result<Option<User>, GatewayError> {
        self.enter(GatewayOp::CurrentUser)?;

        let store = self.read();
        Ok(store
            .sessions
            .get(&session.access_token)
            .and_then(|login| store.accounts.get(login))
            .map(|account| account.user.clone()))
    }

    async fn list_conversations(
        &self,
        session: &Session,
    ) -> Result<Vec<ConversationRecord>, GatewayError> {
        self.enter(GatewayOp::ListConversations)?;
        self.authorize(session)?;

        let store = self.read();
        Ok(store
            .conversations
            .iter()
            .map(|conversation| ConversationRecord {
                conversation: conversation.clone(),
                messages: store
                    .messages
                    .iter()
                    .filter(|message| message.conversation_id == conversation.id)
                    .map(MessagePreview::from)
                    .collect(),
            })
            .collect())
    }

    async fn get_conversation(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> Result<Conversation, GatewayError> {
        self.enter(GatewayOp::GetConversation)?;
        self.authorize(session)?;

        self.read()
            .conversations
            .iter()
            .find(|conversation| &conversation.id == conversation_id)
            .cloned()
            .ok_or(GatewayError::NotFound)
    }

    async fn list_messages(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, GatewayError> {
        self.enter(GatewayOp::ListMessages)?;
        self.authorize(session)?;

        let (mut messages, delay) = {
            let store = self.read();
            let messages: Vec<Message> = store
                .messages
                .iter()
                .filter(|message| &message.conversation_id == conversation_id)
                .cloned()
                .collect();
            (messages, store.list_delays.get(conversation_id).copied())
        };
        // Stable, so equal timestamps keep insertion order
        messages.sort_by_key(|message| message.created_at);

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(messages)
    }

    async fn insert_message(
        &self,
        session: &Session,
        message: &NewMessage,
    ) -> Result<(), GatewayError> {
        self.enter(GatewayOp::InsertMessage)?;
        self.authorize(session)?;

        let stored = {
            let mut store = self.write();
            if !store
                .conversations
                .iter()
                .any(|conversation| conversation.id == message.conversation_id)
            {
                return Err(GatewayError::NotFound);
            }
            let stored = message
                .clone()
                .into_message(MessageId::new(Uuid::new_v4().to_string()));
            store.messages.push(stored.clone());
            stored
        };

        self.feeds
            .emit(&stored.conversation_id, FeedEvent::Insert(stored.clone()));
        Ok(())
    }

    async fn subscribe_inserts(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> Result<Subscription, GatewayError> {
        self.enter(GatewayOp::SubscribeInserts)?;
        self.authorize(session)?;

        let mut feed = self.feeds.subscribe(conversation_id);
        let (event_tx, event_rx) = mpsc::channel(FEED_BUFFER_SIZE);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Fires on close and when the subscription is dropped
                    _ = &mut close_rx => break,
                    received = feed.recv() => {
                        let event = match received {
                            Ok(FeedEvent::Insert(message)) => SubscriptionEvent::Insert(message),
                            Ok(FeedEvent::Dropped(reason)) => SubscriptionEvent::Error(reason),
                            Err(RecvError::Lagged(skipped)) => SubscriptionEvent::Error(
                                format!("feed lagged, {} events skipped", skipped),
                            ),
                            Err(RecvError::Closed) => {
                                SubscriptionEvent::Error("feed closed".to_string())
                            }
                        };
                        let terminal = matches!(event, SubscriptionEvent::Error(_));
                        if event_tx.send(event).await.is_err() || terminal {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(conversation_id.clone(), event_rx, close_tx))
    }

    async fn upload_blob(
        &self,
        session: &Session,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), GatewayError> {
        self.enter(GatewayOp::UploadBlob)?;
        self.authorize(session)?;

        let mut store = self.write();
        if store.blobs.contains_key(path) {
            return Err(GatewayError::Http {
                status: 409,
                message: "The resource already exists".to_string(),
            });
        }
        store
            .blobs
            .insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("memory://{}/{}", self.storage_bucket, path)
    }
}
