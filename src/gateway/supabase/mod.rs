//! Gateway backed by a hosted Supabase project.
//!
//! Auth goes through GoTrue, tables through PostgREST, attachments through the
//! storage API, and the per-conversation insert feed through the realtime
//! websocket (see [`realtime`]).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{ConversationId, Gateway, GatewayError, Session, Subscription, User};
use crate::palaver::GatewayConfig;
use crate::palaver::conversations::{Conversation, ConversationRecord};
use crate::palaver::messages::{Message, NewMessage};

mod realtime;

const CONVERSATIONS_TABLE: &str = "chats";
const MESSAGES_TABLE: &str = "messages";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: User,
}

impl TokenResponse {
    fn into_session(self, now: DateTime<Utc>) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .or_else(|| {
                self.expires_in
                    .map(|secs| now + chrono::Duration::seconds(secs))
            });

        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: normalize_user(self.user),
        }
    }
}

/// GoTrue reports a missing email as an empty string.
fn normalize_user(mut user: User) -> User {
    if user.email.as_deref().is_some_and(str::is_empty) {
        user.email = None;
    }
    user
}

/// Picks the human readable part out of a GoTrue, PostgREST or storage error body.
fn error_message(status: StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            ["error_description", "msg", "message", "error"]
                .iter()
                .find_map(|key| value.get(key).and_then(|v| v.as_str()).map(str::to_string))
        });

    match from_json {
        Some(message) => message,
        None if !body.trim().is_empty() => body.trim().to_string(),
        None => status
            .canonical_reason()
            .unwrap_or("Unknown error")
            .to_string(),
    }
}

pub struct SupabaseGateway {
    config: GatewayConfig,
    client: reqwest::Client,
}

impl SupabaseGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
            return Err(GatewayError::Unavailable(format!(
                "Gateway URL must be http(s): {}",
                config.url
            )));
        }

        let client = reqwest::Client::builder().build()?;
        Ok(Self { config, client })
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.url, table)
    }

    fn auth_url(&self, endpoint: &str) -> String {
        format!("{}/auth/v1/{}", self.config.url, endpoint)
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.config.url, self.config.storage_bucket, path
        )
    }

    fn with_keys(&self, request: RequestBuilder, session: &Session) -> RequestBuilder {
        request
            .header("apikey", &self.config.anon_key)
            .bearer_auth(&session.access_token)
    }

    /// Passes successful responses through and turns the rest into [`GatewayError::Http`].
    async fn check(response: Response, operation: &str) -> Result<Response, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = error_message(status, &body);
        tracing::error!(
            target: "palaver::gateway::supabase::check",
            "{} failed with status {}: {}",
            operation,
            status,
            message
        );
        Err(GatewayError::Http {
            status: status.as_u16(),
            message,
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

impl std::fmt::Debug for SupabaseGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseGateway")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl Gateway for SupabaseGateway {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, GatewayError> {
        tracing::debug!(
            target: "palaver::gateway::supabase::sign_in",
            "Requesting password grant from {}",
            self.config.url
        );

        let response = self
            .client
            .post(self.auth_url("token"))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.config.anon_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::UNPROCESSABLE_ENTITY
        ) {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Auth(error_message(status, &body)));
        }

        let response = Self::check(response, "Sign in").await?;
        let token: TokenResponse = Self::decode(response).await?;
        Ok(token.into_session(Utc::now()))
    }

    async fn current_user(&self, session: &Session) -> Result<Option<User>, GatewayError> {
        let response = self
            .with_keys(self.client.get(self.auth_url("user")), session)
            .send()
            .await?;

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Ok(None);
        }

        let response = Self::check(response, "Get user").await?;
        let user: User = Self::decode(response).await?;
        Ok(Some(normalize_user(user)))
    }

    async fn list_conversations(
        &self,
        session: &Session,
    ) -> Result<Vec<ConversationRecord>, GatewayError> {
        let response = self
            .with_keys(self.client.get(self.rest_url(CONVERSATIONS_TABLE)), session)
            .query(&[("select", "id,name,avatar_url,messages(content,created_at)")])
            .send()
            .await?;

        let response = Self::check(response, "List conversations").await?;
        Self::decode(response).await
    }

    async fn get_conversation(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> Result<Conversation, GatewayError> {
        let response = self
            .with_keys(self.client.get(self.rest_url(CONVERSATIONS_TABLE)), session)
            .query(&[
                ("select", "id,name,avatar_url".to_string()),
                ("id", format!("eq.{}", conversation_id)),
            ])
            .send()
            .await?;

        let response = Self::check(response, "Get conversation").await?;
        let rows: Vec<Conversation> = Self::decode(response).await?;
        rows.into_iter().next().ok_or(GatewayError::NotFound)
    }

    async fn list_messages(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, GatewayError> {
        let response = self
            .with_keys(self.client.get(self.rest_url(MESSAGES_TABLE)), session)
            .query(&[
                ("select", "*".to_string()),
                ("chat_id", format!("eq.{}", conversation_id)),
                ("order", "created_at.asc".to_string()),
            ])
            .send()
            .await?;

        let response = Self::check(response, "List messages").await?;
        Self::decode(response).await
    }

    async fn insert_message(
        &self,
        session: &Session,
        message: &NewMessage,
    ) -> Result<(), GatewayError> {
        let response = self
            .with_keys(self.client.post(self.rest_url(MESSAGES_TABLE)), session)
            .header("Prefer", "return=minimal")
            .json(message)
            .send()
            .await?;

        Self::check(response, "Insert message").await?;
        Ok(())
    }

    async fn subscribe_inserts(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> Result<Subscription, GatewayError> {
        realtime::subscribe_inserts(&self.config, session, conversation_id).await
    }

    async fn upload_blob(
        &self,
        session: &Session,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), GatewayError> {
        tracing::info!(
            target: "palaver::gateway::supabase::upload_blob",
            "Uploading {} bytes to {}/{}",
            bytes.len(),
            self.config.storage_bucket,
            path
        );

        let response = self
            .with_keys(self.client.post(self.object_url(path)), session)
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await?;

        Self::check(response, "Upload").await?;
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.config.url, self.config.storage_bucket, path
        )
    }
}
