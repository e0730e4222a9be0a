use chrono::Utc;

use crate::gateway::{GatewayError, Session, User};
use crate::palaver::{
    Palaver,
    error::{PalaverError, Result},
};

impl Palaver {
    /// Signs in with an email and password.
    ///
    /// Blank credentials are rejected without contacting the gateway. Bad credentials
    /// come back as [`PalaverError::Authentication`] carrying the gateway's reason,
    /// suitable for showing inline on the login form.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Err(PalaverError::Authentication(
                "Email and password are required".to_string(),
            ));
        }

        match self.gateway.sign_in(email, password).await {
            Ok(session) => {
                tracing::info!(
                    target: "palaver::session::sign_in",
                    "Signed in as {}",
                    session.email().unwrap_or(&session.user.id)
                );
                Ok(session)
            }
            Err(GatewayError::Auth(reason)) => {
                tracing::debug!(
                    target: "palaver::session::sign_in",
                    "Sign in rejected: {}",
                    reason
                );
                Err(PalaverError::Authentication(reason))
            }
            Err(e) => {
                tracing::warn!(
                    target: "palaver::session::sign_in",
                    "Sign in failed: {}",
                    e
                );
                Err(PalaverError::Gateway(e))
            }
        }
    }

    /// The user behind `session`, or `None` when the gateway no longer accepts it.
    pub async fn current_user(&self, session: &Session) -> Result<Option<User>> {
        Ok(self.gateway.current_user(session).await?)
    }

    /// Resolves the sender identity for an outgoing message.
    pub(crate) async fn sender_identity(&self, session: &Session) -> Result<String> {
        if session.is_expired_at(Utc::now()) {
            tracing::warn!(
                target: "palaver::session::sender_identity",
                "Session expired, sign in again"
            );
            return Err(PalaverError::MissingIdentity);
        }

        let user = match self.current_user(session).await {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(
                    target: "palaver::session::sender_identity",
                    "Could not resolve the current user: {}",
                    e
                );
                None
            }
        };

        user.and_then(|user| user.email)
            .filter(|email| !email.is_empty())
            .ok_or_else(|| {
                tracing::warn!(
                    target: "palaver::session::sender_identity",
                    "No user or email found"
                );
                PalaverError::MissingIdentity
            })
    }
}
