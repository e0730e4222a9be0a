use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::gateway::{ConversationId, Session};
use crate::palaver::{
    Palaver,
    error::{PalaverError, Result},
    messages::NewMessage,
};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Text typed into the composer but not yet sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    text: String,
}

impl Draft {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    /// Appends to the draft, e.g. a picked emoji.
    pub fn push_str(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }

    /// Whether sending would do anything.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendOutcome {
    /// Written to the gateway. It shows up in the thread once the live feed echoes it.
    Sent(NewMessage),

    /// The draft was blank; nothing was written.
    Skipped,
}

/// Blob path for an upload: the current unix time in milliseconds plus the
/// original file's extension.
pub(crate) fn upload_path(file_name: &str, now_millis: i64) -> String {
    let base_name = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    match base_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            format!("{now_millis}.{}", ext.to_ascii_lowercase())
        }
        _ => now_millis.to_string(),
    }
}

/// Sniffs the MIME type from the file's bytes.
pub(crate) fn detect_content_type(bytes: &[u8]) -> &'static str {
    infer::get(bytes)
        .map(|kind| kind.mime_type())
        .unwrap_or(FALLBACK_CONTENT_TYPE)
}

impl Palaver {
    /// Sends the draft's trimmed text to a conversation.
    ///
    /// A blank draft is a no-op and stays untouched. On success the draft is cleared;
    /// on failure it is kept so the user can re-submit, and the error is logged.
    /// The message is not inserted locally: it reaches the thread through the live feed.
    pub async fn send_text(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
        draft: &mut Draft,
    ) -> Result<SendOutcome> {
        if draft.is_blank() {
            return Ok(SendOutcome::Skipped);
        }

        let sender = self.sender_identity(session).await?;
        let message = NewMessage::new(
            conversation_id.clone(),
            sender,
            draft.text().trim().to_string(),
        );

        if let Err(e) = self.gateway.insert_message(session, &message).await {
            tracing::error!(
                target: "palaver::composer::send_text",
                "Failed to send message: {}",
                e
            );
            return Err(PalaverError::Write(e.to_string()));
        }

        draft.clear();
        Ok(SendOutcome::Sent(message))
    }

    /// Uploads a file and sends its public URL as a message.
    ///
    /// If the upload fails, no message is written.
    pub async fn send_file(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<NewMessage> {
        let sender = self.sender_identity(session).await?;

        let path = upload_path(file_name, Utc::now().timestamp_millis());
        let content_type = detect_content_type(&bytes);

        tracing::debug!(
            target: "palaver::composer::send_file",
            "Uploading {} ({} bytes, {}) as {}",
            file_name,
            bytes.len(),
            content_type,
            path
        );

        if let Err(e) = self
            .gateway
            .upload_blob(session, &path, bytes, content_type)
            .await
        {
            tracing::error!(
                target: "palaver::composer::send_file",
                "Upload error: {}",
                e
            );
            return Err(PalaverError::Write(e.to_string()));
        }

        let public_url = self.gateway.public_url(&path);
        let message = NewMessage::new(conversation_id.clone(), sender, public_url);

        if let Err(e) = self.gateway.insert_message(session, &message).await {
            tracing::error!(
                target: "palaver::composer::send_file",
                "Insert message error: {}",
                e
            );
            return Err(PalaverError::Write(e.to_string()));
        }

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::GatewayOp;
    use crate::palaver::test_utils::*;

    // Smallest valid PNG header is enough for sniffing
    const PNG_BYTES: [u8; 16] = [
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
        0x52,
    ];

    #[test]
    fn test_upload_path_keeps_extension() {
        assert_eq!(upload_path("holiday.JPG", 1717232400000), "1717232400000.jpg");
        assert_eq!(upload_path("clip.final.mp4", 5), "5.mp4");
        assert_eq!(upload_path("/tmp/photos/cat.png", 7), "7.png");
    }

    #[test]
    fn test_upload_path_without_extension() {
        assert_eq!(upload_path("README", 42), "42");
        assert_eq!(upload_path(".bashrc", 42), "42");
        assert_eq!(upload_path("trailing.", 42), "42");
    }

    #[test]
    fn test_detect_content_type() {
        assert_eq!(detect_content_type(&PNG_BYTES), "image/png");
        assert_eq!(detect_content_type(b"plain words"), FALLBACK_CONTENT_TYPE);
    }

    #[test]
    fn test_draft_blank_detection() {
        let mut draft = Draft::new("  \n\t ");
        assert!(draft.is_blank());
        draft.push_str("🙂");
        assert!(!draft.is_blank());
        draft.clear();
        assert_eq!(draft.text(), "");
    }

    #[tokio::test]
    async fn test_send_text_writes_trimmed_message_and_clears_draft() {
        let (palaver, gateway, _logs_temp) = create_mock_palaver();
        let session = sign_in_test_user(&palaver).await;
        let conversation_id = create_test_conversation(&gateway, "general");

        let mut draft = Draft::new("  hello there  ");
        let outcome = palaver
            .send_text(&session, &conversation_id, &mut draft)
            .await
            .unwrap();

        let SendOutcome::Sent(sent) = outcome else {
            panic!("expected the message to be sent");
        };
        assert_eq!(sent.content, "hello there");
        assert_eq!(sent.sender, TEST_EMAIL);
        assert_eq!(draft.text(), "");

        let stored = gateway.messages(&conversation_id);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "hello there");
    }

    #[tokio::test]
    async fn test_send_blank_text_is_noop() {
        let (palaver, gateway, _logs_temp) = create_mock_palaver();
        let session = sign_in_test_user(&palaver).await;
        let conversation_id = create_test_conversation(&gateway, "general");

        for input in ["", "   ", "\n\t  "] {
            let mut draft = Draft::new(input);
            let outcome = palaver
                .send_text(&session, &conversation_id, &mut draft)
                .await
                .unwrap();
            assert_eq!(outcome, SendOutcome::Skipped);
            assert_eq!(draft.text(), input);
        }

        assert_eq!(gateway.call_count(GatewayOp::InsertMessage), 0);
        assert_eq!(gateway.call_count(GatewayOp::CurrentUser), 0);
        assert!(gateway.messages(&conversation_id).is_empty());
    }

    #[tokio::test]
    async fn test_send_text_failure_preserves_draft() {
        let (palaver, gateway, _logs_temp) = create_mock_palaver();
        let session = sign_in_test_user(&palaver).await;
        let conversation_id = create_test_conversation(&gateway, "general");
        gateway.fail(GatewayOp::InsertMessage);

        let mut draft = Draft::new("important");
        let result = palaver
            .send_text(&session, &conversation_id, &mut draft)
            .await;

        assert!(matches!(result, Err(PalaverError::Write(_))));
        assert_eq!(draft.text(), "important");

        // Re-submitting once the gateway recovers goes through
        gateway.restore(GatewayOp::InsertMessage);
        palaver
            .send_text(&session, &conversation_id, &mut draft)
            .await
            .unwrap();
        assert_eq!(draft.text(), "");
        assert_eq!(gateway.messages(&conversation_id).len(), 1);
    }

    #[tokio::test]
    async fn test_send_text_without_identity_writes_nothing() {
        let (palaver, gateway, _logs_temp) = create_mock_palaver();
        let session = sign_in_test_user(&palaver).await;
        let conversation_id = create_test_conversation(&gateway, "general");
        gateway.revoke_sessions();

        let mut draft = Draft::new("hello");
        let result = palaver
            .send_text(&session, &conversation_id, &mut draft)
            .await;

        assert!(matches!(result, Err(PalaverError::MissingIdentity)));
        assert_eq!(draft.text(), "hello");
        assert_eq!(gateway.call_count(GatewayOp::InsertMessage), 0);
    }

    #[tokio::test]
    async fn test_send_text_for_user_without_email() {
        let (palaver, gateway, _logs_temp) = create_mock_palaver();
        gateway.add_user_without_email("+15550100", "pin");
        let session = palaver.sign_in("+15550100", "pin").await.unwrap();
        let conversation_id = create_test_conversation(&gateway, "general");

        let mut draft = Draft::new("hello");
        let result = palaver
            .send_text(&session, &conversation_id, &mut draft)
            .await;

        assert!(matches!(result, Err(PalaverError::MissingIdentity)));
        assert_eq!(gateway.call_count(GatewayOp::InsertMessage), 0);
    }

    #[tokio::test]
    async fn test_send_file_uploads_then_sends_public_url() {
        let (palaver, gateway, _logs_temp) = create_mock_palaver();
        let session = sign_in_test_user(&palaver).await;
        let conversation_id = create_test_conversation(&gateway, "general");

        let sent = palaver
            .send_file(&session, &conversation_id, "cat.png", PNG_BYTES.to_vec())
            .await
            .unwrap();

        assert!(sent.content.starts_with("memory://attachments/"));
        assert!(sent.content.ends_with(".png"));

        let path = sent.content.trim_start_matches("memory://attachments/");
        let (bytes, content_type) = gateway.blob(path).unwrap();
        assert_eq!(bytes, PNG_BYTES.to_vec());
        assert_eq!(content_type, "image/png");

        let stored = gateway.messages(&conversation_id);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, sent.content);
    }

    #[tokio::test]
    async fn test_failed_upload_writes_no_message() {
        let (palaver, gateway, _logs_temp) = create_mock_palaver();
        let session = sign_in_test_user(&palaver).await;
        let conversation_id = create_test_conversation(&gateway, "general");
        gateway.fail(GatewayOp::UploadBlob);

        let result = palaver
            .send_file(&session, &conversation_id, "cat.png", PNG_BYTES.to_vec())
            .await;

        assert!(matches!(result, Err(PalaverError::Write(_))));
        assert_eq!(gateway.call_count(GatewayOp::InsertMessage), 0);
        assert!(gateway.messages(&conversation_id).is_empty());
    }
}
