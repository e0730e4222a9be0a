//! Display rules shared by the conversation list and the thread view.

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::palaver::messages::Message;

const IMAGE_SUFFIXES: [&str; 5] = [".png", ".jpg", ".jpeg", ".gif", ".webp"];
const VIDEO_SUFFIXES: [&str; 2] = [".mp4", ".webm"];

/// Formats a message time relative to `now`.
///
/// Same calendar day as `now` (in `now`'s time zone) renders `HH:MM`, anything else
/// renders the date as `YYYY-MM-DD`. Both the conversation list and the thread use
/// this, so the two never disagree.
pub fn format_timestamp<Tz>(created_at: DateTime<Utc>, now: DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let local = created_at.with_timezone(&now.timezone());
    if local.date_naive() == now.date_naive() {
        local.format("%H:%M").to_string()
    } else {
        local.format("%Y-%m-%d").to_string()
    }
}

/// [`format_timestamp`] against the system clock and time zone.
pub fn format_timestamp_now(created_at: DateTime<Utc>) -> String {
    format_timestamp(created_at, Local::now())
}

/// How message content is presented, inferred from the content string alone.
///
/// There is no stored content type: uploads are sent as their public URL, so a URL
/// with a media suffix is the only signal available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentKind {
    Image,
    Video,
    Text,
}

impl ContentKind {
    pub fn classify(content: &str) -> Self {
        let lowered = content.trim_end().to_ascii_lowercase();
        if IMAGE_SUFFIXES.iter().any(|s| lowered.ends_with(s)) {
            ContentKind::Image
        } else if VIDEO_SUFFIXES.iter().any(|s| lowered.ends_with(s)) {
            ContentKind::Video
        } else {
            ContentKind::Text
        }
    }
}

/// Fallback avatar for senders without a picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderIcon {
    User,
    Ninja,
    Secret,
    Astronaut,
    Robot,
    Tie,
}

impl SenderIcon {
    const ALL: [SenderIcon; 6] = [
        SenderIcon::User,
        SenderIcon::Ninja,
        SenderIcon::Secret,
        SenderIcon::Astronaut,
        SenderIcon::Robot,
        SenderIcon::Tie,
    ];

    /// Sum of the sender's UTF-16 code units, modulo the number of icons.
    pub fn for_sender(sender: &str) -> Self {
        let hash = sender
            .encode_utf16()
            .fold(0u64, |acc, unit| acc.wrapping_add(u64::from(unit)));
        Self::ALL[(hash % Self::ALL.len() as u64) as usize]
    }

    pub fn label(&self) -> &'static str {
        match self {
            SenderIcon::User => "user",
            SenderIcon::Ninja => "ninja",
            SenderIcon::Secret => "secret",
            SenderIcon::Astronaut => "astronaut",
            SenderIcon::Robot => "robot",
            SenderIcon::Tie => "tie",
        }
    }
}

/// A message prepared for the thread view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub sender: String,
    pub content: String,
    pub kind: ContentKind,
    pub time: String,

    /// Whether the signed-in user wrote it. Own messages show no avatar.
    pub is_mine: bool,

    pub sender_avatar_url: Option<String>,
    pub icon: SenderIcon,
}

impl MessageView {
    pub fn render<Tz>(message: &Message, me: Option<&str>, now: DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        Self {
            sender: message.sender.clone(),
            content: message.content.clone(),
            kind: ContentKind::classify(&message.content),
            time: format_timestamp(message.created_at, now),
            is_mine: me.is_some_and(|me| me == message.sender),
            sender_avatar_url: message
                .sender_avatar_url
                .clone()
                .filter(|url| !url.is_empty()),
            icon: SenderIcon::for_sender(&message.sender),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ConversationId, MessageId};
    use chrono::FixedOffset;

    fn utc(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_same_day_renders_time_only() {
        let now = utc("2024-06-01T15:00:00Z");
        assert_eq!(format_timestamp(utc("2024-06-01T09:30:00Z"), now), "09:30");
    }

    #[test]
    fn test_prior_day_renders_date() {
        let now = utc("2024-06-01T15:00:00Z");
        assert_eq!(
            format_timestamp(utc("2024-05-30T09:30:00Z"), now),
            "2024-05-30"
        );
    }

    #[test]
    fn test_calendar_day_follows_viewer_time_zone() {
        // 23:30 UTC on May 31st is already June 1st in UTC+2
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = utc("2024-06-01T10:00:00Z").with_timezone(&tz);
        assert_eq!(format_timestamp(utc("2024-05-31T23:30:00Z"), now), "01:30");

        let now_utc = utc("2024-06-01T10:00:00Z");
        assert_eq!(
            format_timestamp(utc("2024-05-31T23:30:00Z"), now_utc),
            "2024-05-31"
        );
    }

    #[test]
    fn test_classify_content() {
        assert_eq!(ContentKind::classify("https://x/a.png"), ContentKind::Image);
        assert_eq!(ContentKind::classify("https://x/a.mp4"), ContentKind::Video);
        assert_eq!(ContentKind::classify("hello"), ContentKind::Text);
    }

    #[test]
    fn test_classify_all_suffixes_case_insensitive() {
        for url in ["a.jpg", "a.JPEG", "a.gif", "a.webp", "a.Png"] {
            assert_eq!(ContentKind::classify(url), ContentKind::Image, "{url}");
        }
        for url in ["a.webm", "a.MP4"] {
            assert_eq!(ContentKind::classify(url), ContentKind::Video, "{url}");
        }
        assert_eq!(ContentKind::classify("look at a.png now"), ContentKind::Text);
        assert_eq!(ContentKind::classify("report.pdf"), ContentKind::Text);
    }

    #[test]
    fn test_sender_icon_is_deterministic() {
        // 'a' (97) + 'b' (98) = 195, 195 % 6 = 3
        assert_eq!(SenderIcon::for_sender("ab"), SenderIcon::Astronaut);
        assert_eq!(SenderIcon::for_sender(""), SenderIcon::User);
        assert_eq!(
            SenderIcon::for_sender("ada@example.com"),
            SenderIcon::for_sender("ada@example.com")
        );
    }

    #[test]
    fn test_sender_icon_sums_utf16_units() {
        // U+1F600 is the surrogate pair 0xD83D 0xDE00: 55357 + 56832 = 112189, % 6 = 1
        assert_eq!(SenderIcon::for_sender("😀"), SenderIcon::Ninja);
        // 'é' is a single unit (233), % 6 = 5
        assert_eq!(SenderIcon::for_sender("é"), SenderIcon::Tie);
    }

    #[test]
    fn test_render_message_view() {
        let message = Message {
            id: MessageId::new("m1"),
            conversation_id: ConversationId::new("c1"),
            sender: "ada@example.com".to_string(),
            content: "https://x/attachments/1.gif".to_string(),
            created_at: utc("2024-06-01T09:30:00Z"),
            sender_avatar_url: Some(String::new()),
        };
        let now = utc("2024-06-01T15:00:00Z");

        let mine = MessageView::render(&message, Some("ada@example.com"), now);
        assert!(mine.is_mine);
        assert_eq!(mine.kind, ContentKind::Image);
        assert_eq!(mine.time, "09:30");
        assert_eq!(mine.sender_avatar_url, None);

        let theirs = MessageView::render(&message, Some("bob@example.com"), now);
        assert!(!theirs.is_mine);
        assert_eq!(theirs.icon, SenderIcon::for_sender("ada@example.com"));

        let signed_out = MessageView::render(&message, None, now);
        assert!(!signed_out.is_mine);
    }
}
