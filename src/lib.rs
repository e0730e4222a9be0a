pub use crate::gateway::{
    ConversationId, Gateway, GatewayError, MessageId, Session, Subscription, SubscriptionEvent,
    User, memory::MemoryGateway, supabase::SupabaseGateway,
};
pub use crate::palaver::chat_list::{
    ChatListItem, NO_CONVERSATIONS_PLACEHOLDER, NO_MESSAGES_PLACEHOLDER,
};
pub use crate::palaver::composer::{Draft, SendOutcome};
pub use crate::palaver::conversations::{Conversation, ConversationHeader, ConversationRecord};
pub use crate::palaver::error::{PalaverError, Result};
pub use crate::palaver::message_stream::{
    AppendOrdering, AppendOutcome, MessageReconciler, MessageStream, ScopeToken, StreamConfig,
    StreamState, StreamUpdate,
};
pub use crate::palaver::messages::{Message, MessagePreview, NewMessage};
pub use crate::palaver::rendering::{
    ContentKind, MessageView, SenderIcon, format_timestamp, format_timestamp_now,
};
pub use crate::palaver::retry::{RetryError, RetryPolicy};
pub use crate::palaver::{GatewayConfig, Palaver, PalaverConfig};

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

use std::sync::Mutex;

pub mod gateway;
mod palaver;

static TRACING_GUARDS: OnceCell<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceCell::new();
static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the global tracing subscriber: stdout plus a daily rolling file in `logs_dir`.
///
/// Only the first call has any effect, so tests and the binary can both call it freely.
pub fn init_tracing(logs_dir: &std::path::Path) {
    TRACING_INIT.get_or_init(|| {
        let file_appender = match tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("palaver")
            .filename_suffix("log")
            .build(logs_dir)
        {
            Ok(appender) => appender,
            Err(e) => {
                eprintln!("Failed to create log file appender in {:?}: {}", logs_dir, e);
                return;
            }
        };

        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        TRACING_GUARDS
            .set(Mutex::new(Some((file_guard, stdout_guard))))
            .ok();

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = Layer::new()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true);

        // try_init: a host application may already own the global subscriber
        let _ = Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .try_init();
    });
}
