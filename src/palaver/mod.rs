use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub mod chat_list;
pub mod composer;
pub mod conversations;
pub mod error;
pub mod message_stream;
pub mod messages;
pub mod rendering;
pub mod retry;
pub mod session;

use crate::gateway::{Gateway, supabase::SupabaseGateway};
use crate::init_tracing;
use error::{PalaverError, Result};
use message_stream::StreamConfig;

/// Bucket uploads go to unless configured otherwise.
pub const DEFAULT_STORAGE_BUCKET: &str = "attachments";

/// Connection settings for the hosted backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Project base URL, e.g. `https://xyzcompany.supabase.co`
    pub url: String,

    /// Public (anon) API key sent with every request
    pub anon_key: String,

    /// Storage bucket for uploaded attachments
    pub storage_bucket: String,

    /// Interval between realtime heartbeats
    pub heartbeat_interval: Duration,
}

impl GatewayConfig {
    pub fn new(url: &str, anon_key: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            storage_bucket: DEFAULT_STORAGE_BUCKET.to_string(),
            heartbeat_interval: Duration::from_secs(25),
        }
    }

    /// Reads `SUPABASE_URL`, `SUPABASE_ANON_KEY` and the optional
    /// `PALAVER_STORAGE_BUCKET`, after loading a `.env` file if one exists.
    pub fn from_env() -> Result<Self> {
        // A missing .env file is fine; the variables may come from the environment
        let _ = dotenvy::dotenv();

        let url = std::env::var("SUPABASE_URL")
            .map_err(|_| PalaverError::Configuration("SUPABASE_URL is not set".to_string()))?;
        let anon_key = std::env::var("SUPABASE_ANON_KEY").map_err(|_| {
            PalaverError::Configuration("SUPABASE_ANON_KEY is not set".to_string())
        })?;

        let mut config = Self::new(&url, &anon_key);
        if let Ok(bucket) = std::env::var("PALAVER_STORAGE_BUCKET")
            && !bucket.trim().is_empty()
        {
            config.storage_bucket = bucket.trim().to_string();
        }
        Ok(config)
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("url", &self.url)
            .field("anon_key", &"<REDACTED>")
            .field("storage_bucket", &self.storage_bucket)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct PalaverConfig {
    /// Directory for application logs
    pub logs_dir: PathBuf,

    pub gateway: GatewayConfig,

    /// Configuration for the message stream reconciler
    pub stream: StreamConfig,
}

impl PalaverConfig {
    pub fn new(logs_dir: &Path, gateway: GatewayConfig) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };

        Self {
            logs_dir: logs_dir.join(env_suffix),
            gateway,
            stream: StreamConfig::default(),
        }
    }

    /// Create a new configuration with custom message stream settings
    pub fn new_with_stream_config(
        logs_dir: &Path,
        gateway: GatewayConfig,
        stream: StreamConfig,
    ) -> Self {
        Self {
            stream,
            ..Self::new(logs_dir, gateway)
        }
    }
}

/// The chat client: login, conversation list, thread stream, and composer, all
/// backed by one [`Gateway`].
pub struct Palaver {
    pub config: PalaverConfig,
    gateway: Arc<dyn Gateway>,
}

impl std::fmt::Debug for Palaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Palaver")
            .field("config", &self.config)
            .field("gateway", &"<REDACTED>")
            .finish()
    }
}

impl Palaver {
    /// Initializes the client against the hosted backend described by `config.gateway`.
    ///
    /// Creates the logs directory and sets up logging on first use.
    pub fn initialize(config: PalaverConfig) -> Result<Self> {
        let gateway = SupabaseGateway::new(config.gateway.clone())?;
        Self::with_gateway(config, Arc::new(gateway))
    }

    /// Initializes the client with an explicit gateway implementation.
    pub fn with_gateway(config: PalaverConfig, gateway: Arc<dyn Gateway>) -> Result<Self> {
        let logs_dir = &config.logs_dir;

        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))
            .map_err(PalaverError::from)?;

        // Only initialize tracing once
        init_tracing(logs_dir);

        tracing::debug!(target: "palaver::initialize", "Logging initialized in directory: {:?}", logs_dir);

        Ok(Self { config, gateway })
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }
}
