use crate::error::{IngestError, Result};
use crate::extraction::LanguagePreference;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the ingestion service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Egress proxy pool
    pub proxy: ProxyConfig,

    /// Upstream platform access
    pub youtube: YouTubeConfig,

    /// Extraction method settings
    pub extraction: ExtractionConfig,

    /// Defaults for channel imports
    pub import: ImportSettings,

    /// Where imported records go
    pub storage: StorageConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Rotating proxy host
    pub host: Option<String>,

    /// Rotating proxy port
    pub port: u16,

    /// Base username; identity N authenticates as `<username>-N`
    pub username: Option<String>,

    /// Shared password for all identities
    pub password: Option<String>,

    /// Number of identities in the rotation
    pub pool_size: usize,

    /// Seconds after which the pool rotates without a failure
    pub rotation_interval_secs: u64,

    /// Single `host:port` proxy used when no rotating proxy is configured
    pub legacy_proxy: Option<String>,
}

impl ProxyConfig {
    pub fn is_rotating(&self) -> bool {
        self.host.is_some() && self.username.is_some() && self.password.is_some()
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 80,
            username: None,
            password: None,
            pool_size: 9,
            rotation_interval_secs: 60,
            legacy_proxy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YouTubeConfig {
    /// Data API key used for discovery and duration lookups
    pub api_key: Option<String>,

    /// Data API base URL
    pub api_base_url: String,

    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,

    /// Path to the yt-dlp binary
    pub ytdlp_path: PathBuf,

    /// Discovery strategies in the order they are tried
    pub discovery_strategies: Vec<DiscoveryStrategy>,
}

impl Default for YouTubeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base_url: "https://www.googleapis.com/youtube/v3".to_string(),
            request_timeout_secs: 30,
            ytdlp_path: PathBuf::from("yt-dlp"),
            discovery_strategies: vec![
                DiscoveryStrategy::UploadsPlaylist,
                DiscoveryStrategy::Activities,
                DiscoveryStrategy::Search,
            ],
        }
    }
}

/// Ways of listing a channel's recent items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    UploadsPlaylist,
    Activities,
    Search,
}

/// Transcript acquisition methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptMethodKind {
    WatchPage,
    YtDlp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Transcript methods in fallback order
    pub transcript_methods: Vec<TranscriptMethodKind>,

    /// Pause between attempts of one method, after rotating
    pub retry_backoff_ms: u64,
}

impl ExtractionConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            transcript_methods: vec![TranscriptMethodKind::WatchPage, TranscriptMethodKind::YtDlp],
            retry_backoff_ms: 500,
        }
    }
}

/// Settings snapshot for one import run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportSettings {
    /// Number of new items wanted
    pub max_items: usize,

    /// Only items published within this many days are discovered
    pub lookback_days: u32,

    /// Keep items at or below the shorts threshold
    pub include_shorts: bool,

    /// Items at or below this many seconds count as shorts
    pub shorts_threshold_secs: u64,

    /// Drop items already present in storage
    pub skip_existing: bool,

    /// Items processed per batch
    pub batch_size: usize,

    /// Items processed concurrently within a batch
    pub concurrency: usize,

    /// Attempts per extraction method
    pub max_retries: u32,

    /// Per-item processing timeout in seconds
    pub item_timeout_secs: u64,

    /// Fetch transcripts
    pub extract_transcripts: bool,

    /// Fetch chapters
    pub extract_chapters: bool,

    /// Transcript language preference
    pub language: LanguagePreference,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            max_items: 20,
            lookback_days: 30,
            include_shorts: false,
            shorts_threshold_secs: 60,
            skip_existing: true,
            batch_size: 5,
            concurrency: num_cpus::get().clamp(1, 4),
            max_retries: 3,
            item_timeout_secs: 300,
            extract_transcripts: true,
            extract_chapters: true,
            language: LanguagePreference::default(),
        }
    }
}

impl ImportSettings {
    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.lookback_days))
    }

    /// Reject settings that have no safe default
    pub fn validate(&self) -> Result<()> {
        if self.max_items == 0 {
            return Err(IngestError::config("max_items must be greater than 0"));
        }
        if self.max_retries == 0 {
            return Err(IngestError::config("max_retries must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(IngestError::config("batch_size must be greater than 0"));
        }
        if self.concurrency == 0 {
            return Err(IngestError::config("concurrency must be greater than 0"));
        }
        if self.item_timeout_secs == 0 {
            return Err(IngestError::config("item_timeout_secs must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one JSON record per imported item
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { dir: PathBuf::from("./data/items") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        let config_paths = ["yt-ingest.toml", "config/yt-ingest.toml"];

        for path in &config_paths {
            if let Ok(config_str) = std::fs::read_to_string(path) {
                match toml::from_str::<Config>(&config_str) {
                    Ok(config) => {
                        tracing::info!("📄 Loaded configuration from: {}", path);
                        return Ok(config.apply_env());
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse config file {}: {}", path, e);
                    }
                }
            }
        }

        Ok(Self::from_env())
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&config_str)?;
        tracing::info!("📄 Loaded configuration from: {}", path.display());
        Ok(config.apply_env())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    /// Override with environment variables
    fn apply_env(mut self) -> Self {
        if let Ok(api_key) = std::env::var("YT_INGEST_API_KEY") {
            self.youtube.api_key = Some(api_key);
        }

        if let Ok(host) = std::env::var("YT_INGEST_PROXY_HOST") {
            self.proxy.host = Some(host);
        }

        if let Ok(port) = std::env::var("YT_INGEST_PROXY_PORT") {
            self.proxy.port = port.parse().unwrap_or(self.proxy.port);
        }

        if let Ok(username) = std::env::var("YT_INGEST_PROXY_USERNAME") {
            self.proxy.username = Some(username);
        }

        if let Ok(password) = std::env::var("YT_INGEST_PROXY_PASSWORD") {
            self.proxy.password = Some(password);
        }

        if let Ok(size) = std::env::var("YT_INGEST_PROXY_POOL_SIZE") {
            self.proxy.pool_size = size.parse().unwrap_or(self.proxy.pool_size);
        }

        if let Ok(legacy) = std::env::var("YT_INGEST_PROXY") {
            self.proxy.legacy_proxy = Some(legacy);
        }

        if let Ok(dir) = std::env::var("YT_INGEST_STORAGE_DIR") {
            self.storage.dir = PathBuf::from(dir);
        }

        if let Ok(level) = std::env::var("YT_INGEST_LOG_LEVEL") {
            self.logging.level = level;
        }

        self
    }

    /// Save configuration to file
    pub fn save(&self, path: &str) -> Result<()> {
        let config_str = toml::to_string_pretty(self)
            .map_err(|e| IngestError::config(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, config_str)?;
        tracing::info!("💾 Configuration saved to: {}", path);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.proxy.pool_size == 0 {
            return Err(IngestError::config("proxy pool_size must be greater than 0"));
        }

        if self.extraction.transcript_methods.is_empty() {
            return Err(IngestError::config("at least one transcript method is required"));
        }

        if self.youtube.discovery_strategies.is_empty() {
            return Err(IngestError::config("at least one discovery strategy is required"));
        }

        self.import.validate()?;

        tracing::info!("✅ Configuration validation passed");
        Ok(())
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "Ingest Configuration:\n\
            - Proxy: {}\n\
            - Pool Size: {}\n\
            - Data API: {}\n\
            - Transcript Methods: {:?}\n\
            - Max Retries: {}\n\
            - Storage: {}",
            if self.proxy.is_rotating() {
                "rotating"
            } else if self.proxy.legacy_proxy.is_some() {
                "single"
            } else {
                "direct"
            },
            self.proxy.pool_size,
            if self.youtube.api_key.is_some() { "configured" } else { "missing" },
            self.extraction.transcript_methods,
            self.import.max_retries,
            self.storage.dir.display()
        )
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_rotating_proxy(mut self, host: &str, port: u16, username: &str, password: &str, pool_size: usize) -> Self {
        self.config.proxy.host = Some(host.to_string());
        self.config.proxy.port = port;
        self.config.proxy.username = Some(username.to_string());
        self.config.proxy.password = Some(password.to_string());
        self.config.proxy.pool_size = pool_size;
        self
    }

    pub fn with_api_key(mut self, api_key: String) -> Self {
        self.config.youtube.api_key = Some(api_key);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.config.import.max_retries = retries;
        self
    }

    pub fn with_storage_dir(mut self, dir: PathBuf) -> Self {
        self.config.storage.dir = dir;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.extraction.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn include_shorts(mut self, include: bool) -> Self {
        self.config.import.include_shorts = include;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
