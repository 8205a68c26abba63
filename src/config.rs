//! Configuration file parser for ~/.config/feedwatch/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos.
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable that overrides `search.api_key`.
pub const SEARCH_API_KEY_ENV: &str = "FEEDWATCH_SEARCH_API_KEY";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// Values parse but make no sense together.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All sections use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub fetch: FetchConfig,
    pub sync: SyncConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: Backend,
    /// Database file; defaults to `~/.config/feedwatch/feedwatch.db`.
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sqlite,
            path: None,
        }
    }
}

/// Default route of the feed mirror.
pub const MIRROR_ROUTE: &str = "/feeds/{identifier}.atom";
/// Default route of the RSSHub bridge.
pub const RSSHUB_ROUTE: &str = "/wechat/mp/{identifier}";

/// Longest accepted timer period (one year).
pub const MAX_TIMER_MINUTES: u64 = 525_600;

/// Endpoint of a route-based method (`mirror`, `rsshub`).
///
/// Each method has its own default route, so the section is deserialized
/// with the route default of the method it configures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEndpoint {
    pub base_url: Option<String>,
    /// Path appended to `base_url`; `{identifier}` is replaced with the source identifier.
    pub route: String,
}

impl RouteEndpoint {
    fn with_route(route: &str) -> Self {
        Self {
            base_url: None,
            route: route.to_string(),
        }
    }
}

/// A route section as written in the file, before method defaults apply.
#[derive(Default, Deserialize)]
#[serde(default)]
struct RawRouteEndpoint {
    base_url: Option<String>,
    route: Option<String>,
}

impl RawRouteEndpoint {
    fn resolve(self, default_route: &str) -> RouteEndpoint {
        RouteEndpoint {
            base_url: self.base_url,
            route: self.route.unwrap_or_else(|| default_route.to_string()),
        }
    }
}

fn deserialize_mirror<'de, D: Deserializer<'de>>(d: D) -> Result<RouteEndpoint, D::Error> {
    Ok(RawRouteEndpoint::deserialize(d)?.resolve(MIRROR_ROUTE))
}

fn deserialize_rsshub<'de, D: Deserializer<'de>>(d: D) -> Result<RouteEndpoint, D::Error> {
    Ok(RawRouteEndpoint::deserialize(d)?.resolve(RSSHUB_ROUTE))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeedEndpoint {
    /// Host that relative feed paths are joined onto. Absolute URLs ignore it.
    pub base_url: Option<String>,
}

/// JSON search endpoint.
///
/// Custom Debug impl masks `api_key` so the secret never reaches logs.
#[derive(Default, Deserialize)]
#[serde(default)]
pub struct SearchEndpoint {
    pub base_url: Option<String>,
    #[serde(deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,
}

fn deserialize_secret<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(d)?.map(SecretString::from))
}

impl std::fmt::Debug for SearchEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchEndpoint")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Time budget of a single method attempt.
    pub timeout_secs: u64,
    /// Items requested per source and sync.
    pub limit: usize,
    pub max_concurrent_sources: usize,
    /// Permit direct feed URLs that resolve to loopback or private ranges.
    pub allow_private_hosts: bool,
    pub user_agent: String,
    #[serde(deserialize_with = "deserialize_mirror")]
    pub mirror: RouteEndpoint,
    #[serde(deserialize_with = "deserialize_rsshub")]
    pub rsshub: RouteEndpoint,
    pub feed: FeedEndpoint,
    pub search: SearchEndpoint,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            limit: 10,
            max_concurrent_sources: 4,
            allow_private_hosts: false,
            user_agent: concat!("feedwatch/", env!("CARGO_PKG_VERSION")).to_string(),
            mirror: RouteEndpoint::with_route(MIRROR_ROUTE),
            rsshub: RouteEndpoint::with_route(RSSHUB_ROUTE),
            feed: FeedEndpoint::default(),
            search: SearchEndpoint::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Consecutive failures before a source is flagged `error`.
    pub failure_threshold: u32,
    /// Items older than this many days are removed by cleanup.
    pub retention_days: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 1,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerKind {
    Sync,
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimerConfig {
    pub name: String,
    pub kind: TimerKind,
    pub every_minutes: u64,
}

impl TimerConfig {
    pub fn new(name: &str, kind: TimerKind, every_minutes: u64) -> Self {
        Self {
            name: name.to_string(),
            kind,
            every_minutes,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub timers: Vec<TimerConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timers: vec![
                TimerConfig::new("frequent-sync", TimerKind::Sync, 30),
                TimerConfig::new("daily-sync", TimerKind::Sync, 24 * 60),
                TimerConfig::new("nightly-cleanup", TimerKind::Cleanup, 24 * 60),
            ],
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Default config directory (`~/.config/feedwatch/`).
    pub fn default_dir() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join("feedwatch"))
    }

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    ///
    /// The search API key from the environment wins over the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(path)?;
        if let Ok(key) = std::env::var(SEARCH_API_KEY_ENV) {
            if !key.trim().is_empty() {
                config.fetch.search.api_key = Some(SecretString::from(key));
            }
        }
        config.validate()?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to bound memory use
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            backend = ?config.storage.backend,
            timers = config.scheduler.timers.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch.timeout_secs == 0 {
            return Err(ConfigError::Invalid("fetch.timeout_secs must be positive".into()));
        }
        if self.fetch.limit == 0 {
            return Err(ConfigError::Invalid("fetch.limit must be positive".into()));
        }
        let mut names = std::collections::HashSet::new();
        for timer in &self.scheduler.timers {
            if timer.every_minutes == 0 {
                return Err(ConfigError::Invalid(format!(
                    "timer '{}' must fire at least every minute",
                    timer.name
                )));
            }
            if timer.every_minutes > MAX_TIMER_MINUTES {
                return Err(ConfigError::Invalid(format!(
                    "timer '{}' must fire at least once a year (every_minutes <= {})",
                    timer.name, MAX_TIMER_MINUTES
                )));
            }
            if !names.insert(timer.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "timer '{}' is defined twice",
                    timer.name
                )));
            }
        }
        Ok(())
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    const SECTIONS: &[(&str, &[&str])] = &[
        ("storage", &["backend", "path"]),
        (
            "fetch",
            &[
                "timeout_secs",
                "limit",
                "max_concurrent_sources",
                "allow_private_hosts",
                "user_agent",
                "mirror",
                "rsshub",
                "feed",
                "search",
            ],
        ),
        ("sync", &["failure_threshold", "retention_days"]),
        ("scheduler", &["timers"]),
    ];

    for (key, value) in raw {
        match SECTIONS.iter().find(|(section, _)| section == key) {
            Some((section, known)) => {
                if let Some(table) = value.as_table() {
                    for inner in table.keys() {
                        if !known.contains(&inner.as_str()) {
                            tracing::warn!(key = %format!("{}.{}", section, inner), "Unknown key in config file, ignoring");
                        }
                    }
                }
            }
            None => tracing::warn!(key = %key, "Unknown key in config file, ignoring"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
