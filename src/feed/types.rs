use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::storage::ParsedItem;

// ============================================================================
// Strategy
// ============================================================================

/// Retrieval method a source is fetched with.
///
/// `Auto` is not a method of its own: it walks [`Strategy::PRIORITY`] until one
/// method yields items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Auto,
    /// Self-hosted feed mirror serving one Atom/RSS document per account.
    Mirror,
    /// RSSHub-style bridge route.
    Rsshub,
    /// Direct RSS/Atom URL or a path under the configured feed host.
    Feed,
    /// JSON search endpoint keyed by account name.
    Search,
}

impl Strategy {
    /// Fallback order used by `Auto`, most reliable first.
    pub const PRIORITY: [Strategy; 4] = [
        Strategy::Mirror,
        Strategy::Rsshub,
        Strategy::Feed,
        Strategy::Search,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Auto => "auto",
            Strategy::Mirror => "mirror",
            Strategy::Rsshub => "rsshub",
            Strategy::Feed => "feed",
            Strategy::Search => "search",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Strategy::Auto),
            "mirror" => Ok(Strategy::Mirror),
            "rsshub" => Ok(Strategy::Rsshub),
            "feed" => Ok(Strategy::Feed),
            "search" => Ok(Strategy::Search),
            _ => Err(FetchError::UnsupportedStrategy(s.to_string())),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors produced while fetching a source.
///
/// Individual method failures are folded into the fallback chain; only the
/// final outcome of a fetch leaves [`SourceFetcher`](super::SourceFetcher).
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport failure (DNS, connect, TLS, reset)
    #[error("Network error: {0}")]
    Network(String),
    /// The method did not answer within its time budget
    #[error("Request timed out after {0}s")]
    Timeout(u64),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Target URL is malformed or points at a blocked host
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// Response arrived but is not in the expected feed shape
    #[error("Parse error: {0}")]
    Parse(String),
    /// Well-formed response with zero usable items
    #[error("No items returned")]
    EmptyResult,
    /// Unknown strategy name, or a strategy with no registered method
    #[error("Unsupported strategy: {0}")]
    UnsupportedStrategy(String),
    /// The method has no endpoint configured
    #[error("Strategy '{0}' is not configured")]
    NotConfigured(Strategy),
    /// Every method of the fallback chain failed
    #[error("All fetch methods failed: {}", summarize(.0))]
    AllMethodsExhausted(Vec<MethodFailure>),
}

/// Coarse classification of [`FetchError`] matching the documented taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Network,
    Parse,
    EmptyResult,
    UnsupportedStrategy,
    AllMethodsExhausted,
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Network(_)
            | FetchError::Timeout(_)
            | FetchError::HttpStatus(_)
            | FetchError::ResponseTooLarge
            | FetchError::InvalidUrl(_)
            | FetchError::NotConfigured(_) => FetchErrorKind::Network,
            FetchError::Parse(_) => FetchErrorKind::Parse,
            FetchError::EmptyResult => FetchErrorKind::EmptyResult,
            FetchError::UnsupportedStrategy(_) => FetchErrorKind::UnsupportedStrategy,
            FetchError::AllMethodsExhausted(_) => FetchErrorKind::AllMethodsExhausted,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return FetchError::HttpStatus(status.as_u16());
        }
        FetchError::Network(e.to_string())
    }
}

/// One failed attempt inside a fetch, kept for diagnostics.
#[derive(Debug)]
pub struct MethodFailure {
    pub strategy: Strategy,
    pub error: FetchError,
}

impl fmt::Display for MethodFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.error)
    }
}

fn summarize(failures: &[MethodFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Fetch Report
// ============================================================================

/// Successful fetch: normalized items plus how they were obtained.
#[derive(Debug)]
pub struct FetchReport {
    pub items: Vec<ParsedItem>,
    /// The method that produced `items`
    pub strategy: Strategy,
    /// Failures of methods tried before `strategy` (only non-empty for `Auto`)
    pub attempts: Vec<MethodFailure>,
}
