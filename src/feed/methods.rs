use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;

use super::http::get_bytes;
use super::parser::{parse_feed, parse_search_response};
use super::types::{FetchError, Strategy};
use crate::config::FetchConfig;
use crate::storage::ParsedItem;
use crate::util::validate_url;

/// One independent way of retrieving a source's latest items.
///
/// Implementations return raw items; the fetcher applies timeouts,
/// normalization and the empty-result check uniformly.
#[async_trait]
pub trait FetchMethod: Send + Sync {
    fn strategy(&self) -> Strategy;

    async fn fetch(&self, identifier: &str, limit: usize) -> Result<Vec<ParsedItem>, FetchError>;
}

/// Percent-encode an identifier for use inside a URL path.
fn encode_path_segment(identifier: &str) -> String {
    url::form_urlencoded::byte_serialize(identifier.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn join_base(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

// ============================================================================
// Route feeds (mirror, rsshub)
// ============================================================================

/// Feed served by a bridge at `{base_url}{route}`, one document per account.
pub struct RouteFeedMethod {
    strategy: Strategy,
    base_url: Option<String>,
    route: String,
    client: reqwest::Client,
}

impl RouteFeedMethod {
    pub fn new(
        strategy: Strategy,
        base_url: Option<String>,
        route: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            strategy,
            base_url,
            route: route.into(),
            client,
        }
    }

    fn url_for(&self, identifier: &str) -> Result<String, FetchError> {
        let base = self
            .base_url
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .ok_or(FetchError::NotConfigured(self.strategy))?;
        let route = self
            .route
            .replace("{identifier}", &encode_path_segment(identifier.trim()));
        Ok(join_base(base, &route))
    }
}

#[async_trait]
impl FetchMethod for RouteFeedMethod {
    fn strategy(&self) -> Strategy {
        self.strategy
    }

    async fn fetch(&self, identifier: &str, _limit: usize) -> Result<Vec<ParsedItem>, FetchError> {
        let url = self.url_for(identifier)?;
        let bytes = get_bytes(&self.client, &url, None).await?;
        parse_feed(&bytes)
    }
}

// ============================================================================
// Direct feed
// ============================================================================

/// RSS/Atom document addressed by the identifier itself.
///
/// Absolute `http(s)` identifiers are fetched as-is after host validation;
/// anything else is treated as a path under the configured feed host.
pub struct DirectFeedMethod {
    base_url: Option<String>,
    allow_private_hosts: bool,
    client: reqwest::Client,
}

impl DirectFeedMethod {
    pub fn new(base_url: Option<String>, allow_private_hosts: bool, client: reqwest::Client) -> Self {
        Self {
            base_url,
            allow_private_hosts,
            client,
        }
    }

    fn url_for(&self, identifier: &str) -> Result<String, FetchError> {
        let identifier = identifier.trim();
        let lower = identifier.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let url = validate_url(identifier, self.allow_private_hosts)
                .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
            return Ok(url.to_string());
        }

        let base = self
            .base_url
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .ok_or(FetchError::NotConfigured(Strategy::Feed))?;
        Ok(join_base(base, identifier))
    }
}

#[async_trait]
impl FetchMethod for DirectFeedMethod {
    fn strategy(&self) -> Strategy {
        Strategy::Feed
    }

    async fn fetch(&self, identifier: &str, _limit: usize) -> Result<Vec<ParsedItem>, FetchError> {
        let url = self.url_for(identifier)?;
        let bytes = get_bytes(&self.client, &url, None).await?;
        parse_feed(&bytes)
    }
}

// ============================================================================
// Search API
// ============================================================================

/// JSON search endpoint queried by account name.
pub struct SearchMethod {
    base_url: Option<String>,
    api_key: Option<SecretString>,
    client: reqwest::Client,
}

impl SearchMethod {
    pub fn new(base_url: Option<String>, api_key: Option<SecretString>, client: reqwest::Client) -> Self {
        Self {
            base_url,
            api_key,
            client,
        }
    }

    fn url_for(&self, identifier: &str, limit: usize) -> Result<String, FetchError> {
        let base = self
            .base_url
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .ok_or(FetchError::NotConfigured(Strategy::Search))?;
        let url = url::Url::parse_with_params(
            &join_base(base, "search"),
            &[
                ("query", identifier.trim().to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        Ok(url.to_string())
    }
}

#[async_trait]
impl FetchMethod for SearchMethod {
    fn strategy(&self) -> Strategy {
        Strategy::Search
    }

    async fn fetch(&self, identifier: &str, limit: usize) -> Result<Vec<ParsedItem>, FetchError> {
        let url = self.url_for(identifier, limit)?;
        let bytes = get_bytes(&self.client, &url, self.api_key.as_ref()).await?;
        parse_search_response(&bytes)
    }
}

/// Build the configured methods in fallback priority order.
pub fn build_methods(config: &FetchConfig, client: &reqwest::Client) -> Vec<Arc<dyn FetchMethod>> {
    let api_key = config
        .search
        .api_key
        .as_ref()
        .map(|k| SecretString::from(k.expose_secret().to_string()));

    Strategy::PRIORITY
        .iter()
        .filter_map(|strategy| -> Option<Arc<dyn FetchMethod>> {
            let method: Arc<dyn FetchMethod> = match strategy {
                // The chain itself, never a method of its own
                Strategy::Auto => return None,
                Strategy::Mirror => Arc::new(RouteFeedMethod::new(
                    Strategy::Mirror,
                    config.mirror.base_url.clone(),
                    config.mirror.route.clone(),
                    client.clone(),
                )),
                Strategy::Rsshub => Arc::new(RouteFeedMethod::new(
                    Strategy::Rsshub,
                    config.rsshub.base_url.clone(),
                    config.rsshub.route.clone(),
                    client.clone(),
                )),
                Strategy::Feed => Arc::new(DirectFeedMethod::new(
                    config.feed.base_url.clone(),
                    config.allow_private_hosts,
                    client.clone(),
                )),
                Strategy::Search => Arc::new(SearchMethod::new(
                    config.search.base_url.clone(),
                    api_key.clone(),
                    client.clone(),
                )),
            };
            Some(method)
        })
        .collect()
}
