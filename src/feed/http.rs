use futures::StreamExt;
use reqwest::redirect::Policy;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

use super::types::FetchError;
use crate::config::FetchConfig;

/// Maximum accepted response body (10MB)
pub(crate) const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

/// Retries after the first attempt on 429/5xx responses
const MAX_RETRIES: u32 = 2;

/// Base delay of the retry backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Redirect policy: at most 3 hops, loops rejected.
fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );
        attempt.follow()
    })
}

/// Build the HTTP client shared by every fetch method.
pub fn build_client(config: &FetchConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .redirect(redirect_policy())
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(config.timeout_secs.max(1)))
        .build()
}

/// GET `url` and return the body, capped at [`MAX_RESPONSE_SIZE`].
///
/// 429 and 5xx responses are retried with exponential backoff; other non-2xx
/// statuses fail immediately with [`FetchError::HttpStatus`]. The caller's
/// method timeout bounds the total time spent here.
pub(crate) async fn get_bytes(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&SecretString>,
) -> Result<Vec<u8>, FetchError> {
    let mut retry_count = 0;

    loop {
        let mut request = client.get(url);
        if let Some(key) = bearer {
            request = request.header("Authorization", format!("Bearer {}", key.expose_secret()));
        }
        let response = request.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            if retry_count >= MAX_RETRIES {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }
            let delay = RETRY_BASE_DELAY * 2u32.pow(retry_count);
            tracing::warn!(
                url = %url,
                status = %status,
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Upstream busy, retrying after delay"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
            continue;
        }

        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        return read_limited_bytes(response, MAX_RESPONSE_SIZE).await;
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: trust an oversized Content-Length
    if let Some(len) = response.content_length() {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
