use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE};
use reqwest::{Client, ClientBuilder, StatusCode};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

use crate::config::{MirrorConfig, RetryPolicy};
use crate::error::{MirrorError, Result};
use crate::manifest::{Asset, FetchOutcome, Fetched, Manifest};

/// Retrieves remote resources with bounded concurrency, per-request timeouts
/// and retries on transient failures.
pub struct AssetFetcher {
    client: Client,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
    requests: AtomicUsize,
}

/// One failed attempt, and whether another attempt may succeed.
struct AttemptError {
    error: MirrorError,
    retryable: bool,
}

impl AssetFetcher {
    pub fn new(config: &MirrorConfig) -> Result<Self> {
        let client = Self::build_http_client(config)?;
        Ok(Self {
            client,
            retry: config.retry.clone(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            requests: AtomicUsize::new(0),
        })
    }

    fn build_http_client(config: &MirrorConfig) -> Result<Client> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        ClientBuilder::new()
            .use_rustls_tls()
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .cookie_store(true)
            .timeout(config.timeout)
            .build()
            .map_err(MirrorError::Client)
    }

    /// Number of HTTP requests sent so far, retries included.
    pub fn requests_sent(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    /// Fetch `url` into its manifest entry.
    ///
    /// The entry is created if needed and the retrieval runs inside the
    /// entry's once-cell: concurrent and repeated callers for the same URL
    /// wait on the single in-flight retrieval and all observe its outcome.
    pub async fn fetch(&self, manifest: &Manifest, url: &Url) -> Arc<Asset> {
        let (asset, _) = manifest.insert_if_absent(url);
        asset
            .outcome
            .get_or_init(|| async {
                match self.retrieve(url).await {
                    Ok(fetched) => FetchOutcome::Fetched(fetched),
                    Err(error) => FetchOutcome::Failed(error),
                }
            })
            .await;
        asset
    }

    /// Retrieve `url` without touching any manifest, retrying transient
    /// failures according to the retry policy.
    pub async fn retrieve(&self, url: &Url) -> Result<Fetched> {
        let mut attempt = 0;
        loop {
            match self.attempt(url).await {
                Ok(fetched) => {
                    debug!(%url, bytes = fetched.body.len(), "fetched");
                    return Ok(fetched);
                }
                Err(failure) if failure.retryable && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(%url, attempt, ?delay, error = %failure.error, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(failure) => {
                    warn!(%url, attempts = attempt + 1, error = %failure.error, "fetch failed");
                    return Err(failure.error);
                }
            }
        }
    }

    async fn attempt(&self, url: &Url) -> std::result::Result<Fetched, AttemptError> {
        let _permit = self.semaphore.acquire().await.map_err(|e| AttemptError {
            error: MirrorError::network(url, e),
            retryable: false,
        })?;

        self.requests.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| AttemptError {
                error: MirrorError::network(url, e),
                retryable: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError {
                error: MirrorError::network(url, format!("HTTP {status}")),
                retryable: is_transient(status),
            });
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let body = response.bytes().await.map_err(|e| AttemptError {
            error: MirrorError::network(url, e),
            retryable: true,
        })?;

        Ok(Fetched {
            body: body.to_vec(),
            content_type,
            final_url,
        })
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_transient(StatusCode::BAD_GATEWAY));
        assert!(is_transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_transient(StatusCode::NOT_FOUND));
        assert!(!is_transient(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_fetcher_builds_from_default_config() {
        let fetcher = AssetFetcher::new(&MirrorConfig::default()).unwrap();
        assert_eq!(fetcher.requests_sent(), 0);
    }
}
