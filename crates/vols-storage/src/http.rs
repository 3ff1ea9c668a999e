//! Outbound HTTP plumbing: one form request in, one decoded body out.
//!
//! No retries happen here. A timeout or connection failure is returned to the caller
//! as a [`TransportError`] and the caller decides what it means for its operation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable response: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(BROWSER_USER_AGENT.to_string()),
            global_concurrency: 4,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    default_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            default_timeout: config.timeout,
        })
    }

    /// POST `form` as `application/x-www-form-urlencoded` to `url?query`.
    ///
    /// `timeout` overrides the client default for this one request.
    pub async fn post_form(
        &self,
        url: &str,
        query: &[(&str, String)],
        form: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> Result<String, TransportError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        let timeout = timeout.unwrap_or(self.default_timeout);
        let span = info_span!("http_fetch", url, timeout_secs = timeout.as_secs());
        async move {
            let resp = self
                .client
                .post(url)
                .query(query)
                .form(form)
                .timeout(timeout)
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                return Err(TransportError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body = resp.text().await?;
            debug!(bytes = body.len(), %status, "fetched");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_browser_identity() {
        let config = HttpClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert!(config
            .user_agent
            .as_deref()
            .is_some_and(|ua| ua.starts_with("Mozilla/5.0")));
    }

    #[test]
    fn status_errors_are_not_timeouts() {
        let err = TransportError::HttpStatus {
            status: 503,
            url: "https://example.invalid".into(),
        };
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "http status 503 for https://example.invalid");
    }

    #[tokio::test]
    async fn unreachable_host_surfaces_as_transport_error() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .expect("client");
        let err = fetcher
            .post_form("http://127.0.0.1:9/never", &[], &[], None)
            .await
            .expect_err("nothing listens on the discard port");
        assert!(matches!(err, TransportError::Request(_)));
    }
}
