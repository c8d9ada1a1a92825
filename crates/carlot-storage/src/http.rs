use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub min_request_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            accept_language: Some("ja,en-US;q=0.9,en;q=0.8".to_string()),
            min_request_delay: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Spaces outbound requests at least `min_interval` apart, including retries.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut next_slot = self.next_slot.lock().await;
        if let Some(at) = *next_slot {
            if at > Instant::now() {
                tokio::time::sleep_until(at).await;
            }
        }
        *next_slot = Some(Instant::now() + self.min_interval);
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        if let Some(lang) = &config.accept_language {
            headers.insert(
                reqwest::header::ACCEPT_LANGUAGE,
                reqwest::header::HeaderValue::from_str(lang)
                    .context("invalid accept-language header")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            pacer: RequestPacer::new(config.min_request_delay),
            backoff: config.backoff,
        })
    }

    /// GET `url` as text, retrying transient failures with capped exponential backoff.
    pub async fn fetch_text(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            self.pacer.wait_turn().await;
            let attempts = attempt + 1;
            let can_retry = attempt < self.backoff.max_retries;

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        match resp.text().await {
                            Ok(body) => {
                                debug!(status = status.as_u16(), attempts, "fetched");
                                return Ok(FetchedResponse {
                                    status,
                                    final_url,
                                    body,
                                    attempts,
                                });
                            }
                            Err(err) if can_retry && classify_reqwest_error(&err) == RetryDisposition::Retryable => {
                                warn!(error = %err, attempts, "body read failed, retrying");
                            }
                            Err(err) => {
                                return Err(FetchError::Request {
                                    url: url.to_string(),
                                    attempts,
                                    source: err,
                                })
                            }
                        }
                    } else if can_retry && classify_status(status) == RetryDisposition::Retryable {
                        warn!(status = status.as_u16(), attempts, "retryable status");
                    } else {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                            attempts,
                        });
                    }
                }
                Err(err) => {
                    if !(can_retry && classify_reqwest_error(&err) == RetryDisposition::Retryable) {
                        return Err(FetchError::Request {
                            url: url.to_string(),
                            attempts,
                            source: err,
                        });
                    }
                    warn!(error = %err, attempts, "request failed, retrying");
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}
