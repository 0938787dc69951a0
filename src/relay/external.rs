use reqwest::{Body, Client, StatusCode};
use std::path::Path;
use tokio::time::{sleep, Duration};
use tokio_util::io::ReaderStream;

use crate::config::Config;
use crate::errors::{AppError, AppResult};

/// Bounded retry schedule for the external PUT. The delay grows linearly:
/// base, base + step, base + 2*step, ...
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(1000),
            step: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            step: Duration::from_millis(config.retry_step_ms),
        }
    }

    /// Delay to sleep after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay + self.step * attempt
    }
}

/// Outcome of a single PUT attempt.
enum Attempt {
    /// 2xx with a well-formed URL body.
    Accepted(String),
    /// 4xx. The API will not take this file, ever.
    Rejected(StatusCode),
    /// Transport error or an unexpected status. Worth another try.
    Transient(String),
}

/// Client for the Facepunch map upload API.
pub struct MapApiClient {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl MapApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_policy(base_url, RetryPolicy::default())
    }

    pub fn with_policy(base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap(),
            base_url: base_url.into(),
            retry,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::with_policy(&config.external_base_url, RetryPolicy::from_config(config))
    }

    /// PUT the file at `path` to the external API as `file_name`, retrying
    /// transient failures on the policy's schedule.
    ///
    /// Returns `Ok(Some(url))` on success, `Ok(None)` when the API rejected
    /// the file or every attempt failed, and an error when the API violated
    /// its own success contract (2xx without a URL body).
    pub async fn upload_map(&self, path: &Path, file_name: &str) -> AppResult<Option<String>> {
        let request_uri = format!("{}{}", self.base_url, urlencoding::encode(file_name));

        for attempt in 0..self.retry.max_attempts {
            match self.attempt_put(&request_uri, path).await? {
                Attempt::Accepted(url) => {
                    log::info!("Received URL from external API: {}", url);
                    return Ok(Some(url));
                }
                Attempt::Rejected(status) => {
                    log::warn!(
                        "External API rejected {} with {}, not retrying",
                        file_name,
                        status
                    );
                    return Ok(None);
                }
                Attempt::Transient(reason) => {
                    log::warn!(
                        "Upload attempt {} of {} for {} failed: {}",
                        attempt + 1,
                        self.retry.max_attempts,
                        file_name,
                        reason
                    );

                    if attempt + 1 < self.retry.max_attempts {
                        sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        log::error!(
            "Giving up on {} after {} attempts",
            file_name,
            self.retry.max_attempts
        );
        Ok(None)
    }

    async fn attempt_put(&self, request_uri: &str, path: &Path) -> AppResult<Attempt> {
        // Re-open per attempt: the body stream is consumed by each request.
        let file = tokio::fs::File::open(path).await?;
        let body = Body::wrap_stream(ReaderStream::new(file));

        let response = match self
            .client
            .put(request_uri)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Ok(Attempt::Transient(e.to_string())),
        };

        let status = response.status();

        if status.is_success() {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => return Ok(Attempt::Transient(format!("failed to read body: {}", e))),
            };

            if !body.starts_with("http") {
                return Err(AppError::protocol_violation(&format!(
                    "status {} with body {:?}",
                    status, body
                )));
            }

            return Ok(Attempt::Accepted(body));
        }

        if status.is_client_error() {
            return Ok(Attempt::Rejected(status));
        }

        Ok(Attempt::Transient(format!("unexpected status {}", status)))
    }
}
