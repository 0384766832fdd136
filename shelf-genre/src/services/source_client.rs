//! Resilient HTTP client for external genre sources
//!
//! One [`ResilientClient`] per source. Each call is retried up to
//! `RetryPolicy::max_attempts` on transient failure (network error,
//! timeout, 5xx, 408, 429) with exponential backoff plus jitter. A 429
//! waits longer than other transient failures. Any other non-success
//! status fails immediately as [`FetchError::Permanent`].
//!
//! The only shared state is the optional per-source rate limiter.

use crate::config::{HttpSettings, RetryPolicy};
use crate::error::FetchError;
use crate::models::SourceKind;
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// GET request to a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// URL with unencoded query, for logs and test matching
    pub fn describe(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let query: Vec<String> = self
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{}?{}", self.url, query.join("&"))
    }
}

/// Status and body of a completed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Request never produced a status
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Other(String),
}

/// Raw HTTP transport
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(settings: &HttpSettings, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(settings.timeout())
            .connect_timeout(settings.connect_timeout())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .get(&request.url)
            .query(&request.query)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify_reqwest_error)?;
        Ok(HttpResponse { status, body })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

enum Verdict {
    Done(HttpResponse),
    Retry { reason: String, rate_limited: bool },
    Permanent { status: Option<u16>, reason: String },
}

fn classify(result: Result<HttpResponse, TransportError>) -> Verdict {
    match result {
        Ok(response) if response.is_success() => Verdict::Done(response),
        Ok(response) if response.status == 429 => Verdict::Retry {
            reason: "HTTP 429 rate limited".to_string(),
            rate_limited: true,
        },
        Ok(response) if response.status >= 500 || response.status == 408 => Verdict::Retry {
            reason: format!("HTTP {}", response.status),
            rate_limited: false,
        },
        Ok(response) => Verdict::Permanent {
            status: Some(response.status),
            reason: if response.status == 404 {
                "not found".to_string()
            } else {
                format!("unexpected status {}", response.status)
            },
        },
        Err(err) => Verdict::Retry {
            reason: err.to_string(),
            rate_limited: false,
        },
    }
}

/// Bounded-retry client for one source
pub struct ResilientClient {
    kind: SourceKind,
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    limiter: Option<DirectLimiter>,
}

impl ResilientClient {
    pub fn new(kind: SourceKind, transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> Self {
        Self {
            kind,
            transport,
            policy,
            limiter: None,
        }
    }

    /// Limit this source to `per_second` requests; 0 leaves it unlimited
    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.limiter = NonZeroU32::new(per_second).map(|n| RateLimiter::direct(Quota::per_second(n)));
        self
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Execute with retries
    pub async fn attempt(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 0..max_attempts {
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            match classify(self.transport.execute(request).await) {
                Verdict::Done(response) => {
                    debug!(
                        source = %self.kind,
                        url = %request.describe(),
                        attempt = attempt + 1,
                        "Source request succeeded"
                    );
                    return Ok(response);
                }
                Verdict::Permanent { status, reason } => {
                    debug!(
                        source = %self.kind,
                        url = %request.describe(),
                        status = ?status,
                        "Permanent source failure, not retrying"
                    );
                    return Err(FetchError::Permanent {
                        source_kind: self.kind,
                        status,
                        reason,
                    });
                }
                Verdict::Retry {
                    reason,
                    rate_limited,
                } => {
                    if attempt + 1 < max_attempts {
                        let delay = self.policy.delay(attempt, rate_limited, rand::random::<f64>());
                        warn!(
                            source = %self.kind,
                            url = %request.describe(),
                            attempt = attempt + 1,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            reason = %reason,
                            "Transient source failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_reason = reason;
                }
            }
        }

        Err(FetchError::Transient {
            source_kind: self.kind,
            attempts: max_attempts,
            reason: last_reason,
        })
    }

    /// Execute with retries and decode a JSON body
    pub async fn attempt_json<T: DeserializeOwned>(
        &self,
        request: &HttpRequest,
    ) -> Result<T, FetchError> {
        let response = self.attempt(request).await?;
        serde_json::from_str(&response.body)
            .map_err(|e| FetchError::malformed(self.kind, e.to_string()))
    }
}
