//! Server status source
//!
//! Fetches the `server-status?auto` page and times the request. The elapsed
//! wall-clock time is the service response time the rest of the daemon
//! reasons about.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Status page path appended to the configured base URL
pub const STATUS_PATH: &str = "/server-status?auto";

/// Raw status page together with how long it took to get it
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub body: String,
    /// Seconds
    pub response_time: f64,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StatusError {
    /// Connect failure, timeout, or a connection dropped mid-response
    #[error("status endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("status endpoint answered HTTP {0}")]
    HttpStatus(u16),

    #[error("failed to read status response: {0}")]
    Body(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl StatusError {
    /// True when the server is failing to answer, as opposed to the status
    /// page being misconfigured. The collector records these as an
    /// unreachable service instead of failing the cycle.
    pub fn is_degraded(&self) -> bool {
        match self {
            StatusError::Unreachable(_) | StatusError::Body(_) => true,
            StatusError::HttpStatus(code) => *code >= 500,
            StatusError::Client(_) => false,
        }
    }
}

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self) -> Result<StatusReport, StatusError>;
}

/// Fetches the status page over HTTP with reqwest
pub struct HttpStatusSource {
    client: reqwest::Client,
    url: String,
}

impl HttpStatusSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, StatusError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StatusError::Client(e.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), STATUS_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn classify(error: reqwest::Error) -> StatusError {
    if error.is_timeout()
        || error.is_connect()
        || error.is_request()
        || error.is_body()
        || error.is_decode()
    {
        StatusError::Unreachable(error.to_string())
    } else {
        StatusError::Body(error.to_string())
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch(&self) -> Result<StatusReport, StatusError> {
        let started = Instant::now();

        let response = self.client.get(&self.url).send().await.map_err(classify)?;
        if !response.status().is_success() {
            return Err(StatusError::HttpStatus(response.status().as_u16()));
        }
        let body = response.text().await.map_err(classify)?;

        let response_time = started.elapsed().as_secs_f64();
        debug!("Status page fetched in {:.3}s", response_time);

        Ok(StatusReport {
            body,
            response_time,
        })
    }
}

// ============================================================================
// Fake Status Source (Testing)
// ============================================================================

/// Status source replaying scripted results.
///
/// Results are handed out in order; the last one repeats once the script
/// runs out.
#[derive(Debug, Clone)]
pub struct FakeStatusSource {
    script: Arc<Mutex<VecDeque<Result<StatusReport, StatusError>>>>,
    fetches: Arc<Mutex<usize>>,
}

impl FakeStatusSource {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fetches: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_body(self, body: &str, response_time: f64) -> Self {
        self.push(Ok(StatusReport {
            body: body.to_string(),
            response_time,
        }))
    }

    pub fn with_error(self, error: StatusError) -> Self {
        self.push(Err(error))
    }

    fn push(self, result: Result<StatusReport, StatusError>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(result);
        self
    }

    pub fn fetch_count(&self) -> usize {
        *self
            .fetches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for FakeStatusSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusSource for FakeStatusSource {
    async fn fetch(&self) -> Result<StatusReport, StatusError> {
        *self
            .fetches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;

        let mut script = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        next.unwrap_or_else(|| Err(StatusError::Unreachable("no scripted status".to_string())))
    }
}
