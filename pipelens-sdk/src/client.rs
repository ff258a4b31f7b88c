//! HTTP delivery of finished runs to the pipelens backend.
//!
//! `TraceClient::send_run` is the synchronous path: it retries transient
//! failures with a short backoff and gives up fast on client rejections.
//! The background path in [`crate::background`] wraps the same transport.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use reqwest::{Client, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;

use pipelens_types::{CreateRunResponse, PipelineRun, RunDetail, RunListResponse};

/// Total delivery attempts for one run (1 initial + 2 retries).
const MAX_ATTEMPTS: u32 = 3;
/// Backoff before the second attempt; doubles before the third.
const BASE_DELAY_MS: u64 = 500;

/// Shared HTTP client so every `TraceClient` reuses one connection pool.
static SHARED_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .pool_max_idle_per_host(5)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .expect("Failed to create shared HTTP client")
});

/// Why a delivery or query failed.
#[derive(Debug, Clone)]
pub enum SendError {
    /// The backend refused the payload (4xx). Never retried.
    Rejected { status: u16, body: String },
    /// The request never completed or the response was unreadable.
    Transport(String),
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: String },
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Rejected { status, body } => {
                write!(f, "rejected with HTTP {}: {}", status, body)
            }
            SendError::Transport(msg) => write!(f, "transport error: {}", msg),
            SendError::Exhausted { attempts, last } => {
                write!(f, "delivery failed after {} attempts: {}", attempts, last)
            }
        }
    }
}

impl std::error::Error for SendError {}

/// Where finished runs go. `TraceClient` is the real implementation;
/// [`MemoryTransport`] captures runs in-process.
#[async_trait]
pub trait RunTransport: Send + Sync {
    async fn deliver(&self, run: &PipelineRun) -> Result<CreateRunResponse, SendError>;
}

/// Filters for [`TraceClient::query_runs`], mirroring `GET /api/runs`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Single tag the run must carry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    /// JSON object the run's context must contain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

/// HTTP client for the pipelens backend.
pub struct TraceClient {
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    client: Client,
}

impl TraceClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout_secs: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout: Duration::from_secs(timeout_secs),
            client: SHARED_CLIENT.clone(),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    /// Send one finished run, waiting for the outcome.
    ///
    /// Transient failures (transport errors, 5xx) are retried up to
    /// [`MAX_ATTEMPTS`] total attempts with 500ms then 1000ms in between.
    /// A 4xx response fails immediately: resending the same payload
    /// cannot succeed.
    pub async fn send_run(&self, run: &PipelineRun) -> Result<CreateRunResponse, SendError> {
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                let delay_ms = BASE_DELAY_MS * (1 << (attempt - 2));
                log::warn!(
                    "[DELIVERY] Retrying run {} (attempt {}/{}) after {}ms",
                    run.run_id,
                    attempt,
                    MAX_ATTEMPTS,
                    delay_ms
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            let response = match self
                .request(Method::POST, "/api/runs")
                .json(run)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    last_error = format!("request failed: {}", e);
                    log::warn!(
                        "[DELIVERY] Run {} attempt {}/{} failed: {}",
                        run.run_id,
                        attempt,
                        MAX_ATTEMPTS,
                        e
                    );
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<CreateRunResponse>()
                    .await
                    .map_err(|e| SendError::Transport(format!("invalid response body: {}", e)));
            }

            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            if (400..500).contains(&status_code) {
                return Err(SendError::Rejected {
                    status: status_code,
                    body,
                });
            }

            last_error = format!("HTTP {}: {}", status_code, body);
            log::warn!(
                "[DELIVERY] Run {} attempt {}/{} got server error: {}",
                run.run_id,
                attempt,
                MAX_ATTEMPTS,
                last_error
            );
        }

        Err(SendError::Exhausted {
            attempts: MAX_ATTEMPTS,
            last: last_error,
        })
    }

    /// Fetch a run with its full step traces. Single attempt.
    pub async fn get_run(&self, run_id: &str) -> Result<RunDetail, SendError> {
        let response = self
            .request(Method::GET, &format!("/api/runs/{}", run_id))
            .send()
            .await
            .map_err(|e| SendError::Transport(format!("request failed: {}", e)))?;
        Self::read_json(response).await
    }

    /// List runs matching `query`. Single attempt.
    pub async fn query_runs(&self, query: &RunQuery) -> Result<RunListResponse, SendError> {
        let response = self
            .request(Method::GET, "/api/runs")
            .query(query)
            .send()
            .await
            .map_err(|e| SendError::Transport(format!("request failed: {}", e)))?;
        Self::read_json(response).await
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, SendError> {
        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            if status_code >= 500 {
                return Err(SendError::Transport(format!(
                    "HTTP {}: {}",
                    status_code, body
                )));
            }
            return Err(SendError::Rejected {
                status: status_code,
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| SendError::Transport(format!("invalid response body: {}", e)))
    }
}

#[async_trait]
impl RunTransport for TraceClient {
    async fn deliver(&self, run: &PipelineRun) -> Result<CreateRunResponse, SendError> {
        self.send_run(run).await
    }
}

/// Transport that keeps delivered runs in memory instead of sending them
/// anywhere. Used by tests and for capturing runs without a backend.
#[derive(Default)]
pub struct MemoryTransport {
    runs: Mutex<Vec<PipelineRun>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every run delivered so far.
    pub fn delivered(&self) -> Vec<PipelineRun> {
        self.runs.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }
}

#[async_trait]
impl RunTransport for MemoryTransport {
    async fn deliver(&self, run: &PipelineRun) -> Result<CreateRunResponse, SendError> {
        self.runs.lock().push(run.clone());
        Ok(CreateRunResponse {
            status: "created".to_string(),
            run_id: run.run_id.clone(),
        })
    }
}
