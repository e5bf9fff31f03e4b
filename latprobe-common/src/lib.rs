use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub const MAX_ENDPOINTS: usize = 10;
pub const MIN_REQUEST_COUNT: u32 = 1;
pub const MAX_REQUEST_COUNT: u32 = 200;
/// Length of the shareable run slug.
pub const SLUG_LEN: usize = 8;

/// Error types for latprobe operations
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatprobeError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Rate limit exceeded, try again in {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {0} failed")]
    RunFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("HTTP {0}: {1}")]
    HttpError(u16, String),

    #[error("Timed out waiting for run {0}")]
    Timeout(String),
}

/// Result type for latprobe operations
pub type Result<T> = std::result::Result<T, LatprobeError>;

/// JSON error envelope returned by the server for all error responses
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// HTTP methods a probe may use. GET and DELETE never carry a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 5] = [
        HttpMethod::Get,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Patch,
        HttpMethod::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Returns `true` for methods whose probes send the endpoint payload.
    pub fn carries_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = LatprobeError;

    fn from_str(s: &str) -> Result<Self> {
        HttpMethod::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                LatprobeError::Validation(format!(
                    "Unsupported HTTP method {s:?}; expected one of GET, POST, PUT, PATCH, DELETE"
                ))
            })
    }
}

/// One endpoint to probe. Immutable once its run has started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    pub url: String,
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl EndpointSpec {
    pub fn new(url: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            url: url.into(),
            method,
            headers: BTreeMap::new(),
            payload: None,
            display_name: None,
        }
    }

    /// Name shown in reports: the display name when set, otherwise the URL.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.url)
    }

    /// Serialized request body, or `None` when the method carries no body
    /// or no payload was given.
    pub fn body_bytes(&self) -> Option<Vec<u8>> {
        if !self.method.carries_body() {
            return None;
        }
        self.payload.as_ref().map(|value| value.to_string().into_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParameters {
    pub endpoints: Vec<EndpointSpec>,
    pub request_count: u32,
}

/// Run lifecycle. Transitions only move forward:
/// `pending -> running -> {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    /// A pending run may fail directly when it dies before its first probe.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = LatprobeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(LatprobeError::Validation(format!("Unknown run status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: Uuid,
    pub slug: String,
    pub parameters: RunParameters,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    /// Number of samples a completed run is expected to hold.
    pub fn expected_samples(&self) -> usize {
        self.parameters.endpoints.len() * self.parameters.request_count as usize
    }
}

/// The recorded outcome of one probe. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub run_id: Uuid,
    pub endpoint_url: String,
    pub method: HttpMethod,
    /// 1-based position within the endpoint's probe sequence.
    pub request_number: u32,
    pub latency_ms: f64,
    pub request_size_bytes: u64,
    pub response_size_bytes: u64,
    /// HTTP status, or 0 when no response arrived (network failure or timeout).
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Sample {
    /// Returns `true` for network failures, timeouts and 4xx/5xx responses.
    pub fn is_error(&self) -> bool {
        self.status_code == 0 || self.status_code >= 400
    }
}

/// Latency statistics for one `(endpoint, method)` group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsResult {
    pub endpoint_url: String,
    pub method: HttpMethod,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub std_dev: f64,
    pub avg_payload_size: u64,
    pub request_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadBucket {
    pub label: String,
    pub min_bytes: u64,
    /// Exclusive upper bound; `None` for the open-ended last bucket.
    pub max_bytes: Option<u64>,
    pub p95: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramBucket {
    pub label: String,
    pub min_ms: f64,
    /// Exclusive upper bound; `None` for the open-ended last bucket.
    pub max_ms: Option<f64>,
    pub count: u64,
}

/// Everything derived from a run's samples at the time of the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAnalytics {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub sample_count: u64,
    pub summary: Vec<AnalyticsResult>,
    pub payload_buckets: Vec<PayloadBucket>,
    pub histogram: Vec<HistogramBucket>,
}

/// Body returned by `POST /runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunResponse {
    pub id: Uuid,
    pub slug: String,
    pub status: RunStatus,
}
