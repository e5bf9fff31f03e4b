use latprobe_common::{
    CreateRunResponse, ErrorResponse, LatprobeError, Result, Run, RunAnalytics, RunParameters, RunStatus,
    Sample,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use uuid::Uuid;

/// Latprobe client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address as `host:port`.
    pub server_addr: String,
}

/// Latprobe API client
pub struct Client {
    pub config: ClientConfig,
    http_client: reqwest::Client,
}

impl Client {
    /// Create a new client with the given configuration
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
        }
    }

    /// Build the URL for an API path against the configured server.
    pub fn build_url(&self, path: &str) -> String {
        format!("http://{}{}", self.config.server_addr, path)
    }

    /// Submit a run. Returns as soon as the server has accepted it.
    pub async fn create_run(&self, parameters: &RunParameters) -> Result<CreateRunResponse> {
        let response = self
            .http_client
            .post(self.build_url("/runs"))
            .json(parameters)
            .send()
            .await
            .map_err(|e| LatprobeError::NetworkError(e.to_string()))?;
        decode(response, "").await
    }

    pub async fn get_run(&self, id: Uuid) -> Result<Run> {
        self.get_json(&format!("/runs/{id}"), &id.to_string()).await
    }

    /// Resolve a shareable slug to its run.
    pub async fn get_run_by_slug(&self, slug: &str) -> Result<Run> {
        self.get_json(&format!("/r/{slug}"), slug).await
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<Run>> {
        let path = match limit {
            Some(limit) => format!("/runs?limit={limit}"),
            None => "/runs".to_string(),
        };
        self.get_json(&path, "").await
    }

    /// Samples recorded so far, optionally for one endpoint URL only.
    pub async fn list_samples(&self, id: Uuid, endpoint: Option<&str>) -> Result<Vec<Sample>> {
        self.get_with_endpoint(&format!("/runs/{id}/samples"), id, endpoint).await
    }

    pub async fn get_analytics(&self, id: Uuid, endpoint: Option<&str>) -> Result<RunAnalytics> {
        self.get_with_endpoint(&format!("/runs/{id}/analytics"), id, endpoint).await
    }

    /// Poll a run until it reaches a terminal state.
    /// A `failed` run is returned as `RunFailed`; running out of time as `Timeout`.
    pub async fn wait_for_completion(&self, id: Uuid, poll_interval: Duration, timeout: Duration) -> Result<Run> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.get_run(id).await?;
            match run.status {
                RunStatus::Completed => return Ok(run),
                RunStatus::Failed => return Err(LatprobeError::RunFailed(run.slug)),
                RunStatus::Pending | RunStatus::Running => {}
            }
            if tokio::time::Instant::now() + poll_interval > deadline {
                return Err(LatprobeError::Timeout(id.to_string()));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn get_with_endpoint<T: DeserializeOwned>(
        &self,
        path: &str,
        id: Uuid,
        endpoint: Option<&str>,
    ) -> Result<T> {
        let mut request = self.http_client.get(self.build_url(path));
        if let Some(endpoint) = endpoint {
            request = request.query(&[("endpoint", endpoint)]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| LatprobeError::NetworkError(e.to_string()))?;
        decode(response, &id.to_string()).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, run_ref: &str) -> Result<T> {
        let response = self
            .http_client
            .get(self.build_url(path))
            .send()
            .await
            .map_err(|e| LatprobeError::NetworkError(e.to_string()))?;
        decode(response, run_ref).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response, run_ref: &str) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(parse_error_response(status, run_ref, response).await);
    }
    response
        .json::<T>()
        .await
        .map_err(|e| LatprobeError::NetworkError(format!("Invalid response body: {e}")))
}

async fn parse_error_response(
    status: reqwest::StatusCode,
    run_ref: &str,
    response: reqwest::Response,
) -> LatprobeError {
    if status == reqwest::StatusCode::NOT_FOUND {
        return LatprobeError::RunNotFound(run_ref.to_string());
    }

    let retry_header = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let body = response.json::<ErrorResponse>().await.ok();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = retry_header
            .or_else(|| body.as_ref().and_then(|b| b.retry_after_secs))
            .unwrap_or(0);
        return LatprobeError::RateLimited { retry_after_secs };
    }

    let error_msg = body
        .map(|r| r.error)
        .unwrap_or_else(|| format!("Server returned status: {}", status));

    if status == reqwest::StatusCode::BAD_REQUEST {
        return LatprobeError::Validation(error_msg);
    }
    LatprobeError::HttpError(status.as_u16(), error_msg)
}
