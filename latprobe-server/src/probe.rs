//! Probe executor: one timed HTTP request in, one [`Sample`] out.
//!
//! Every outcome becomes a sample. A 500 is a data point with status 500; a
//! refused connection or a timeout is a data point with status 0 and an
//! error message. Latency is always the time actually spent, so a timed-out
//! probe records roughly the timeout.

use crate::config::ProbeConfig;
use chrono::Utc;
use latprobe_common::{EndpointSpec, HttpMethod, Sample};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("Failed to build HTTP client: {0}")]
pub struct ProbeSetupError(String);

/// Why a probe produced no HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    Timeout,
    Dns,
    Connect,
    Tls,
    Body,
    InvalidRequest,
    Other,
}

impl ProbeFailure {
    /// Classify on the whole source chain. reqwest's own message only names
    /// the URL; resolver and TLS causes sit further down.
    pub fn classify(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return ProbeFailure::Timeout;
        }
        // The outermost message embeds the URL, which must not steer the match.
        let chain: Vec<String> =
            error_chain(err).skip(1).map(|e| e.to_string().to_ascii_lowercase()).collect();
        let mentions = |needles: &[&str]| chain.iter().any(|m| needles.iter().any(|n| m.contains(n)));
        if mentions(&["dns error", "failed to lookup address", "name resolution", "name or service not known"]) {
            return ProbeFailure::Dns;
        }
        if mentions(&["tls", "ssl", "certificate", "handshake"]) {
            return ProbeFailure::Tls;
        }
        if err.is_connect() {
            return ProbeFailure::Connect;
        }
        if err.is_body() || err.is_decode() {
            return ProbeFailure::Body;
        }
        if err.is_builder() {
            return ProbeFailure::InvalidRequest;
        }
        ProbeFailure::Other
    }
}

/// `err` followed by each of its sources, outermost first.
pub fn error_chain<'a>(err: &'a (dyn StdError + 'static)) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

/// The innermost error in the source chain.
pub fn root_cause<'a>(err: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    error_chain(err).last().unwrap_or(err)
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ProbeFailure::Timeout => "request timed out",
            ProbeFailure::Dns => "DNS lookup failed",
            ProbeFailure::Connect => "connection failed",
            ProbeFailure::Tls => "TLS handshake failed",
            ProbeFailure::Body => "failed to read response body",
            ProbeFailure::InvalidRequest => "invalid request",
            ProbeFailure::Other => "request failed",
        };
        f.write_str(text)
    }
}

/// Request pieces derived from an [`EndpointSpec`] before the clock starts.
enum PreparedRequest {
    Bodiless { method: Method, headers: HeaderMap },
    WithBody { method: Method, headers: HeaderMap, body: Vec<u8> },
}

impl PreparedRequest {
    fn request_size_bytes(&self) -> u64 {
        match self {
            PreparedRequest::Bodiless { .. } => 0,
            PreparedRequest::WithBody { body, .. } => body.len() as u64,
        }
    }
}

/// Issues single timed probes. Cheap to share; the inner client pools
/// connections across probes of the same run.
#[derive(Clone)]
pub struct ProbeExecutor {
    client: Client,
    timeout: Duration,
}

impl ProbeExecutor {
    pub fn new(config: &ProbeConfig) -> Result<Self, ProbeSetupError> {
        let redirect = if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = Client::builder()
            .redirect(redirect)
            .build()
            .map_err(|err| ProbeSetupError(err.to_string()))?;
        Ok(Self { client, timeout: config.timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute exactly one request against `endpoint`. Never fails: errors are
    /// recorded in the returned sample.
    pub async fn execute(&self, run_id: Uuid, endpoint: &EndpointSpec, request_number: u32) -> Sample {
        let prepared = match prepare(endpoint) {
            Ok(prepared) => prepared,
            Err(message) => {
                let request_size_bytes = endpoint.body_bytes().map_or(0, |b| b.len() as u64);
                return failed_sample(run_id, endpoint, request_number, 0.0, request_size_bytes, message);
            }
        };
        let request_size_bytes = prepared.request_size_bytes();

        let request = match prepared {
            PreparedRequest::Bodiless { method, headers } => {
                self.client.request(method, &endpoint.url).headers(headers)
            }
            PreparedRequest::WithBody { method, headers, body } => {
                self.client.request(method, &endpoint.url).headers(headers).body(body)
            }
        }
        .timeout(self.timeout);

        let started = Instant::now();
        let outcome = match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                response.bytes().await.map(|body| (status, body.len() as u64))
            }
            Err(err) => Err(err),
        };
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok((status_code, response_size_bytes)) => {
                debug!(
                    run_id = %run_id,
                    endpoint = %endpoint.url,
                    request_number,
                    status_code,
                    latency_ms,
                    "probe completed"
                );
                Sample {
                    run_id,
                    endpoint_url: endpoint.url.clone(),
                    method: endpoint.method,
                    request_number,
                    latency_ms,
                    request_size_bytes,
                    response_size_bytes,
                    status_code,
                    error_message: None,
                    created_at: Utc::now(),
                }
            }
            Err(err) => {
                let failure = ProbeFailure::classify(&err);
                let message = match failure {
                    ProbeFailure::Timeout => {
                        format!("{failure} after {} ms", self.timeout.as_millis())
                    }
                    _ => format!("{failure}: {}", root_cause(&err)),
                };
                debug!(
                    run_id = %run_id,
                    endpoint = %endpoint.url,
                    request_number,
                    latency_ms,
                    error = %message,
                    "probe failed"
                );
                failed_sample(run_id, endpoint, request_number, latency_ms, request_size_bytes, message)
            }
        }
    }
}

pub fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

pub fn build_headers(input: &BTreeMap<String, String>) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();

    for (key, value) in input {
        if key.is_empty() {
            continue;
        }

        let header_name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|err| format!("Invalid header name `{key}`: {err}"))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|err| format!("Invalid header value for `{key}`: {err}"))?;
        headers.insert(header_name, header_value);
    }

    Ok(headers)
}

fn prepare(endpoint: &EndpointSpec) -> Result<PreparedRequest, String> {
    let method = to_reqwest_method(endpoint.method);
    let mut headers = build_headers(&endpoint.headers)?;
    match endpoint.body_bytes() {
        None => Ok(PreparedRequest::Bodiless { method, headers }),
        Some(body) => {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            Ok(PreparedRequest::WithBody { method, headers, body })
        }
    }
}

fn failed_sample(
    run_id: Uuid,
    endpoint: &EndpointSpec,
    request_number: u32,
    latency_ms: f64,
    request_size_bytes: u64,
    message: String,
) -> Sample {
    Sample {
        run_id,
        endpoint_url: endpoint.url.clone(),
        method: endpoint.method,
        request_number,
        latency_ms,
        request_size_bytes,
        response_size_bytes: 0,
        status_code: 0,
        error_message: Some(message),
        created_at: Utc::now(),
    }
}
