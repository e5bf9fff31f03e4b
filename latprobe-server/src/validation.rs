use latprobe_common::{
    LatprobeError, RunParameters, MAX_ENDPOINTS, MAX_REQUEST_COUNT, MIN_REQUEST_COUNT,
};
use reqwest::Url;
use thiserror::Error;

use crate::probe::build_headers;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("At least one endpoint is required")]
    NoEndpoints,

    #[error("At most {max} endpoints are allowed, got {got}")]
    TooManyEndpoints { got: usize, max: usize },

    #[error("requestCount must be between {min} and {max}, got {got}")]
    RequestCountOutOfRange { got: u32, min: u32, max: u32 },

    #[error("Invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid headers for {url:?}: {reason}")]
    InvalidHeaders { url: String, reason: String },
}

impl From<ValidationError> for LatprobeError {
    fn from(err: ValidationError) -> Self {
        LatprobeError::Validation(err.to_string())
    }
}

/// Check run parameters before anything is created. The method whitelist is
/// enforced by [`latprobe_common::HttpMethod`] itself.
pub fn validate_parameters(parameters: &RunParameters) -> Result<(), ValidationError> {
    if parameters.endpoints.is_empty() {
        return Err(ValidationError::NoEndpoints);
    }
    if parameters.endpoints.len() > MAX_ENDPOINTS {
        return Err(ValidationError::TooManyEndpoints {
            got: parameters.endpoints.len(),
            max: MAX_ENDPOINTS,
        });
    }
    if !(MIN_REQUEST_COUNT..=MAX_REQUEST_COUNT).contains(&parameters.request_count) {
        return Err(ValidationError::RequestCountOutOfRange {
            got: parameters.request_count,
            min: MIN_REQUEST_COUNT,
            max: MAX_REQUEST_COUNT,
        });
    }
    for endpoint in &parameters.endpoints {
        validate_url(&endpoint.url)?;
        build_headers(&endpoint.headers).map_err(|reason| ValidationError::InvalidHeaders {
            url: endpoint.url.clone(),
            reason,
        })?;
    }
    Ok(())
}

/// Accepts absolute `http`/`https` URLs with a host.
pub fn validate_url(url: &str) -> Result<Url, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidUrl { url: url.to_string(), reason };
    let parsed = Url::parse(url).map_err(|err| invalid(err.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme `{}`", parsed.scheme())));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(parsed)
}
