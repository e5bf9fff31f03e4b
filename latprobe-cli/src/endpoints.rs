use crate::CliError;
use latprobe_common::{EndpointSpec, HttpMethod, RunParameters};
use latprobe_server::validation::validate_parameters;
use std::collections::BTreeMap;

/// Split a `NAME:VALUE` header argument. Whitespace around both parts is dropped.
pub fn parse_header(arg: &str) -> Result<(String, String), CliError> {
    let (name, value) = arg
        .split_once(':')
        .ok_or_else(|| CliError::InvalidHeader(arg.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(CliError::InvalidHeader(arg.to_string()));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Build run parameters for the same method, headers and body against every
/// URL, checked against the same bounds the server enforces.
pub fn build_parameters(
    urls: &[String],
    method: HttpMethod,
    headers: &[String],
    body: Option<&str>,
    request_count: u32,
) -> Result<RunParameters, CliError> {
    let headers: BTreeMap<String, String> =
        headers.iter().map(|h| parse_header(h)).collect::<Result<_, _>>()?;
    let payload = body
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .map_err(|err| CliError::InvalidBody(err.to_string()))?;

    let endpoints = urls
        .iter()
        .map(|url| EndpointSpec {
            headers: headers.clone(),
            payload: payload.clone(),
            ..EndpointSpec::new(url.clone(), method)
        })
        .collect();
    let parameters = RunParameters { endpoints, request_count };
    validate_parameters(&parameters)?;
    Ok(parameters)
}
