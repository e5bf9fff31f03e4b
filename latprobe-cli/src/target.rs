use crate::CliError;
use latprobe_server::config::DEFAULT_TIMEOUT_MS;
use std::time::Duration;

/// Slack on top of the worst-case run duration before a remote wait gives up.
pub const WAIT_SLACK: Duration = Duration::from_secs(30);

/// Where the probes of a `run` execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// In this process, with the given per-request timeout.
    Local { timeout: Duration },
    /// On a latprobe server, which applies its own per-request timeout.
    Remote { server: String },
}

/// Pick the target from `--server` and `--timeout-ms`. A remote server
/// probes with its own configured timeout, so asking for a different one is
/// refused rather than ignored.
pub fn resolve_target(server: Option<&str>, timeout_ms: Option<u64>) -> Result<Target, CliError> {
    match (server, timeout_ms) {
        (Some(_), Some(_)) => Err(CliError::TimeoutWithServer),
        (Some(server), None) => Ok(Target::Remote { server: server.to_string() }),
        (None, timeout_ms) => Ok(Target::Local {
            timeout: Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)),
        }),
    }
}

/// How long to poll a remote run of `probes` requests, assuming the server
/// uses the default per-request timeout.
pub fn remote_wait_deadline(probes: u64) -> Duration {
    let probes = u32::try_from(probes).unwrap_or(u32::MAX);
    Duration::from_millis(DEFAULT_TIMEOUT_MS)
        .saturating_mul(probes)
        .saturating_add(WAIT_SLACK)
}
