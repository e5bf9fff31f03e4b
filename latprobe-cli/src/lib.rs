pub mod compare;
pub mod endpoints;
pub mod report;
pub mod target;
pub mod verdict;

use latprobe_server::validation::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid header {0:?}; expected NAME:VALUE")]
    InvalidHeader(String),

    #[error("Invalid JSON body: {0}")]
    InvalidBody(String),

    #[error(transparent)]
    InvalidParameters(#[from] ValidationError),

    #[error("--timeout-ms cannot be combined with --server; the server applies its own timeout")]
    TimeoutWithServer,

    #[error("Failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to write {path}: {reason}")]
    Write { path: String, reason: String },
}
