//! Durable home for runs and their samples.
//!
//! The engine only talks to [`RunStore`]; [`MemoryStore`] backs tests and
//! single-shot CLI runs, [`SqliteStore`] backs the long-lived server.

use chrono::{DateTime, Utc};
use latprobe_common::{Run, RunParameters, RunStatus, Sample, SLUG_LEN};
use rand::Rng;
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

const SLUG_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot serve requests at all.
    #[error("Run store unavailable: {0}")]
    Unavailable(String),

    #[error("Run store write failed: {0}")]
    Write(String),

    #[error("Run not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid status transition for run {run_id}: {from} -> {to}")]
    InvalidTransition { run_id: Uuid, from: RunStatus, to: RunStatus },

    #[error("Could not allocate a unique slug after {0} attempts")]
    SlugExhausted(usize),

    #[error("Stored data is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Structural failures that should abort a run rather than drop one sample.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::NotFound(_))
    }
}

pub trait RunStore: Send + Sync {
    /// Persist a new `pending` run with a fresh id and slug.
    fn create_run(&self, parameters: RunParameters) -> Result<Run, StoreError>;

    /// Move a run forward. Sets `started_at` on `running` and `completed_at`
    /// on either terminal state.
    fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<Run, StoreError>;

    /// Append one sample. Fails with `NotFound` for an unknown run.
    fn append_sample(&self, sample: &Sample) -> Result<(), StoreError>;

    fn get_run_by_id(&self, run_id: Uuid) -> Result<Option<Run>, StoreError>;

    fn get_run_by_slug(&self, slug: &str) -> Result<Option<Run>, StoreError>;

    /// Samples in creation order, optionally restricted to one endpoint URL.
    fn list_samples(&self, run_id: Uuid, endpoint: Option<&str>) -> Result<Vec<Sample>, StoreError>;

    /// Most recently created runs first.
    fn list_recent_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError>;

    /// Remove a run and all of its samples. Returns `false` if it did not exist.
    fn delete_run(&self, run_id: Uuid) -> Result<bool, StoreError>;
}

/// Draw a random lowercase alphanumeric slug of `SLUG_LEN` characters.
pub fn generate_slug(rng: &mut impl Rng) -> String {
    (0..SLUG_LEN)
        .map(|_| SLUG_ALPHABET[rng.gen_range(0..SLUG_ALPHABET.len())] as char)
        .collect()
}

pub(crate) fn new_pending_run(parameters: RunParameters, slug: String) -> Run {
    Run {
        id: Uuid::new_v4(),
        slug,
        parameters,
        status: RunStatus::Pending,
        started_at: None,
        completed_at: None,
        created_at: Utc::now(),
    }
}

/// Apply a status change to an in-memory `Run`, enforcing forward-only moves.
pub(crate) fn apply_status(run: &mut Run, status: RunStatus, at: DateTime<Utc>) -> Result<(), StoreError> {
    if !run.status.can_transition_to(status) {
        return Err(StoreError::InvalidTransition { run_id: run.id, from: run.status, to: status });
    }
    run.status = status;
    if status == RunStatus::Running {
        run.started_at = Some(at);
    }
    if status.is_terminal() {
        run.completed_at = Some(at);
    }
    Ok(())
}
