//! Run controller: drives a run through `pending -> running -> completed|failed`.
//!
//! Endpoints are probed in the order given, and each endpoint's probes run
//! strictly one after another. A probe never starts before the previous
//! probe's latency has been measured. Each sample is written as soon as it
//! exists so partial results can be polled while the run is in flight.

use crate::config::EVENT_CHANNEL_CAPACITY;
use crate::probe::ProbeExecutor;
use crate::store::{RunStore, StoreError};
use crate::validation::{validate_parameters, ValidationError};
use chrono::Utc;
use latprobe_common::{Run, RunParameters, RunStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Run task aborted: {0}")]
    Aborted(String),
}

/// Progress notification emitted after every probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeEvent {
    pub run_id: Uuid,
    pub endpoint_url: String,
    pub request_number: u32,
    pub request_count: u32,
    pub status_code: u16,
    pub latency_ms: f64,
}

/// A run in flight. `done` flips to `true` once the run's final status is stored.
struct RunTask {
    handle: JoinHandle<()>,
    done: watch::Receiver<bool>,
}

type TaskMap = Arc<Mutex<HashMap<Uuid, RunTask>>>;

#[derive(Clone)]
pub struct RunController {
    store: Arc<dyn RunStore>,
    executor: ProbeExecutor,
    tasks: TaskMap,
    events: broadcast::Sender<ProbeEvent>,
}

impl RunController {
    pub fn new(store: Arc<dyn RunStore>, executor: ProbeExecutor) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            executor,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Receive a [`ProbeEvent`] per probe of every run this controller drives.
    pub fn subscribe(&self) -> broadcast::Receiver<ProbeEvent> {
        self.events.subscribe()
    }

    /// Validate `parameters`, persist a pending run and start it in the
    /// background. Returns as soon as the run exists; the run keeps going even
    /// if nobody ever asks for its results.
    pub fn start_run(&self, parameters: RunParameters) -> Result<Run, RunError> {
        validate_parameters(&parameters)?;
        let run = self.store.create_run(parameters)?;
        info!(run_id = %run.id, slug = %run.slug, "run created");

        let (done_tx, done) = watch::channel(false);
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let handle = tokio::spawn(supervise(
            self.store.clone(),
            self.executor.clone(),
            self.events.clone(),
            self.tasks.clone(),
            done_tx,
            run.clone(),
        ));
        tasks.insert(run.id, RunTask { handle, done });
        Ok(run)
    }

    /// Wait for a run started by this controller to reach a terminal state and
    /// return its final record. Runs that already finished resolve immediately.
    /// Any number of callers may wait on the same run.
    pub async fn wait(&self, run_id: Uuid) -> Result<Option<Run>, RunError> {
        let done = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&run_id)
            .map(|task| task.done.clone());
        if let Some(mut done) = done {
            done.wait_for(|finished| *finished)
                .await
                .map_err(|_| RunError::Aborted(format!("supervisor for run {run_id} went away")))?;
        }
        Ok(self.store.get_run_by_id(run_id)?)
    }

    /// Number of runs still executing.
    pub fn active_runs(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| tasks.values().filter(|task| !task.handle.is_finished()).count())
            .unwrap_or(0)
    }
}

/// Owns the worker task for one run. Any failure that escapes the worker,
/// panics included, is recorded as a `failed` run.
async fn supervise(
    store: Arc<dyn RunStore>,
    executor: ProbeExecutor,
    events: broadcast::Sender<ProbeEvent>,
    tasks: TaskMap,
    done: watch::Sender<bool>,
    run: Run,
) {
    let run_id = run.id;
    let worker_store = store.clone();
    let worker = tokio::spawn(async move {
        execute_run(worker_store.as_ref(), &executor, &events, &run).await
    });

    let outcome = match worker.await {
        Ok(result) => result,
        Err(join_err) => Err(RunError::Aborted(join_err.to_string())),
    };

    if let Err(err) = outcome {
        error!(run_id = %run_id, error = %err, "run failed");
        if let Err(mark_err) = store.update_run_status(run_id, RunStatus::Failed, Utc::now()) {
            error!(run_id = %run_id, error = %mark_err, "could not mark run as failed");
        }
    }

    tasks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&run_id);
    done.send_replace(true);
}

/// Probe every endpoint of `run` in order and record each sample.
///
/// Individual sample writes that fail for non-structural reasons are logged
/// and skipped. A structural store failure ends the run with an error, which
/// the caller turns into `failed`.
pub async fn execute_run(
    store: &dyn RunStore,
    executor: &ProbeExecutor,
    events: &broadcast::Sender<ProbeEvent>,
    run: &Run,
) -> Result<(), RunError> {
    store.update_run_status(run.id, RunStatus::Running, Utc::now())?;
    info!(
        run_id = %run.id,
        endpoints = run.parameters.endpoints.len(),
        request_count = run.parameters.request_count,
        "run started"
    );

    let request_count = run.parameters.request_count;
    let mut dropped = 0u64;
    for endpoint in &run.parameters.endpoints {
        for request_number in 1..=request_count {
            let sample = executor.execute(run.id, endpoint, request_number).await;

            // No subscribers is fine.
            let _ = events.send(ProbeEvent {
                run_id: run.id,
                endpoint_url: sample.endpoint_url.clone(),
                request_number,
                request_count,
                status_code: sample.status_code,
                latency_ms: sample.latency_ms,
            });

            match store.append_sample(&sample) {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    dropped += 1;
                    warn!(
                        run_id = %run.id,
                        endpoint = %endpoint.url,
                        request_number,
                        error = %err,
                        "sample write failed; continuing"
                    );
                }
            }
        }
    }

    store.update_run_status(run.id, RunStatus::Completed, Utc::now())?;
    info!(run_id = %run.id, dropped_samples = dropped, "run completed");
    Ok(())
}
