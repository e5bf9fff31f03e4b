use super::{apply_status, generate_slug, new_pending_run, RunStore, StoreError};
use crate::config::SLUG_ATTEMPTS;
use chrono::{DateTime, Utc};
use latprobe_common::{Run, RunParameters, RunStatus, Sample};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    runs: HashMap<Uuid, Run>,
    slugs: HashMap<String, Uuid>,
    /// Run ids in creation order.
    order: Vec<Uuid>,
    samples: HashMap<Uuid, Vec<Sample>>,
}

/// Process-local store. Samples are partitioned by run id.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl RunStore for MemoryStore {
    fn create_run(&self, parameters: RunParameters) -> Result<Run, StoreError> {
        let mut state = self.write()?;
        let mut rng = rand::thread_rng();
        let slug = (0..SLUG_ATTEMPTS)
            .map(|_| generate_slug(&mut rng))
            .find(|slug| !state.slugs.contains_key(slug))
            .ok_or(StoreError::SlugExhausted(SLUG_ATTEMPTS))?;

        let run = new_pending_run(parameters, slug);
        state.slugs.insert(run.slug.clone(), run.id);
        state.order.push(run.id);
        state.samples.insert(run.id, Vec::new());
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<Run, StoreError> {
        let mut state = self.write()?;
        let run = state.runs.get_mut(&run_id).ok_or(StoreError::NotFound(run_id))?;
        apply_status(run, status, at)?;
        Ok(run.clone())
    }

    fn append_sample(&self, sample: &Sample) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let samples = state
            .samples
            .get_mut(&sample.run_id)
            .ok_or(StoreError::NotFound(sample.run_id))?;
        samples.push(sample.clone());
        Ok(())
    }

    fn get_run_by_id(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        Ok(self.read()?.runs.get(&run_id).cloned())
    }

    fn get_run_by_slug(&self, slug: &str) -> Result<Option<Run>, StoreError> {
        let state = self.read()?;
        Ok(state.slugs.get(slug).and_then(|id| state.runs.get(id)).cloned())
    }

    fn list_samples(&self, run_id: Uuid, endpoint: Option<&str>) -> Result<Vec<Sample>, StoreError> {
        let state = self.read()?;
        let Some(samples) = state.samples.get(&run_id) else {
            return Ok(Vec::new());
        };
        Ok(samples
            .iter()
            .filter(|s| endpoint.map_or(true, |url| s.endpoint_url == url))
            .cloned()
            .collect())
    }

    fn list_recent_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let state = self.read()?;
        Ok(state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.runs.get(id))
            .take(limit)
            .cloned()
            .collect())
    }

    fn delete_run(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let Some(run) = state.runs.remove(&run_id) else {
            return Ok(false);
        };
        state.slugs.remove(&run.slug);
        state.order.retain(|id| *id != run_id);
        state.samples.remove(&run_id);
        Ok(true)
    }
}
