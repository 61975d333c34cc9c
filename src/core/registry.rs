use crate::core::error::{PipelineError, Result};
use crate::core::state::{Run, RunId};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

struct RunSlot {
    run: Arc<Mutex<Run>>,
    snapshot: Arc<RwLock<Run>>,
}

/// In-memory home of every live run.
///
/// Mutation goes through [`RunRegistry::lock`], which hands out at most one
/// guard per run id at a time. Readers use [`RunRegistry::get`] and see the
/// last published snapshot without waiting on an in-flight operation.
#[derive(Default)]
pub struct RunRegistry {
    slots: RwLock<HashMap<RunId, Arc<RunSlot>>>,
}

/// Exclusive access to one run. Publishes its value to readers on every
/// [`RunGuard::set`] and again when dropped.
pub struct RunGuard {
    guard: OwnedMutexGuard<Run>,
    snapshot: Arc<RwLock<Run>>,
}

impl RunGuard {
    pub fn set(&mut self, run: Run) {
        *self.guard = run;
        self.publish();
    }

    pub fn publish(&self) {
        let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *snap = self.guard.clone();
    }
}

impl Deref for RunGuard {
    type Target = Run;

    fn deref(&self) -> &Run {
        &self.guard
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.publish();
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &str) -> Option<Arc<RunSlot>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.get(id).cloned()
    }

    /// Inserts a run, or replaces the value of an existing one once any
    /// in-flight operation on it has finished.
    pub async fn put(&self, run: Run) {
        if let Some(slot) = self.slot(&run.id) {
            let guard = slot.run.clone().lock_owned().await;
            let mut guard = RunGuard {
                guard,
                snapshot: slot.snapshot.clone(),
            };
            guard.set(run);
            return;
        }

        let id = run.id.clone();
        let slot = Arc::new(RunSlot {
            snapshot: Arc::new(RwLock::new(run.clone())),
            run: Arc::new(Mutex::new(run)),
        });
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.entry(id).or_insert(slot);
    }

    /// Latest published state of a run.
    pub fn get(&self, id: &str) -> Result<Run> {
        let slot = self
            .slot(id)
            .ok_or_else(|| PipelineError::not_found("run", id))?;
        let snap = slot.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Ok(snap.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slot(id).is_some()
    }

    /// Waits for exclusive access to a run.
    pub async fn lock(&self, id: &str) -> Result<RunGuard> {
        let slot = self
            .slot(id)
            .ok_or_else(|| PipelineError::not_found("run", id))?;
        let guard = slot.run.clone().lock_owned().await;
        Ok(RunGuard {
            guard,
            snapshot: slot.snapshot.clone(),
        })
    }

    pub fn remove(&self, id: &str) -> Option<Run> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.remove(id).map(|slot| {
            let snap = slot.snapshot.read().unwrap_or_else(|e| e.into_inner());
            snap.clone()
        })
    }
}
