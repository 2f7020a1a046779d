//! Bounds the number of live checker processes and serializes runs that
//! target the same project directory.

use crate::error::{AnalysisError, AnalysisOutcome};
use crate::runner::CancelToken;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// How often a waiting acquire re-checks its cancel token.
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct State {
    active: usize,
    busy_roots: HashSet<PathBuf>,
}

#[derive(Debug)]
pub struct Scheduler {
    max_concurrent: usize,
    state: Mutex<State>,
    released: Condvar,
}

/// Held while a checker runs; frees the slot and the project root on drop.
#[derive(Debug)]
pub struct Permit<'a> {
    scheduler: &'a Scheduler,
    root: PathBuf,
}

impl Scheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            state: Mutex::new(State::default()),
            released: Condvar::new(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn active(&self) -> usize {
        self.lock().active
    }

    /// Block until a slot is free and no other run holds `root`.
    pub fn acquire(&self, root: &Path, cancel: &CancelToken) -> AnalysisOutcome<Permit<'_>> {
        let mut state = self.lock();
        let mut waited = false;
        loop {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            if state.active < self.max_concurrent && !state.busy_roots.contains(root) {
                state.active += 1;
                state.busy_roots.insert(root.to_path_buf());
                if waited {
                    tracing::debug!("acquired checker slot for {}", root.display());
                }
                return Ok(Permit {
                    scheduler: self,
                    root: root.to_path_buf(),
                });
            }
            waited = true;
            state = match self.released.wait_timeout(state, WAIT_SLICE) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut state = self.scheduler.lock();
        state.active = state.active.saturating_sub(1);
        state.busy_roots.remove(&self.root);
        drop(state);
        self.scheduler.released.notify_all();
    }
}
