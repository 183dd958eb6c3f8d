//! Apply coordinator
//!
//! Owns the single [`FilterSink`] behind a mutex. Every purge-and-rebuild
//! sequence runs inside [`ApplyCoordinator::mutate_and_commit`], so at most
//! one rule-table mutation is in flight process-wide. Compilation happens
//! before the lock is taken; only local sink calls run inside it.

use crate::core::error::{Error, Result};
use crate::core::sink::FilterSink;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error};

pub struct ApplyCoordinator {
    sink: Mutex<Box<dyn FilterSink>>,
}

impl std::fmt::Debug for ApplyCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyCoordinator").finish_non_exhaustive()
    }
}

impl ApplyCoordinator {
    pub fn new(sink: Box<dyn FilterSink>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn FilterSink>>> {
        self.sink
            .lock()
            .map_err(|_| Error::Internal("rule table lock poisoned".to_string()))
    }

    /// Stages mutations without committing.
    ///
    /// If `f` fails, the staged tables are restored to what they were before.
    pub fn mutate<T>(&self, f: impl FnOnce(&mut dyn FilterSink) -> Result<T>) -> Result<T> {
        let mut sink = self.lock()?;
        let before = sink.staging().clone();
        f(&mut **sink).inspect_err(|_| {
            *sink.staging_mut() = before;
        })
    }

    /// Stages mutations and commits them in the same critical section.
    ///
    /// `committed` runs after a successful commit, still under the lock, so
    /// bookkeeping that mirrors the staged tables changes together with them.
    /// On any failure, staging or commit, the staged tables are rolled back so
    /// a later commit cannot push a half-applied sequence, and `committed`
    /// never runs.
    pub fn mutate_and_commit<T>(
        &self,
        f: impl FnOnce(&mut dyn FilterSink) -> Result<T>,
        committed: impl FnOnce(&T),
    ) -> Result<T> {
        let mut sink = self.lock()?;
        let before = sink.staging().clone();

        let result = f(&mut **sink).and_then(|value| sink.commit().map(|()| value));
        match &result {
            Ok(value) => committed(value),
            Err(e) => {
                error!("Rule table mutation failed, rolling back staged changes: {e}");
                *sink.staging_mut() = before;
            }
        }
        result
    }

    pub fn commit(&self) -> Result<()> {
        self.lock()?.commit()
    }

    pub fn begin_deferred(&self) -> Result<()> {
        debug!("Beginning deferred apply");
        self.lock()?.begin_deferred_apply();
        Ok(())
    }

    pub fn end_deferred(&self) -> Result<()> {
        debug!("Ending deferred apply");
        self.lock()?.end_deferred_apply_and_commit()
    }

    /// Read-only access to the sink's staged state
    pub fn inspect<T>(&self, f: impl FnOnce(&dyn FilterSink) -> T) -> Result<T> {
        let sink = self.lock()?;
        Ok(f(&**sink))
    }
}
