//! Per-target serialization of pipelines

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::errors::OrchestratorError;

/// One async mutex per target id. A deploy or rollback holds its target's
/// guard from before the record is created until it is finalized.
#[derive(Debug, Default)]
pub struct TargetLocks {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held while a pipeline owns a target
pub type TargetGuard = OwnedMutexGuard<()>;

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `wait` for the target; [`OrchestratorError::TargetBusy`] after
    pub async fn acquire(&self, target_id: i64, wait: Duration) -> Result<TargetGuard, OrchestratorError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(target_id).or_default().clone()
        };

        match tokio::time::timeout(wait, lock.lock_owned()).await {
            Ok(guard) => {
                debug!("Acquired lock for target {}", target_id);
                Ok(guard)
            }
            Err(_) => Err(OrchestratorError::TargetBusy(target_id)),
        }
    }

    /// Whether a pipeline currently holds the target
    pub fn is_locked(&self, target_id: i64) -> bool {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .get(&target_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}
