//! Step log recording for a running pipeline

use std::future::Future;

use tracing::{error, info, warn};

use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentStatus};
use crate::errors::{OrchestratorError, StoreError};
use crate::store::{StepRecord, Store};

/// Appends one step per stage and drives the record's state machine.
///
/// Once a stage fails no further stage runs, and the record receives exactly
/// one terminal write through [`StepRecorder::complete`] or
/// [`StepRecorder::fail`].
pub struct StepRecorder<'a> {
    store: &'a Store,
    deployment_id: i64,
    fsm: DeploymentFsm,
    steps: Vec<StepRecord>,
}

impl<'a> StepRecorder<'a> {
    pub fn new(store: &'a Store, deployment_id: i64) -> Self {
        Self {
            store,
            deployment_id,
            fsm: DeploymentFsm::new(),
            steps: Vec::new(),
        }
    }

    pub fn deployment_id(&self) -> i64 {
        self.deployment_id
    }

    pub fn status(&self) -> DeploymentStatus {
        self.fsm.status()
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<StepRecord> {
        self.steps
    }

    /// Run one stage. `work` yields the stage value and a log line.
    pub async fn step<T, F>(
        &mut self,
        key: &'static str,
        label: &'static str,
        work: F,
    ) -> Result<T, OrchestratorError>
    where
        F: Future<Output = Result<(T, String), OrchestratorError>>,
    {
        if !self.fsm.accepts_steps() {
            return Err(OrchestratorError::Internal(format!(
                "stage {} requested after deployment {} left pending",
                key, self.deployment_id
            )));
        }

        match work.await {
            Ok((value, log)) => {
                info!("[deployment {}] {} ok: {}", self.deployment_id, key, log);
                let record = self
                    .store
                    .append_step(self.deployment_id, key, label, true, Some(&log))
                    .await?;
                self.steps.push(record);
                self.fsm
                    .process(DeploymentEvent::StepSucceeded(key.to_string()))
                    .map_err(OrchestratorError::Internal)?;
                Ok(value)
            }
            Err(e) => {
                let message = e.to_string();
                warn!("[deployment {}] {} failed: {}", self.deployment_id, key, message);
                match self
                    .store
                    .append_step(self.deployment_id, key, label, false, Some(&message))
                    .await
                {
                    Ok(record) => self.steps.push(record),
                    Err(store_err) => error!(
                        "[deployment {}] could not record failed step {}: {}",
                        self.deployment_id, key, store_err
                    ),
                }
                // keep the stage error; the transition cannot fail from pending
                let _ = self.fsm.process(DeploymentEvent::StepFailed {
                    key: key.to_string(),
                    message,
                });
                Err(e)
            }
        }
    }

    /// Terminal write for a fully successful pipeline
    pub async fn complete(
        &mut self,
        release_path: &str,
        current_link: &str,
    ) -> Result<(), OrchestratorError> {
        self.fsm
            .process(DeploymentEvent::Complete)
            .map_err(OrchestratorError::Internal)?;
        self.store
            .finish_success(self.deployment_id, release_path, current_link)
            .await?;
        info!(
            "[deployment {}] success, {} -> {}",
            self.deployment_id, current_link, release_path
        );
        Ok(())
    }

    /// Terminal write for a failed pipeline
    pub async fn fail(&mut self, error: &OrchestratorError) -> Result<(), StoreError> {
        let message = error.to_string();
        if self.fsm.accepts_steps() {
            let _ = self.fsm.process(DeploymentEvent::Abort(message.clone()));
        }
        let message = self.fsm.error().unwrap_or(&message).to_string();
        self.store.finish_failed(self.deployment_id, &message).await?;
        info!("[deployment {}] failed: {}", self.deployment_id, message);
        Ok(())
    }
}
