//! Finite state machine for a deployment record

use serde::{Deserialize, Serialize};

/// Deployment status as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Created, pipeline running
    Pending,

    /// Every stage succeeded
    Success,

    /// A stage failed; nothing ran after it
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::Pending)
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeploymentStatus::Pending),
            "success" => Ok(DeploymentStatus::Success),
            "failed" => Ok(DeploymentStatus::Failed),
            other => Err(format!("Invalid deployment status: {}", other)),
        }
    }
}

/// Pipeline event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// A stage finished successfully
    StepSucceeded(String),

    /// A stage failed with a message
    StepFailed { key: String, message: String },

    /// All stages finished
    Complete,

    /// The pipeline stopped outside a stage
    Abort(String),
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    status: DeploymentStatus,
    completed: Vec<String>,
    failed_step: Option<String>,
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            status: DeploymentStatus::Pending,
            completed: Vec::new(),
            failed_step: None,
            error: None,
        }
    }

    pub fn status(&self) -> DeploymentStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn failed_step(&self) -> Option<&str> {
        self.failed_step.as_deref()
    }

    /// Keys of the stages that succeeded, in order
    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    /// Whether another stage may still run
    pub fn accepts_steps(&self) -> bool {
        self.status == DeploymentStatus::Pending
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<(), String> {
        let new_status = match (self.status, &event) {
            (DeploymentStatus::Pending, DeploymentEvent::StepSucceeded(key)) => {
                self.completed.push(key.clone());
                DeploymentStatus::Pending
            }
            (DeploymentStatus::Pending, DeploymentEvent::StepFailed { key, message }) => {
                self.failed_step = Some(key.clone());
                self.error = Some(message.clone());
                DeploymentStatus::Failed
            }
            (DeploymentStatus::Pending, DeploymentEvent::Abort(message)) => {
                self.error = Some(message.clone());
                DeploymentStatus::Failed
            }
            (DeploymentStatus::Pending, DeploymentEvent::Complete) => DeploymentStatus::Success,

            // Terminal states accept nothing
            (status, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", status, event));
            }
        };

        self.status = new_status;
        Ok(())
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
