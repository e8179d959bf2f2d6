//! Deployment module

pub mod control;
pub mod executor;
pub mod fsm;
pub mod locks;
pub mod rollback;
pub mod steps;

pub use executor::{DeploymentExecutor, ExecutorSettings, PipelineOutcome};
pub use fsm::{DeploymentEvent, DeploymentFsm, DeploymentStatus};
pub use rollback::RollbackOutcome;
