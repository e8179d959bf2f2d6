//! Shipwright
//!
//! Deployment orchestrator: pushes packaged releases to remote Linux hosts
//! over SSH, activates them through a `current` symlink, supervises the
//! application process and keeps an append-only deployment history.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod release;
pub mod remote;
pub mod server;
pub mod storage;
pub mod store;
pub mod supervisor;
pub mod utils;
pub mod vault;
