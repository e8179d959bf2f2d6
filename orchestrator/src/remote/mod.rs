//! Remote execution: structured commands, sessions and reachability probes

pub mod command;
pub mod credential;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod probe;
pub mod session;
pub mod ssh;

pub use command::{CommandOutput, RemoteCommand};
pub use session::{ConnectParams, Credential, RemoteConnector, RemoteSession};
