//! Remote session seam

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;

use crate::errors::{CommandError, ConnectError, TransferError};
use crate::remote::command::{CommandOutput, RemoteCommand};

/// Secret used to authenticate a session
pub enum Credential {
    Password(SecretString),
    PrivateKey {
        key: SecretString,
        passphrase: Option<SecretString>,
    },
}

impl Credential {
    /// Reject blank secrets before any network traffic
    pub fn validate(&self) -> Result<(), ConnectError> {
        match self {
            Credential::Password(p) if p.expose_secret().is_empty() => Err(
                ConnectError::InvalidCredential("password is empty".to_string()),
            ),
            Credential::PrivateKey { key, .. } if key.expose_secret().trim().is_empty() => Err(
                ConnectError::InvalidCredential("private key is empty".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Independent copy for moving into a blocking task
    pub fn duplicate(&self) -> Credential {
        let copy = |s: &SecretString| SecretString::from(s.expose_secret().to_string());
        match self {
            Credential::Password(p) => Credential::Password(copy(p)),
            Credential::PrivateKey { key, passphrase } => Credential::PrivateKey {
                key: copy(key),
                passphrase: passphrase.as_ref().map(copy),
            },
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::PrivateKey { .. } => "key",
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential({}, [REDACTED])", self.mode())
    }
}

/// Everything needed to open a session
#[derive(Debug)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: Credential,
    pub timeout: Duration,
}

/// An authenticated shell session on one host
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn host(&self) -> &str;

    /// Run a command and capture its output; non-zero exits are not errors here
    async fn run(&self, command: &RemoteCommand) -> Result<CommandOutput, CommandError>;

    /// Copy a local file to `remote_path`, returning the bytes written
    async fn put_file(&self, local_path: &Path, remote_path: &str) -> Result<u64, TransferError>;

    /// Forward command output in chunks until the receiver hangs up, the command
    /// ends or `window` elapses
    async fn stream(
        &self,
        command: &RemoteCommand,
        sink: mpsc::Sender<String>,
        window: Duration,
    ) -> Result<(), CommandError>;

    async fn close(&self);

    /// Run a command and fail on a non-zero exit
    async fn run_checked(&self, command: &RemoteCommand) -> Result<CommandOutput, CommandError> {
        self.run(command).await?.check(command)
    }
}

/// Opens remote sessions
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn RemoteSession>, ConnectError>;
}
