//! libssh2-backed sessions
//!
//! libssh2 is blocking, so every call runs on the blocking pool and is bounded
//! twice: by libssh2's own session timeout and by a tokio timeout around the
//! task. A call that overruns tears the session down.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::ExposeSecret;
use ssh2::{ErrorCode, RenameFlags, Session};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::app::options::RemoteOptions;
use crate::errors::{CommandError, ConnectError, TransferError};
use crate::remote::command::{check_path, CommandOutput, RemoteCommand};
use crate::remote::session::{ConnectParams, Credential, RemoteConnector, RemoteSession};

const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Opens real SSH sessions
#[derive(Debug, Clone)]
pub struct SshConnector {
    options: RemoteOptions,
}

impl SshConnector {
    pub fn new(options: RemoteOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn RemoteSession>, ConnectError> {
        params.credential.validate()?;

        let host = params.host.clone();
        let port = params.port;
        let user = params.user.clone();
        let credential = params.credential.duplicate();
        let timeout = params.timeout;

        debug!("Connecting to {}@{}:{} ({})", user, host, port, credential.mode());
        let task = {
            let host = host.clone();
            tokio::task::spawn_blocking(move || open_session(&host, port, &user, &credential, timeout))
        };

        // small grace so libssh2 gets to report its own timeout first
        let session = match tokio::time::timeout(timeout + Duration::from_secs(1), task).await {
            Err(_) => return Err(ConnectError::Timeout { host }),
            Ok(Err(e)) => {
                return Err(ConnectError::Unreachable {
                    host,
                    reason: e.to_string(),
                })
            }
            Ok(Ok(result)) => result?,
        };

        session.set_timeout(duration_ms(self.options.command_timeout));
        Ok(Box::new(SshSession {
            host,
            session,
            command_timeout: self.options.command_timeout,
            transfer_timeout: self.options.transfer_timeout,
        }))
    }
}

fn duration_ms(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

fn is_timeout(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT))
}

fn open_session(
    host: &str,
    port: u16,
    user: &str,
    credential: &Credential,
    timeout: Duration,
) -> Result<Session, ConnectError> {
    let unreachable = |reason: String| ConnectError::Unreachable {
        host: host.to_string(),
        reason,
    };

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| unreachable(e.to_string()))?
        .next()
        .ok_or_else(|| unreachable("host did not resolve".to_string()))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ConnectError::Timeout {
            host: host.to_string(),
        },
        _ => unreachable(e.to_string()),
    })?;

    let mut session = Session::new().map_err(|e| unreachable(e.to_string()))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(duration_ms(timeout));
    session.handshake().map_err(|e| {
        if is_timeout(&e) {
            ConnectError::Timeout {
                host: host.to_string(),
            }
        } else {
            unreachable(format!("handshake failed: {}", e))
        }
    })?;

    let auth = match credential {
        Credential::Password(password) => session.userauth_password(user, password.expose_secret()),
        Credential::PrivateKey { key, passphrase } => session.userauth_pubkey_memory(
            user,
            None,
            key.expose_secret(),
            passphrase.as_ref().map(|p| p.expose_secret()),
        ),
    };
    auth.map_err(|e| {
        if is_timeout(&e) {
            ConnectError::Timeout {
                host: host.to_string(),
            }
        } else {
            ConnectError::AuthFailed {
                host: host.to_string(),
                reason: e.message().to_string(),
            }
        }
    })?;

    if !session.authenticated() {
        return Err(ConnectError::AuthFailed {
            host: host.to_string(),
            reason: "server did not accept the credential".to_string(),
        });
    }
    Ok(session)
}

/// One live SSH session
pub struct SshSession {
    host: String,
    session: Session,
    command_timeout: Duration,
    transfer_timeout: Duration,
}

impl SshSession {
    fn teardown(&self, reason: &'static str) {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || {
            let _ = session.disconnect(None, reason, None);
        });
    }
}

fn exec_blocking(session: &Session, command: &str) -> Result<CommandOutput, CommandError> {
    let channel_err = |e: ssh2::Error| {
        if is_timeout(&e) {
            CommandError::Timeout {
                command: command.to_string(),
                secs: 0,
            }
        } else {
            CommandError::Channel(e.to_string())
        }
    };

    let mut channel = session.channel_session().map_err(channel_err)?;
    channel.exec(command).map_err(channel_err)?;

    let mut stdout = Vec::new();
    channel
        .read_to_end(&mut stdout)
        .map_err(|e| CommandError::Channel(e.to_string()))?;
    let mut stderr = Vec::new();
    channel
        .stderr()
        .read_to_end(&mut stderr)
        .map_err(|e| CommandError::Channel(e.to_string()))?;

    channel.wait_close().map_err(channel_err)?;
    let exit_code = channel.exit_status().map_err(channel_err)?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    })
}

fn upload_blocking(session: &Session, local: &Path, remote: &str) -> Result<u64, TransferError> {
    let upload_err = |e: ssh2::Error| TransferError::Upload(e.to_string());

    let sftp = session.sftp().map_err(upload_err)?;
    let part = PathBuf::from(format!("{}.part", remote));
    let mut source = std::fs::File::open(local)
        .map_err(|e| TransferError::Source(format!("{}: {}", local.display(), e)))?;

    let mut dest = sftp.create(&part).map_err(upload_err)?;
    let written = std::io::copy(&mut source, &mut dest)
        .map_err(|e| TransferError::Upload(e.to_string()))?;
    drop(dest);

    sftp.rename(
        &part,
        Path::new(remote),
        Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE),
    )
    .map_err(upload_err)?;
    Ok(written)
}

fn stream_blocking(
    session: &Session,
    command: &str,
    sink: mpsc::Sender<String>,
    window: Duration,
) -> Result<(), CommandError> {
    let mut channel = session
        .channel_session()
        .map_err(|e| CommandError::Channel(e.to_string()))?;
    channel
        .exec(command)
        .map_err(|e| CommandError::Channel(e.to_string()))?;

    let started = Instant::now();
    let mut buf = [0u8; 8192];
    let mut streamed = false;
    let mut finished = false;
    loop {
        if started.elapsed() >= window || sink.is_closed() {
            break;
        }
        match channel.read(&mut buf) {
            Ok(0) => {
                finished = true;
                break;
            }
            Ok(n) => {
                streamed = true;
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                if sink.blocking_send(chunk).is_err() {
                    break;
                }
            }
            // idle follow; libssh2 returns a timeout when no data arrived
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(CommandError::Channel(e.to_string())),
        }
    }

    if !finished {
        let _ = channel.close();
        return Ok(());
    }

    // stdout hit EOF, so the exit status is on its way
    let mut stderr = String::new();
    let _ = channel.stderr().read_to_string(&mut stderr);
    channel
        .wait_close()
        .map_err(|e| CommandError::Channel(e.to_string()))?;
    let code = channel
        .exit_status()
        .map_err(|e| CommandError::Channel(e.to_string()))?;
    if code != 0 && !streamed {
        return Err(CommandError::Failed {
            command: command.to_string(),
            code,
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &RemoteCommand) -> Result<CommandOutput, CommandError> {
        let rendered = command.render()?;
        debug!("[{}] $ {}", self.host, rendered);

        let session = self.session.clone();
        let line = rendered.clone();
        let task = tokio::task::spawn_blocking(move || exec_blocking(&session, &line));

        match tokio::time::timeout(self.command_timeout, task).await {
            Err(_) => {
                warn!("[{}] command timed out, closing session", self.host);
                self.teardown("command timeout");
                Err(CommandError::Timeout {
                    command: command.command_line(),
                    secs: self.command_timeout.as_secs(),
                })
            }
            Ok(Err(e)) => Err(CommandError::Channel(e.to_string())),
            Ok(Ok(Err(CommandError::Timeout { .. }))) => {
                self.teardown("command timeout");
                Err(CommandError::Timeout {
                    command: command.command_line(),
                    secs: self.command_timeout.as_secs(),
                })
            }
            Ok(Ok(result)) => result,
        }
    }

    async fn put_file(&self, local_path: &Path, remote_path: &str) -> Result<u64, TransferError> {
        check_path(remote_path)?;
        debug!("[{}] upload {} -> {}", self.host, local_path.display(), remote_path);

        let session = self.session.clone();
        let local = local_path.to_path_buf();
        let remote = remote_path.to_string();
        let task = tokio::task::spawn_blocking(move || upload_blocking(&session, &local, &remote));

        match tokio::time::timeout(self.transfer_timeout, task).await {
            Err(_) => {
                self.teardown("transfer timeout");
                Err(TransferError::Upload(format!(
                    "upload to {} timed out after {}s",
                    remote_path,
                    self.transfer_timeout.as_secs()
                )))
            }
            Ok(Err(e)) => Err(TransferError::Upload(e.to_string())),
            Ok(Ok(result)) => result,
        }
    }

    async fn stream(
        &self,
        command: &RemoteCommand,
        sink: mpsc::Sender<String>,
        window: Duration,
    ) -> Result<(), CommandError> {
        let rendered = command.render()?;
        let session = self.session.clone();
        let task =
            tokio::task::spawn_blocking(move || stream_blocking(&session, &rendered, sink, window));

        // the loop checks the window itself; the outer bound covers a stalled read
        match tokio::time::timeout(window + self.command_timeout, task).await {
            Err(_) => {
                self.teardown("stream timeout");
                Err(CommandError::Timeout {
                    command: command.command_line(),
                    secs: window.as_secs(),
                })
            }
            Ok(Err(e)) => Err(CommandError::Channel(e.to_string())),
            Ok(Ok(result)) => result,
        }
    }

    async fn close(&self) {
        let session = self.session.clone();
        let _ = tokio::task::spawn_blocking(move || session.disconnect(None, "closing", None)).await;
    }
}
