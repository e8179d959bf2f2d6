//! Process supervision on a target
//!
//! Starts the managed application either detached in the background (PID
//! captured) or through a project start script (opaque), and stops it by PID,
//! by command-line pattern or through a stop script. Stopping something that
//! is already gone counts as success.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};

use api_models::models::ProcessInfo;

use crate::app::options::SupervisorOptions;
use crate::errors::{CommandError, ProcessControlError};
use crate::release::ArtifactKind;
use crate::remote::command::{split_words, RemoteCommand};
use crate::remote::session::RemoteSession;
use crate::store::ProjectRecord;

/// Log file for background starts, relative to the release directory
pub const APP_LOG: &str = "logs/app.log";

/// How to launch an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchPlan {
    Script {
        start_script: String,
        stop_script: Option<String>,
    },
    Jar {
        jar: String,
        java_opts: Vec<String>,
        args: Vec<String>,
    },
    Executable {
        name: String,
        args: Vec<String>,
    },
    /// Archive without a start script: the files are deployed, nothing runs
    Nothing,
}

impl LaunchPlan {
    pub fn resolve(project: &ProjectRecord, file_name: &str, kind: ArtifactKind) -> Self {
        let non_blank = |s: &Option<String>| s.as_ref().filter(|v| !v.trim().is_empty()).cloned();

        if let Some(start_script) = non_blank(&project.start_script) {
            return LaunchPlan::Script {
                start_script,
                stop_script: non_blank(&project.stop_script),
            };
        }
        let args = split_words(project.app_args.as_deref());
        match kind {
            ArtifactKind::Jar => LaunchPlan::Jar {
                jar: file_name.to_string(),
                java_opts: split_words(project.java_opts.as_deref()),
                args,
            },
            ArtifactKind::Binary => LaunchPlan::Executable {
                name: file_name.to_string(),
                args,
            },
            ArtifactKind::TarGz | ArtifactKind::Zip => LaunchPlan::Nothing,
        }
    }

    /// Command-line fragment that identifies this application in `ps`
    pub fn match_pattern(&self) -> Option<String> {
        match self {
            LaunchPlan::Jar { jar, .. } => Some(jar.clone()),
            LaunchPlan::Executable { name, .. } => Some(format!("./{}", name)),
            LaunchPlan::Script { .. } | LaunchPlan::Nothing => None,
        }
    }
}

/// What to stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopTarget {
    Pid(u32),
    Pattern(String),
    Script { workdir: String, script: String },
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

impl StopOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopOutcome::Stopped => "stopped",
            StopOutcome::NotRunning => "not_running",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Background { pid: u32, log_file: String },
    Script { output: String },
    NothingToStart,
}

impl StartOutcome {
    pub fn pid(&self) -> Option<u32> {
        match self {
            StartOutcome::Background { pid, .. } => Some(*pid),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            StartOutcome::Background { pid, log_file } => {
                format!("started in background, pid {} (log {})", pid, log_file)
            }
            StartOutcome::Script { output } if output.trim().is_empty() => {
                "start script completed".to_string()
            }
            StartOutcome::Script { output } => {
                format!("start script completed: {}", output.trim())
            }
            StartOutcome::NothingToStart => {
                "no start script or runnable artifact; files deployed".to_string()
            }
        }
    }
}

/// Process control over one open session
pub struct Supervisor<'a> {
    session: &'a dyn RemoteSession,
    options: &'a SupervisorOptions,
}

impl<'a> Supervisor<'a> {
    pub fn new(session: &'a dyn RemoteSession, options: &'a SupervisorOptions) -> Self {
        Self { session, options }
    }

    pub async fn start(
        &self,
        plan: &LaunchPlan,
        workdir: &str,
        env: &BTreeMap<String, String>,
        log_file: &str,
    ) -> Result<StartOutcome, ProcessControlError> {
        let cmd = match plan {
            LaunchPlan::Nothing => return Ok(StartOutcome::NothingToStart),
            LaunchPlan::Script { start_script, .. } => {
                let cmd = RemoteCommand::new("sh")
                    .path(start_script.as_str())
                    .cwd(workdir)
                    .envs(env);
                let output = self.session.run(&cmd).await?;
                if !output.success() {
                    return Err(ProcessControlError::StartFailed(format!(
                        "{} exited with {}: {}",
                        start_script,
                        output.exit_code,
                        output.stderr.trim()
                    )));
                }
                return Ok(StartOutcome::Script {
                    output: output.stdout,
                });
            }
            LaunchPlan::Jar {
                jar,
                java_opts,
                args,
            } => RemoteCommand::new("java")
                .values(java_opts.iter().cloned())
                .arg("-jar")
                .path(jar.as_str())
                .values(args.iter().cloned()),
            LaunchPlan::Executable { name, args } => {
                RemoteCommand::program_path(format!("./{}", name)).values(args.iter().cloned())
            }
        };

        let cmd = cmd.cwd(workdir).envs(env).background(log_file);
        let output = self.session.run(&cmd).await?;
        if !output.success() {
            return Err(ProcessControlError::StartFailed(format!(
                "launch exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        let pid = parse_pid(&output.stdout).ok_or_else(|| {
            ProcessControlError::StartFailed(format!(
                "launcher did not report a pid: {:?}",
                output.stdout.trim()
            ))
        })?;
        info!("Started {} on {} with pid {}", cmd.program(), self.session.host(), pid);
        Ok(StartOutcome::Background {
            pid,
            log_file: format!("{}/{}", workdir, log_file),
        })
    }

    /// Terminate one process; a missing process is [`StopOutcome::NotRunning`]
    pub async fn stop_pid(&self, pid: u32) -> Result<StopOutcome, ProcessControlError> {
        let cmd = RemoteCommand::new("kill").value(pid.to_string());
        let output = self.session.run(&cmd).await?;
        if output.success() {
            return Ok(StopOutcome::Stopped);
        }
        if output.stderr.to_ascii_lowercase().contains("no such process") {
            debug!("pid {} already gone on {}", pid, self.session.host());
            return Ok(StopOutcome::NotRunning);
        }
        Err(ProcessControlError::StopFailed(format!(
            "kill {} exited with {}: {}",
            pid,
            output.exit_code,
            output.stderr.trim()
        )))
    }

    /// Terminate every process whose command line matches `pattern`
    pub async fn stop_pattern(&self, pattern: &str) -> Result<StopOutcome, ProcessControlError> {
        if pattern.trim().is_empty() {
            return Err(ProcessControlError::StopFailed(
                "refusing to stop with an empty pattern".to_string(),
            ));
        }
        let cmd = RemoteCommand::new("pkill").arg("-f").value(pattern);
        let output = self.session.run(&cmd).await?;
        match output.exit_code {
            0 => Ok(StopOutcome::Stopped),
            // pkill: 1 means nothing matched
            1 => Ok(StopOutcome::NotRunning),
            code => Err(ProcessControlError::StopFailed(format!(
                "pkill exited with {}: {}",
                code,
                output.stderr.trim()
            ))),
        }
    }

    pub async fn stop_script(
        &self,
        workdir: &str,
        script: &str,
    ) -> Result<StopOutcome, ProcessControlError> {
        let cmd = RemoteCommand::new("sh").path(script).cwd(workdir);
        let output = self.session.run(&cmd).await?;
        if output.success() {
            Ok(StopOutcome::Stopped)
        } else {
            Err(ProcessControlError::StopFailed(format!(
                "{} exited with {}: {}",
                script,
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }

    pub async fn stop(&self, target: &StopTarget) -> Result<StopOutcome, ProcessControlError> {
        match target {
            StopTarget::Pid(pid) => self.stop_pid(*pid).await,
            StopTarget::Pattern(pattern) => self.stop_pattern(pattern).await,
            StopTarget::Script { workdir, script } => self.stop_script(workdir, script).await,
            StopTarget::Nothing => Ok(StopOutcome::NotRunning),
        }
    }

    /// Stop (best effort on "not running"), settle, start
    pub async fn restart(
        &self,
        stop: &StopTarget,
        plan: &LaunchPlan,
        workdir: &str,
        env: &BTreeMap<String, String>,
        log_file: &str,
    ) -> Result<(StopOutcome, StartOutcome), ProcessControlError> {
        let stopped = self.stop(stop).await?;
        self.settle().await;
        let started = self.start(plan, workdir, env, log_file).await?;
        Ok((stopped, started))
    }

    pub async fn settle(&self) {
        tokio::time::sleep(self.options.settle_delay).await;
    }

    pub async fn is_alive(&self, pid: u32) -> Result<bool, CommandError> {
        let output = self
            .session
            .run(&RemoteCommand::new("kill").arg("-0").value(pid.to_string()))
            .await?;
        Ok(output.success())
    }

    /// Wait the verify delay, then confirm the process survived startup
    pub async fn verify_alive(&self, pid: u32) -> Result<(), ProcessControlError> {
        tokio::time::sleep(self.options.verify_delay).await;
        if self.is_alive(pid).await? {
            Ok(())
        } else {
            Err(ProcessControlError::NotAlive { pid })
        }
    }

    /// Running processes, optionally filtered by a command-line substring
    pub async fn list_processes(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<ProcessInfo>, CommandError> {
        let ps = self
            .session
            .run_checked(&RemoteCommand::new("ps").arg("-eo").arg("pid,args"))
            .await?;

        // listening ports are best effort; `ss` may be missing
        let ports = match self
            .session
            .run(&RemoteCommand::new("ss").arg("-ltnp"))
            .await
        {
            Ok(out) if out.success() => parse_listening_ports(&out.stdout),
            _ => BTreeMap::new(),
        };

        Ok(parse_ps(&ps.stdout)
            .into_iter()
            .filter(|p| filter.map_or(true, |f| p.cmd.contains(f)))
            .map(|mut p| {
                p.port = ports.get(&p.pid).copied();
                p
            })
            .collect())
    }
}

fn parse_pid(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse().ok())
}

/// Parse `ps -eo pid,args` output
pub fn parse_ps(stdout: &str) -> Vec<ProcessInfo> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, cmd) = line.split_once(char::is_whitespace)?;
            let pid = pid.parse().ok()?;
            let cmd = cmd.trim();
            if cmd.starts_with("ps -eo") || cmd.starts_with("ss -ltnp") {
                return None;
            }
            Some(ProcessInfo {
                pid,
                cmd: cmd.to_string(),
                port: None,
            })
        })
        .collect()
}

/// Map pid to listening port from `ss -ltnp` output
pub fn parse_listening_ports(stdout: &str) -> BTreeMap<u32, u16> {
    let mut ports = BTreeMap::new();
    for line in stdout.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let Some(local) = cols.get(3) else { continue };
        let Some(port) = local.rsplit(':').next().and_then(|p| p.parse::<u16>().ok()) else {
            continue;
        };
        let mut rest = line;
        while let Some(idx) = rest.find("pid=") {
            rest = &rest[idx + 4..];
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            if let Ok(pid) = digits.parse::<u32>() {
                ports.entry(pid).or_insert(port);
            }
        }
    }
    ports
}
