//! In-memory remote host
//!
//! `FakeHost` plays both connector and session. It keeps a small virtual Linux
//! filesystem (directories, files, symlinks) and a process table, and
//! interprets the structured commands this crate issues. Integration tests and
//! local dry runs use it in place of a real SSH server.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{CommandError, ConnectError, TransferError};
use crate::remote::command::{check_path, CommandOutput, RemoteCommand};
use crate::remote::session::{ConnectParams, RemoteConnector, RemoteSession};

const MAX_LINK_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Dir,
    File(Vec<u8>),
    Symlink(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeProcess {
    pub pid: u32,
    pub cmdline: String,
    pub cwd: String,
}

#[derive(Debug, Default)]
struct FakeState {
    nodes: BTreeMap<String, Node>,
    processes: BTreeMap<u32, FakeProcess>,
    next_pid: u32,
    archives: HashMap<String, Vec<(String, Vec<u8>)>>,
    commands: Vec<String>,
    uploads: Vec<String>,
    connect_attempts: HashMap<String, u32>,
    open_sessions: i64,
    closed_sessions: u32,
    reject_auth: bool,
    unreachable_hosts: HashSet<String>,
    timeout_hosts: HashSet<String>,
    failing_programs: HashSet<String>,
    no_mv_t: bool,
    failing_links: HashSet<String>,
    processes_exit_immediately: bool,
}

/// Simulated Linux host reachable through [`RemoteConnector`]
#[derive(Debug, Clone)]
pub struct FakeHost {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        let mut state = FakeState {
            next_pid: 4000,
            ..Default::default()
        };
        state.nodes.insert("/".to_string(), Node::Dir);
        for dir in ["/tmp", "/srv", "/var", "/var/log"] {
            state.nodes.insert(dir.to_string(), Node::Dir);
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------- knobs -------------------------- //

    /// Every connection attempt fails authentication
    pub fn reject_auth(&self, reject: bool) -> &Self {
        self.lock().reject_auth = reject;
        self
    }

    pub fn set_unreachable(&self, host: &str) -> &Self {
        self.lock().unreachable_hosts.insert(host.to_string());
        self
    }

    pub fn set_timeout(&self, host: &str) -> &Self {
        self.lock().timeout_hosts.insert(host.to_string());
        self
    }

    /// Commands whose program matches exit with status 1
    pub fn fail_program(&self, program: &str) -> &Self {
        self.lock().failing_programs.insert(program.to_string());
        self
    }

    /// Emulate an `mv` without `-T` support (busybox)
    pub fn without_mv_t(&self) -> &Self {
        self.lock().no_mv_t = true;
        self
    }

    /// `ln -s` fails when creating a link at `path`
    pub fn fail_link(&self, path: &str) -> &Self {
        self.lock().failing_links.insert(normalize(path));
        self
    }

    /// Background launches print a PID but the process is gone immediately
    pub fn processes_exit_immediately(&self, exit: bool) -> &Self {
        self.lock().processes_exit_immediately = exit;
        self
    }

    /// Entries produced when an archive with this file name is extracted
    pub fn set_archive(&self, file_name: &str, entries: &[(&str, &str)]) -> &Self {
        self.lock().archives.insert(
            file_name.to_string(),
            entries
                .iter()
                .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
                .collect(),
        );
        self
    }

    // ------------------------ inspection ----------------------- //

    pub fn mkdir_all(&self, path: &str) {
        let mut state = self.lock();
        state.mkdir_p(path);
    }

    pub fn write_file(&self, path: &str, contents: &[u8]) {
        let mut state = self.lock();
        if let Some(parent) = parent_of(path) {
            state.mkdir_p(&parent);
        }
        state.nodes.insert(normalize(path), Node::File(contents.to_vec()));
    }

    pub fn remove(&self, path: &str) {
        let mut state = self.lock();
        let path = normalize(path);
        let prefix = format!("{}/", path);
        state
            .nodes
            .retain(|key, _| key != &path && !key.starts_with(&prefix));
    }

    pub fn is_dir(&self, path: &str) -> bool {
        let state = self.lock();
        matches!(state.lookup(path, true), Some((_, Node::Dir)))
    }

    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.lock();
        match state.lookup(path, true) {
            Some((_, Node::File(data))) => Some(data),
            _ => None,
        }
    }

    pub fn read_link(&self, path: &str) -> Option<String> {
        match self.lock().nodes.get(&normalize(path)) {
            Some(Node::Symlink(target)) => Some(target.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(&normalize(path))
    }

    pub fn spawn_process(&self, cmdline: &str, cwd: &str) -> u32 {
        self.lock().spawn(cmdline.to_string(), cwd.to_string())
    }

    pub fn processes(&self) -> Vec<FakeProcess> {
        self.lock().processes.values().cloned().collect()
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.lock().processes.contains_key(&pid)
    }

    /// Rendered command lines, in execution order
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.lock().uploads.clone()
    }

    pub fn connect_attempts(&self, host: &str) -> u32 {
        self.lock().connect_attempts.get(host).copied().unwrap_or(0)
    }

    /// Sessions opened and not yet closed
    pub fn open_sessions(&self) -> i64 {
        self.lock().open_sessions
    }

    pub fn closed_sessions(&self) -> u32 {
        self.lock().closed_sessions
    }
}

#[async_trait]
impl RemoteConnector for FakeHost {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn RemoteSession>, ConnectError> {
        params.credential.validate()?;

        let mut state = self.lock();
        *state
            .connect_attempts
            .entry(params.host.clone())
            .or_insert(0) += 1;

        if state.timeout_hosts.contains(&params.host) {
            return Err(ConnectError::Timeout {
                host: params.host.clone(),
            });
        }
        if state.unreachable_hosts.contains(&params.host) {
            return Err(ConnectError::Unreachable {
                host: params.host.clone(),
                reason: "connection refused".to_string(),
            });
        }
        if state.reject_auth {
            return Err(ConnectError::AuthFailed {
                host: params.host.clone(),
                reason: "authentication failed".to_string(),
            });
        }
        state.open_sessions += 1;
        drop(state);

        Ok(Box::new(FakeSession {
            host: params.host.clone(),
            fake: self.clone(),
        }))
    }
}

/// Session handed out by [`FakeHost`]
pub struct FakeSession {
    host: String,
    fake: FakeHost,
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &RemoteCommand) -> Result<CommandOutput, CommandError> {
        let rendered = command.render()?;
        let mut state = self.fake.lock();
        state.commands.push(rendered);
        Ok(state.execute(command))
    }

    async fn put_file(&self, local_path: &Path, remote_path: &str) -> Result<u64, TransferError> {
        check_path(remote_path)?;
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| TransferError::Source(format!("{}: {}", local_path.display(), e)))?;

        let mut state = self.fake.lock();
        let parent = parent_of(remote_path).unwrap_or_else(|| "/".to_string());
        if !matches!(state.lookup(&parent, true), Some((_, Node::Dir))) {
            return Err(TransferError::Upload(format!(
                "{}: no such directory",
                parent
            )));
        }
        let len = data.len() as u64;
        let resolved = state.resolve_parent(remote_path);
        state.nodes.insert(resolved, Node::File(data));
        state.uploads.push(remote_path.to_string());
        Ok(len)
    }

    async fn stream(
        &self,
        command: &RemoteCommand,
        sink: mpsc::Sender<String>,
        _window: Duration,
    ) -> Result<(), CommandError> {
        let output = self.run(command).await?;
        if !output.success() {
            return Err(CommandError::Failed {
                command: command.command_line(),
                code: output.exit_code,
                stderr: output.stderr,
            });
        }
        for line in output.stdout.split_inclusive('\n') {
            if sink.send(line.to_string()).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.fake.lock();
        state.open_sessions -= 1;
        state.closed_sessions += 1;
    }
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: 0,
    }
}

fn fail(code: i32, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        exit_code: code,
    }
}

/// Collapse `.` and duplicate slashes; `..` never reaches here
fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> Option<String> {
    let path = normalize(path);
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    Some(if idx == 0 {
        "/".to_string()
    } else {
        path[..idx].to_string()
    })
}

fn join(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        normalize(path)
    } else {
        normalize(&format!("{}/{}", base, path))
    }
}

impl FakeState {
    fn mkdir_p(&mut self, path: &str) {
        let mut current = String::new();
        for part in normalize(path).split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            let resolved = self.resolve_parent(&current);
            if let Some((real, Node::Dir)) = self.lookup(&resolved, true) {
                current = real;
                continue;
            }
            self.nodes.entry(resolved.clone()).or_insert(Node::Dir);
            current = resolved;
        }
    }

    /// Resolve every component except the last through symlinks
    fn resolve_parent(&self, path: &str) -> String {
        let path = normalize(path);
        match parent_of(&path) {
            None => path,
            Some(parent) => {
                let name = &path[path.rfind('/').map(|i| i + 1).unwrap_or(0)..];
                let parent = self
                    .lookup(&parent, true)
                    .map(|(real, _)| real)
                    .unwrap_or(parent);
                join(&parent, name)
            }
        }
    }

    /// Find a node, following symlinks (the last one only when `follow`)
    fn lookup(&self, path: &str, follow: bool) -> Option<(String, Node)> {
        let mut current = normalize(path);
        for _ in 0..MAX_LINK_DEPTH {
            let real = self.resolve_parent(&current);
            match self.nodes.get(&real) {
                Some(Node::Symlink(target)) if follow => {
                    let base = parent_of(&real).unwrap_or_else(|| "/".to_string());
                    current = join(&base, target);
                }
                Some(node) => return Some((real, node.clone())),
                None => return None,
            }
        }
        None
    }

    fn spawn(&mut self, cmdline: String, cwd: String) -> u32 {
        self.next_pid += 1;
        let pid = self.next_pid;
        self.processes.insert(pid, FakeProcess { pid, cmdline, cwd });
        pid
    }

    fn execute(&mut self, command: &RemoteCommand) -> CommandOutput {
        let cwd = command
            .working_dir()
            .map(normalize)
            .unwrap_or_else(|| "/".to_string());

        if command.working_dir().is_some()
            && !matches!(self.lookup(&cwd, true), Some((_, Node::Dir)))
        {
            return fail(2, format!("cd: {}: No such file or directory", cwd));
        }

        let program = command.program().to_string();
        if self.failing_programs.contains(&program) {
            return fail(1, format!("{}: simulated failure", program));
        }

        if let Some(bg) = command.background_spec() {
            return self.launch(command, &cwd, &bg.log_file);
        }

        let args: Vec<String> = command.args().iter().map(|a| a.as_str().to_string()).collect();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let abs = |p: &str| join(&cwd, p);

        match (program.as_str(), args.as_slice()) {
            ("true", _) => ok(""),
            ("echo", words) => ok(format!("{}\n", words.join(" "))),
            ("mkdir", ["-p", paths @ ..]) => {
                for p in paths {
                    if matches!(self.lookup(&abs(p), false), Some((_, Node::File(_)))) {
                        return fail(1, format!("mkdir: {}: File exists", p));
                    }
                    self.mkdir_p(&abs(p));
                }
                ok("")
            }
            ("test", [flag, p]) => {
                let found = match *flag {
                    "-d" => matches!(self.lookup(&abs(p), true), Some((_, Node::Dir))),
                    "-f" => matches!(self.lookup(&abs(p), true), Some((_, Node::File(_)))),
                    "-L" => matches!(self.lookup(&abs(p), false), Some((_, Node::Symlink(_)))),
                    _ => self.lookup(&abs(p), true).is_some(),
                };
                if found {
                    ok("")
                } else {
                    fail(1, "")
                }
            }
            ("ln", ["-s", target, link]) => {
                if self.failing_links.contains(&abs(link)) {
                    return fail(1, format!("ln: failed to create symbolic link '{}'", link));
                }
                let link_path = self.resolve_parent(&abs(link));
                if self.nodes.contains_key(&link_path) {
                    return fail(1, format!("ln: {}: File exists", link));
                }
                self.nodes
                    .insert(link_path, Node::Symlink(target.to_string()));
                ok("")
            }
            ("mv", ["-T", src, dst]) => {
                if self.no_mv_t {
                    return fail(1, "mv: invalid option -- 'T'");
                }
                let src_path = self.resolve_parent(&abs(src));
                let dst_path = self.resolve_parent(&abs(dst));
                let Some(node) = self.nodes.get(&src_path).cloned() else {
                    return fail(1, format!("mv: {}: No such file or directory", src));
                };
                if matches!(self.nodes.get(&dst_path), Some(Node::Dir)) {
                    return fail(1, format!("mv: cannot overwrite directory '{}'", dst));
                }
                self.nodes.remove(&src_path);
                self.nodes.insert(dst_path, node);
                ok("")
            }
            ("rm", ["-f", paths @ ..]) => {
                for p in paths {
                    let path = self.resolve_parent(&abs(p));
                    match self.nodes.get(&path) {
                        Some(Node::Dir) => {
                            return fail(1, format!("rm: {}: is a directory", p));
                        }
                        Some(_) => {
                            self.nodes.remove(&path);
                        }
                        None => {}
                    }
                }
                ok("")
            }
            ("readlink", [p]) => match self.lookup(&abs(p), false) {
                Some((_, Node::Symlink(target))) => ok(format!("{}\n", target)),
                _ => fail(1, ""),
            },
            ("tar", ["-xzf", archive, "-C", dir]) => self.extract(&abs(archive), &abs(dir), "tar"),
            ("unzip", ["-q", "-o", archive, "-d", dir]) => {
                self.extract(&abs(archive), &abs(dir), "unzip")
            }
            ("chmod", ["+x", p]) => match self.lookup(&abs(p), true) {
                Some(_) => ok(""),
                None => fail(1, format!("chmod: {}: No such file or directory", p)),
            },
            ("kill", ["-0", pid]) => match pid.parse::<u32>() {
                Ok(pid) if self.processes.contains_key(&pid) => ok(""),
                _ => fail(1, format!("kill: ({}) - No such process", pid)),
            },
            ("kill", [pid]) => match pid.parse::<u32>() {
                Ok(pid) if self.processes.remove(&pid).is_some() => ok(""),
                _ => fail(1, format!("kill: ({}) - No such process", pid)),
            },
            ("pkill", ["-f", pattern]) => {
                let before = self.processes.len();
                self.processes
                    .retain(|_, proc| !proc.cmdline.contains(pattern));
                if self.processes.len() < before {
                    ok("")
                } else {
                    fail(1, "")
                }
            }
            ("ps", ["-eo", "pid,args"]) => {
                let mut out = String::from("  PID COMMAND\n");
                for proc in self.processes.values() {
                    out.push_str(&format!("{:>5} {}\n", proc.pid, proc.cmdline));
                }
                ok(out)
            }
            ("tail", [.., "-n", n, p]) => match self.lookup(&abs(p), true) {
                Some((_, Node::File(data))) => {
                    let n = n.parse::<usize>().unwrap_or(10);
                    let text = String::from_utf8_lossy(&data).into_owned();
                    let lines: Vec<&str> = text.lines().collect();
                    let start = lines.len().saturating_sub(n);
                    let mut out = lines[start..].join("\n");
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    ok(out)
                }
                _ => fail(1, format!("tail: cannot open '{}'", p)),
            },
            ("sh", [script, ..]) => match self.lookup(&abs(script), true) {
                Some((_, Node::File(body))) => {
                    let body = String::from_utf8_lossy(&body).into_owned();
                    if body.contains("exit 1") {
                        fail(1, format!("{}: failed", script))
                    } else {
                        ok(format!("{} done\n", script))
                    }
                }
                _ => fail(127, format!("sh: {}: not found", script)),
            },
            (other, _) => fail(127, format!("{}: command not found", other)),
        }
    }

    fn extract(&mut self, archive: &str, dir: &str, tool: &str) -> CommandOutput {
        let Some((_, Node::File(data))) = self.lookup(archive, true) else {
            return fail(2, format!("{}: {}: cannot open", tool, archive));
        };
        if data.starts_with(b"corrupt") {
            return fail(2, format!("{}: {}: not an archive", tool, archive));
        }
        let name = archive.rsplit('/').next().unwrap_or(archive).to_string();
        let entries = self.archives.get(&name).cloned().unwrap_or_default();
        for (rel, contents) in entries {
            let path = join(dir, &rel);
            if let Some(parent) = parent_of(&path) {
                self.mkdir_p(&parent);
            }
            self.nodes.insert(path, Node::File(contents));
        }
        ok("")
    }

    fn launch(&mut self, command: &RemoteCommand, cwd: &str, log_file: &str) -> CommandOutput {
        let program = command.program();
        let is_path = program.starts_with("./") || program.starts_with('/');
        if is_path && !matches!(self.lookup(&join(cwd, program), true), Some((_, Node::File(_)))) {
            // the shell still prints `$!` for a launch that dies at once
            self.next_pid += 1;
            return ok(format!("{}\n", self.next_pid));
        }

        let log_path = join(cwd, log_file);
        match parent_of(&log_path) {
            Some(parent) if matches!(self.lookup(&parent, true), Some((_, Node::Dir))) => {}
            _ => return fail(1, format!("sh: {}: No such file or directory", log_file)),
        }
        let log_real = self.resolve_parent(&log_path);
        self.nodes
            .insert(log_real, Node::File(format!("started {}\n", command.command_line()).into_bytes()));

        let pid = self.spawn(command.command_line(), cwd.to_string());
        if self.processes_exit_immediately {
            self.processes.remove(&pid);
        }
        ok(format!("{}\n", pid))
    }
}
