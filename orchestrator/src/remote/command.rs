//! Structured remote commands
//!
//! Commands are assembled from typed arguments instead of shell strings. Paths
//! and names must pass an allow-list before they are quoted and rendered.

use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::errors::CommandError;

/// One argument of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Fixed token chosen by this crate (flags, subcommands)
    Literal(&'static str),
    /// Filesystem path or name, checked against the allow-list
    Path(String),
    /// Free-form value (patterns, opaque options), always quoted
    Value(String),
}

impl Arg {
    pub fn as_str(&self) -> &str {
        match self {
            Arg::Literal(s) => s,
            Arg::Path(s) | Arg::Value(s) => s,
        }
    }

    fn render(&self) -> Result<String, CommandError> {
        match self {
            Arg::Literal(s) => Ok((*s).to_string()),
            Arg::Path(p) => {
                check_path(p)?;
                Ok(quote(p))
            }
            Arg::Value(v) => {
                check_value(v)?;
                Ok(quote(v))
            }
        }
    }
}

/// Redirect target for a detached launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Background {
    pub log_file: String,
}

/// A command to run on a remote host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    program: Arg,
    args: Vec<Arg>,
    cwd: Option<String>,
    env: BTreeMap<String, String>,
    background: Option<Background>,
}

impl RemoteCommand {
    pub fn new(program: &'static str) -> Self {
        Self {
            program: Arg::Literal(program),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            background: None,
        }
    }

    /// Command whose program is a path such as `./app`
    pub fn program_path(program: impl Into<String>) -> Self {
        Self {
            program: Arg::Path(program.into()),
            ..Self::new("true")
        }
    }

    pub fn arg(mut self, arg: &'static str) -> Self {
        self.args.push(Arg::Literal(arg));
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.args.push(Arg::Path(path.into()));
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.args.push(Arg::Value(value.into()));
        self
    }

    pub fn values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(|v| Arg::Value(v.into())));
        self
    }

    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        for (k, v) in vars {
            self.env.insert(k.clone(), v.clone());
        }
        self
    }

    /// Detach with `nohup`, redirect output to `log_file` and print the PID
    pub fn background(mut self, log_file: impl Into<String>) -> Self {
        self.background = Some(Background {
            log_file: log_file.into(),
        });
        self
    }

    pub fn program(&self) -> &str {
        self.program.as_str()
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn background_spec(&self) -> Option<&Background> {
        self.background.as_ref()
    }

    /// Program followed by its arguments, unquoted, as a process table would show it
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(Arg::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Check every argument without rendering
    pub fn validate(&self) -> Result<(), CommandError> {
        self.render().map(|_| ())
    }

    /// Render to a POSIX `sh` command line
    pub fn render(&self) -> Result<String, CommandError> {
        let mut words = Vec::with_capacity(self.args.len() + self.env.len() + 2);
        for (key, value) in &self.env {
            check_env_key(key)?;
            check_value(value)?;
            words.push(format!("{}={}", key, quote(value)));
        }

        if let Some(bg) = &self.background {
            words.push("nohup".to_string());
            words.push(self.program.render()?);
            for arg in &self.args {
                words.push(arg.render()?);
            }
            check_path(&bg.log_file)?;
            words.push(format!(
                "> {} 2>&1 < /dev/null & echo $!",
                quote(&bg.log_file)
            ));
        } else {
            words.push(self.program.render()?);
            for arg in &self.args {
                words.push(arg.render()?);
            }
        }

        let body = words.join(" ");
        match &self.cwd {
            Some(dir) => {
                check_path(dir)?;
                if self.background.is_some() {
                    Ok(format!("cd {} && {{ {}; }}", quote(dir), body))
                } else {
                    Ok(format!("cd {} && {}", quote(dir), body))
                }
            }
            None if self.background.is_some() => Ok(format!("{{ {}; }}", body)),
            None => Ok(body),
        }
    }
}

impl std::fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.render() {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str(&self.command_line()),
        }
    }
}

/// Captured result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert a non-zero exit into [`CommandError::Failed`]
    pub fn check(self, command: &RemoteCommand) -> Result<Self, CommandError> {
        if self.success() {
            Ok(self)
        } else {
            Err(CommandError::Failed {
                command: command.command_line(),
                code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '@' | ':' | '+' | '=' | ',' | '-')
}

/// Allow-list check for anything used as a path or name on the remote host
pub fn check_path(path: &str) -> Result<(), CommandError> {
    let unsafe_arg = || CommandError::UnsafeArgument(path.to_string());
    if path.is_empty() || path.starts_with('-') {
        return Err(unsafe_arg());
    }
    if !path.chars().all(is_allowed_char) {
        return Err(unsafe_arg());
    }
    if path.split('/').any(|component| component == "..") {
        return Err(unsafe_arg());
    }
    Ok(())
}

fn check_value(value: &str) -> Result<(), CommandError> {
    if value.chars().any(|c| c == '\0' || c == '\n' || c == '\r') {
        return Err(CommandError::UnsafeArgument(value.to_string()));
    }
    Ok(())
}

fn check_env_key(key: &str) -> Result<(), CommandError> {
    let mut chars = key.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CommandError::UnsafeArgument(key.to_string()))
    }
}

fn quote(s: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(s)).into_owned()
}

/// Split an options string such as `-Xmx512m -Dfoo=bar` into words
pub fn split_words(s: Option<&str>) -> Vec<String> {
    s.map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}
