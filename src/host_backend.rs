use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use crate::error::CommandError;

/// One external invocation: program, argv and the time budget it gets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Human readable command line, used in logs and status messages.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandExecResult {
    pub exit: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandExecResult {
    pub fn success(&self) -> bool {
        self.exit == Some(0)
    }

    /// Best available explanation of a failed run.
    pub fn diagnostic(&self) -> String {
        if !self.stderr.is_empty() {
            return self.stderr.clone();
        }
        if !self.stdout.is_empty() {
            return self.stdout.clone();
        }
        match self.exit {
            Some(code) => format!("exit {code}"),
            None => "terminated by signal".to_string(),
        }
    }

    pub fn into_checked(self, spec: &CommandSpec) -> Result<Self, CommandError> {
        if self.success() {
            return Ok(self);
        }
        Err(CommandError::NonZeroExit {
            command: spec.display(),
            exit: self.exit,
            detail: self.diagnostic(),
        })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HostBackendError {
    #[error("{command}: {reason}")]
    InvalidInput { command: String, reason: String },
    #[error("{command}: program not found")]
    NotFound { command: String },
    #[error("{command}: {reason}")]
    ExecFailed { command: String, reason: String },
    #[error("{command}: timed out after {}s", .after.as_secs())]
    Timeout { command: String, after: Duration },
}

impl HostBackendError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid-input",
            Self::NotFound { .. } => "not-found",
            Self::ExecFailed { .. } => "exec-failed",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// The only way the core touches the host: run a command in the deployment's
/// working copy, or look at a directory inside it.
#[async_trait]
pub trait HostBackend: Send + Sync {
    fn workdir(&self) -> &Path;

    async fn exec(&self, spec: &CommandSpec) -> Result<CommandExecResult, HostBackendError>;

    /// `path` is resolved against [`HostBackend::workdir`] when relative.
    async fn is_dir(&self, path: &Path) -> bool;
}

#[derive(Clone, Debug)]
pub struct LocalHostBackend {
    workdir: PathBuf,
}

impl LocalHostBackend {
    pub fn new(workdir: PathBuf) -> Self {
        Self { workdir }
    }
}

#[async_trait]
impl HostBackend for LocalHostBackend {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn exec(&self, spec: &CommandSpec) -> Result<CommandExecResult, HostBackendError> {
        validate_argv(spec)?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&self.workdir)
            // Nothing we run may block on a terminal prompt.
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(spec.timeout, cmd.output()).await {
            Err(_) => {
                return Err(HostBackendError::Timeout {
                    command: spec.display(),
                    after: spec.timeout,
                });
            }
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(HostBackendError::NotFound {
                    command: spec.display(),
                });
            }
            Ok(Err(err)) => {
                return Err(HostBackendError::ExecFailed {
                    command: spec.display(),
                    reason: err.to_string(),
                });
            }
            Ok(Ok(output)) => output,
        };

        Ok(CommandExecResult {
            exit: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn is_dir(&self, path: &Path) -> bool {
        let full = self.workdir.join(path);
        tokio::fs::metadata(&full)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SystemdUnitName(String);

impl SystemdUnitName {
    pub fn parse(raw: &str) -> Result<Self, String> {
        validate_systemd_unit_name(raw)?;
        Ok(Self(raw.trim().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub fn validate_systemd_unit_name(raw: &str) -> Result<(), String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("unit-empty".to_string());
    }
    if trimmed.len() > 200 {
        return Err("unit-too-long".to_string());
    }
    if trimmed.starts_with('-') {
        return Err("unit-invalid-leading-dash".to_string());
    }
    if trimmed.contains('/') {
        return Err("unit-invalid-char-/".to_string());
    }
    for ch in trimmed.chars() {
        let ok = ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | '@');
        if !ok {
            return Err("unit-invalid-char".to_string());
        }
    }
    Ok(())
}

fn validate_argv(spec: &CommandSpec) -> Result<(), HostBackendError> {
    if spec.program.trim().is_empty() {
        return Err(HostBackendError::InvalidInput {
            command: spec.display(),
            reason: "program-empty".to_string(),
        });
    }
    if spec.program.contains('\0') || spec.args.iter().any(|arg| arg.contains('\0')) {
        return Err(HostBackendError::InvalidInput {
            command: spec.display(),
            reason: "argv-nul-byte".to_string(),
        });
    }
    Ok(())
}

pub fn is_disallowed_shell_char(ch: char) -> bool {
    ch.is_whitespace()
        || ch.is_control()
        || matches!(
            ch,
            ';' | '|' | '&' | '$' | '(' | ')' | '`' | '"' | '\'' | '<' | '>' | '\\' | '*' | '?'
                | '[' | '~' | '^' | ':'
        )
}
