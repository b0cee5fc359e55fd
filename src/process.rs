//! External command execution.
//!
//! Every effectful tool (btrfs, mount, ukify, sbctl, ...) goes through [`Cmd`]
//! so failures carry the program name and its stderr.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use crate::error::{Error, Result};

/// Builder for a single external command invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    allow_fail: bool,
    error_msg: Option<String>,
}

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            allow_fail: false,
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Return the result even when the command exits non-zero.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Message used in place of stderr when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Run with captured stdout/stderr.
    pub fn run(self) -> Result<CmdResult> {
        log::debug!("running: {}", self.display());

        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::tool(&self.program, format!("could not spawn: {}", e)))?;

        let result = CmdResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            let detail = match &self.error_msg {
                Some(msg) => format!("{} ({})", msg, result.stderr.trim()),
                None => format!("{} ({})", result.status, result.stderr.trim()),
            };
            return Err(Error::tool(&self.program, detail));
        }

        Ok(result)
    }

    /// Run with inherited stdio so long-running tools can talk to the terminal.
    pub fn run_interactive(self) -> Result<()> {
        log::debug!("running (interactive): {}", self.display());

        let status = self
            .command()
            .status()
            .map_err(|e| Error::tool(&self.program, format!("could not spawn: {}", e)))?;

        if !status.success() && !self.allow_fail {
            let detail = match &self.error_msg {
                Some(msg) => format!("{} ({})", msg, status),
                None => status.to_string(),
            };
            return Err(Error::tool(&self.program, detail));
        }
        Ok(())
    }
}

/// Locate an executable on `PATH`.
pub fn which(tool: &str) -> Option<PathBuf> {
    ::which::which(tool).ok()
}

/// Whether an executable is available on `PATH`.
pub fn exists(tool: &str) -> bool {
    which(tool).is_some()
}
