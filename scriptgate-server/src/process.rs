use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use log::Level;
use scriptgate_api::api::{structured_output, ExecutionResult, ExitCodePolicy};
use tokio::process::Command;

use crate::args::{escape, CommandFlags};
use crate::config::ServerConfig;

/// Snapshot of the environment the commands run with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Captures the environment of the server process.
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars_os()
                .map(|(key, value)| {
                    (
                        key.to_string_lossy().into_owned(),
                        value.to_string_lossy().into_owned(),
                    )
                })
                .collect(),
        }
    }

    /// `overrides` win over the captured variables.
    #[must_use]
    pub fn merged(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.vars.extend(overrides);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

/// Failures that are not reported as structured results but as plain `500`s.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Command execution timeout after {}ms", .0.as_millis())]
    Timeout(Duration),
    /// Exit codes outside of the protocol, the output is passed on as is.
    #[error("{output}")]
    Unhandled { code: Option<i32>, output: String },
    #[error("Failed to launch command: {0}")]
    Launch(#[source] std::io::Error),
    #[error("Cannot send file {path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Runs command lines through the shell and classifies their outcome.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    shebang: Option<String>,
    environment: Environment,
    timeout: Option<Duration>,
    /// Level of the per execution diagnostics, raised to `info` in debug mode.
    diagnostics: Level,
}

impl ProcessRunner {
    pub fn new(shebang: Option<String>, environment: Environment, timeout: Option<Duration>) -> Self {
        Self {
            shebang,
            environment,
            timeout,
            diagnostics: Level::Trace,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.shebang.clone(),
            config.environment.clone(),
            config.timeout,
        )
        .with_debug(config.debug)
    }

    /// Logs command lines, status and output of every execution at `info`.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.diagnostics = if debug { Level::Info } else { Level::Trace };
        self
    }

    pub fn is_debug(&self) -> bool {
        self.diagnostics == Level::Info
    }

    /// The full command line: interpreter, quoted target and flags.
    pub fn command_line(&self, target: &Path, flags: &CommandFlags) -> String {
        let mut line = String::new();
        if let Some(shebang) = &self.shebang {
            line.push_str(shebang);
            line.push(' ');
        }
        line.push_str(&escape(&target.to_string_lossy()));
        if !flags.is_empty() {
            line.push(' ');
            line.push_str(&flags.to_string());
        }
        line
    }

    /// Spawns exactly one process for the command line and waits for it,
    /// killing it and everything it started once the timeout is reached.
    pub async fn run(&self, id: u64, command_line: &str) -> Result<ExecutionResult, ExecutionError> {
        let mut command = shell_command(command_line);
        command
            .env_clear()
            .envs(self.environment.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        log::log!(self.diagnostics, id; "$ {command_line}");
        let start = Instant::now();
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::info!(id; "Failed: {e:?}");
                return Err(ExecutionError::Launch(e));
            }
        };
        let pid = child.id();

        let result = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    // Dropping the future killed the shell, this takes its children.
                    kill_process_group(pid);
                    log::info!(id, timeout_ms = timeout.as_millis() as u64; "command timed out");
                    return Err(ExecutionError::Timeout(timeout));
                }
            },
            None => child.wait_with_output().await,
        };
        let time_taken = start.elapsed();

        match result {
            Ok(out) => {
                log::log!(self.diagnostics, id, time_taken:debug; "Status: {}", out.status);
                log::log!(self.diagnostics, id; "Stdout: {}", String::from_utf8_lossy(&out.stdout).trim());
                log::log!(self.diagnostics, id; "Stderr: {}", String::from_utf8_lossy(&out.stderr).trim());
                classify(out.status.code(), &out.stdout, &out.stderr)
            }
            Err(e) => {
                log::info!(id; "Failed: {e:?}");
                Err(ExecutionError::Launch(e))
            }
        }
    }
}

/// The shell was started as leader of its own process group.
#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal, no memory is shared with the callee.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);
    command
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").raw_arg(command_line);
    command
}

/// Trimmed stderr if not empty, else trimmed stdout if not empty.
fn captured_output(stdout: &[u8], stderr: &[u8]) -> Option<String> {
    [stderr, stdout]
        .into_iter()
        .map(|stream| String::from_utf8_lossy(stream).trim().to_owned())
        .find(|output| !output.is_empty())
}

/// Applies the exit code protocol to a finished process.
pub fn classify(
    code: Option<i32>,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<ExecutionResult, ExecutionError> {
    let captured = captured_output(stdout, stderr);
    match ExitCodePolicy::from_code(code) {
        ExitCodePolicy::File => Ok(ExecutionResult::file(captured.unwrap_or_default())),
        ExitCodePolicy::Success => Ok(ExecutionResult::object(structured_output(
            captured.as_deref().unwrap_or_default(),
            true,
        ))),
        ExitCodePolicy::HandledError => Ok(ExecutionResult::object(structured_output(
            captured.as_deref().unwrap_or_default(),
            false,
        ))),
        ExitCodePolicy::Unhandled(code) => Err(ExecutionError::Unhandled {
            code,
            output: captured.unwrap_or_else(|| match code {
                Some(code) => format!("Command failed with exit code {code}"),
                None => String::from("Command was terminated by a signal"),
            }),
        }),
    }
}
