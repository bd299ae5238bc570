//! External tool runners.
//!
//! Every runner owns one [`CommandExecutor`], the primitive that spawns a
//! process, captures its output and keeps track of it while it runs so that
//! it can be stopped. Runners never share an executor: stopping a runner only
//! affects the processes it started.

mod awscli;
mod kubectl;
mod process;
mod shell;
mod terraform;
mod vpn;

pub use awscli::AwsCliRunner;
pub use kubectl::KubectlRunner;
pub use process::ProcessExecutor;
pub use shell::ShellRunner;
pub use terraform::{TerraformOutput, TerraformRunner};
pub use vpn::VpnRunner;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{ForgeError, Result};

/// A command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Binary name or path.
    pub binary: PathBuf,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub workdir: PathBuf,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Log file stem (`<tool>-<subcommand>`); no log file is written without one.
    pub log_name: Option<String>,
}

impl Invocation {
    /// Creates an invocation of `binary` in `workdir`.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            workdir: workdir.into(),
            env: Vec::new(),
            log_name: None,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Persists the output under `<logs>/<name>-<timestamp>.log`.
    #[must_use]
    pub fn log_as(mut self, name: impl Into<String>) -> Self {
        self.log_name = Some(name.into());
        self
    }

    /// Returns the first argument, used as the subcommand name.
    #[must_use]
    pub fn subcommand(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Returns the command line for display.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = self.binary.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Both streams, interleaved line by line in arrival order.
    pub combined: String,
}

impl CommandOutput {
    /// Returns the last `lines` lines of the combined output.
    #[must_use]
    pub fn tail(&self, lines: usize) -> String {
        tail(&self.combined, lines)
    }
}

/// Returns the last `lines` lines of `text`.
#[must_use]
pub fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Runs commands and stops them on request.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs a command to completion.
    ///
    /// A non-zero exit status is an error carrying the tail of the output.
    async fn exec(&self, invocation: Invocation) -> Result<CommandOutput>;

    /// Stops every process started by this executor that is still running.
    async fn stop(&self) -> Result<()>;
}

/// A tool driver.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Name of the tool, used in logs and errors.
    fn tool(&self) -> &'static str;

    /// Executor owned by this runner.
    fn executor(&self) -> &Arc<dyn CommandExecutor>;

    /// Stops the runner's in-flight processes.
    async fn stop(&self) -> Result<()> {
        debug!("Stopping {} runner", self.tool());
        self.executor().stop().await
    }
}

/// Creates the executor of each runner.
pub trait ExecutorFactory: Send + Sync {
    /// Returns a new executor for `tool`, logging into `log_dir`.
    fn executor(&self, tool: &'static str, log_dir: &Path) -> Arc<dyn CommandExecutor>;
}

/// Creates [`ProcessExecutor`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutorFactory;

impl ExecutorFactory for ProcessExecutorFactory {
    fn executor(&self, tool: &'static str, log_dir: &Path) -> Arc<dyn CommandExecutor> {
        Arc::new(ProcessExecutor::new(tool).with_log_dir(log_dir))
    }
}

/// Binaries used by the runners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    /// Terraform binary.
    pub terraform: PathBuf,
    /// Kubectl binary.
    pub kubectl: PathBuf,
    /// Shell used for scripts.
    pub shell: PathBuf,
    /// AWS CLI binary.
    pub aws: PathBuf,
    /// `OpenVPN` binary.
    pub openvpn: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            terraform: PathBuf::from("terraform"),
            kubectl: PathBuf::from("kubectl"),
            shell: PathBuf::from("sh"),
            aws: PathBuf::from("aws"),
            openvpn: PathBuf::from("openvpn"),
        }
    }
}

impl ToolPaths {
    /// Prefers binaries found in `bin_dir`, falling back to `PATH` lookup.
    #[must_use]
    pub fn discover(bin_dir: &Path) -> Self {
        let pick = |name: &str| {
            let vendored = bin_dir.join(name);
            if vendored.is_file() {
                debug!("Using vendored {}", vendored.display());
                vendored
            } else {
                PathBuf::from(name)
            }
        };

        Self {
            terraform: pick("terraform"),
            kubectl: pick("kubectl"),
            shell: PathBuf::from("sh"),
            aws: pick("aws"),
            openvpn: pick("openvpn"),
        }
    }
}

/// Stops a set of runners concurrently.
///
/// One task is spawned per runner. The first stop error is returned as soon
/// as it arrives, without waiting for the remaining runners; if none fails,
/// this returns once every runner has stopped.
///
/// # Errors
///
/// Returns the first error reported by a runner.
pub async fn stop_runners(runners: &[Arc<dyn Runner>]) -> Result<()> {
    if runners.is_empty() {
        return Ok(());
    }

    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<ForgeError>();
    let (done_tx, done_rx) = oneshot::channel::<()>();

    let handles: Vec<_> = runners
        .iter()
        .cloned()
        .map(|runner| {
            let err_tx = err_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = runner.stop().await {
                    warn!("Failed to stop {} runner: {}", runner.tool(), e);
                    err_tx.send(e).ok();
                }
            })
        })
        .collect();
    drop(err_tx);

    tokio::spawn(async move {
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Runner stop task panicked: {}", e);
            }
        }
        done_tx.send(()).ok();
    });

    tokio::select! {
        biased;
        Some(err) = err_rx.recv() => Err(err),
        _ = done_rx => err_rx.try_recv().map_or(Ok(()), Err),
    }
}
