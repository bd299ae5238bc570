//! Process-backed command executor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, ToolError};

use super::{CommandExecutor, CommandOutput, Invocation};

/// Lines of output kept in command failure errors.
const ERROR_TAIL_LINES: usize = 40;

type KillReply = oneshot::Sender<io::Result<()>>;

/// A process started by an executor and not finished yet.
#[derive(Debug)]
struct RunningProcess {
    /// Command line, for logs.
    command: String,
    /// When the process was spawned.
    started_at: DateTime<Utc>,
    /// Kill request channel; taken by the first stop.
    kill: Option<oneshot::Sender<KillReply>>,
}

/// Removes a process from the registry when its run ends, however it ends.
struct Registration<'a> {
    processes: &'a DashMap<Uuid, RunningProcess>,
    id: Uuid,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.processes.remove(&self.id);
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Spawns real processes and tracks them until they exit.
#[derive(Debug)]
pub struct ProcessExecutor {
    /// Tool name, used in stop errors.
    tool: &'static str,
    /// Directory for per-command log files.
    log_dir: Option<PathBuf>,
    /// In-flight processes.
    processes: DashMap<Uuid, RunningProcess>,
}

impl ProcessExecutor {
    /// Creates an executor for `tool`.
    #[must_use]
    pub fn new(tool: &'static str) -> Self {
        Self {
            tool,
            log_dir: None,
            processes: DashMap::new(),
        }
    }

    /// Writes one log file per command into `dir`.
    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Returns the number of processes currently running.
    #[must_use]
    pub fn running(&self) -> usize {
        self.processes.len()
    }

    async fn write_log(&self, invocation: &Invocation, output: &CommandOutput) {
        let (Some(dir), Some(name)) = (&self.log_dir, &invocation.log_name) else {
            return;
        };

        let file = dir.join(format!("{}-{}.log", name, Utc::now().format("%Y%m%dT%H%M%S%.3f")));
        let content = format!("$ {}\n{}", invocation.command_line(), output.combined);

        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!("Cannot create log directory {}: {}", dir.display(), e);
            return;
        }
        if let Err(e) = tokio::fs::write(&file, content).await {
            warn!("Cannot write log file {}: {}", file.display(), e);
        } else {
            debug!("Output written to {}", file.display());
        }
    }
}

fn forward_lines<R>(
    reader: R,
    stream: Stream,
    tx: mpsc::UnboundedSender<(Stream, String)>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((stream, line)).is_err() {
                break;
            }
        }
    })
}

fn record(output: &mut CommandOutput, stream: Stream, line: &str) {
    let target = match stream {
        Stream::Stdout => &mut output.stdout,
        Stream::Stderr => &mut output.stderr,
    };
    target.push_str(line);
    target.push('\n');
    output.combined.push_str(line);
    output.combined.push('\n');
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn exec(&self, invocation: Invocation) -> Result<CommandOutput> {
        let command = invocation.command_line();
        debug!("Running: {}", command);

        let mut child = Command::new(&invocation.binary)
            .args(&invocation.args)
            .current_dir(&invocation.workdir)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::SpawnFailed {
                binary: invocation.binary.display().to_string(),
                message: e.to_string(),
            })?;

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward_lines(stdout, Stream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_lines(stderr, Stream::Stderr, line_tx.clone()));
        }
        drop(line_tx);

        let (kill_tx, mut kill_rx) = oneshot::channel::<KillReply>();
        let id = Uuid::new_v4();
        self.processes.insert(
            id,
            RunningProcess {
                command: command.clone(),
                started_at: Utc::now(),
                kill: Some(kill_tx),
            },
        );
        let _registration = Registration {
            processes: &self.processes,
            id,
        };

        // Output is read until every writer closes it. After a stop the
        // child's descendants may keep the pipes open, so reading ends as
        // soon as the child itself has exited.
        let mut output = CommandOutput::default();
        let mut exited = None;
        let mut killed = false;
        let mut kill_pending = true;
        let mut lines_open = true;
        while exited.is_none() || (lines_open && !killed) {
            tokio::select! {
                line = line_rx.recv(), if lines_open => match line {
                    Some((stream, line)) => record(&mut output, stream, &line),
                    None => lines_open = false,
                },
                status = child.wait(), if exited.is_none() => exited = Some(status),
                reply = &mut kill_rx, if kill_pending && exited.is_none() => {
                    kill_pending = false;
                    if let Ok(reply) = reply {
                        killed = true;
                        reply.send(child.start_kill()).ok();
                    }
                }
            }
        }

        if killed {
            for forwarder in &forwarders {
                forwarder.abort();
            }
            while let Ok((stream, line)) = line_rx.try_recv() {
                record(&mut output, stream, &line);
            }
        }

        let status = match exited {
            Some(status) => status?,
            None => child.wait().await?,
        };
        output.code = status.code();

        self.write_log(&invocation, &output).await;

        if status.success() {
            Ok(output)
        } else {
            Err(ToolError::CommandFailed {
                command,
                code: output.code,
                output: output.tail(ERROR_TAIL_LINES),
            }
            .into())
        }
    }

    async fn stop(&self) -> Result<()> {
        let targets: Vec<(String, DateTime<Utc>, oneshot::Sender<KillReply>)> = self
            .processes
            .iter_mut()
            .filter_map(|mut entry| {
                let process = entry.value_mut();
                process
                    .kill
                    .take()
                    .map(|kill| (process.command.clone(), process.started_at, kill))
            })
            .collect();

        let mut failures = Vec::new();
        for (command, started_at, kill) in targets {
            let (reply_tx, reply_rx) = oneshot::channel();
            if kill.send(reply_tx).is_err() {
                continue;
            }
            match reply_rx.await {
                Ok(Ok(())) => info!("Stopped '{}' (running since {})", command, started_at),
                Ok(Err(e)) => failures.push(format!("{command}: {e}")),
                Err(_) => debug!("'{}' exited before it could be stopped", command),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ToolError::StopFailed {
                runner: self.tool.to_string(),
                message: failures.join("; "),
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForgeError;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn sh(workdir: &std::path::Path, script: &str) -> Invocation {
        Invocation::new("sh", workdir).arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_exec_captures_both_streams() {
        let dir = TempDir::new().expect("temp dir");
        let executor = ProcessExecutor::new("shell");

        let output = executor
            .exec(sh(dir.path(), "echo out; echo err 1>&2"))
            .await
            .expect("command succeeds");

        assert_eq!(output.code, Some(0));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(output.combined.contains("out\n"));
        assert!(output.combined.contains("err\n"));
        assert_eq!(executor.running(), 0);
    }

    #[tokio::test]
    async fn test_exec_passes_env_and_workdir() {
        let dir = TempDir::new().expect("temp dir");
        let executor = ProcessExecutor::new("shell");

        let output = executor
            .exec(sh(dir.path(), "echo $GREETING; pwd").env("GREETING", "hello"))
            .await
            .expect("command succeeds");

        let mut lines = output.stdout.lines();
        assert_eq!(lines.next(), Some("hello"));
        let pwd = std::fs::canonicalize(dir.path()).expect("canonical");
        assert_eq!(
            std::fs::canonicalize(lines.next().expect("pwd line")).expect("canonical"),
            pwd
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_command_failed() {
        let dir = TempDir::new().expect("temp dir");
        let executor = ProcessExecutor::new("shell");

        let err = executor
            .exec(sh(dir.path(), "echo boom; exit 3"))
            .await
            .expect_err("command fails");

        match err {
            ForgeError::Tool(ToolError::CommandFailed { code, output, .. }) => {
                assert_eq!(code, Some(3));
                assert!(output.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failed() {
        let dir = TempDir::new().expect("temp dir");
        let executor = ProcessExecutor::new("ghost");
        let err = executor
            .exec(Invocation::new("definitely-not-a-binary-xyz", dir.path()))
            .await
            .expect_err("spawn fails");
        assert!(matches!(err, ForgeError::Tool(ToolError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_log_file_written() {
        let dir = TempDir::new().expect("temp dir");
        let logs = dir.path().join("logs");
        let executor = ProcessExecutor::new("shell").with_log_dir(&logs);

        executor
            .exec(sh(dir.path(), "echo logged").log_as("shell-run"))
            .await
            .expect("command succeeds");

        let entries: Vec<_> = std::fs::read_dir(&logs)
            .expect("log dir exists")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].starts_with("shell-run-"));
        assert!(entries[0].ends_with(".log"));
    }

    #[tokio::test]
    async fn test_stop_kills_running_process() {
        let dir = TempDir::new().expect("temp dir");
        let executor = Arc::new(ProcessExecutor::new("shell"));

        let running = {
            let executor = Arc::clone(&executor);
            let workdir = dir.path().to_path_buf();
            tokio::spawn(async move { executor.exec(sh(&workdir, "exec sleep 30")).await })
        };

        while executor.running() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        executor.stop().await.expect("stop succeeds");

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("process ends after stop")
            .expect("task joins");
        assert!(matches!(
            result,
            Err(ForgeError::Tool(ToolError::CommandFailed { code: None, .. }))
        ));
        assert_eq!(executor.running(), 0);
    }

    #[tokio::test]
    async fn test_stop_returns_while_descendants_hold_output() {
        let dir = TempDir::new().expect("temp dir");
        let executor = Arc::new(ProcessExecutor::new("shell"));

        let running = {
            let executor = Arc::clone(&executor);
            let workdir = dir.path().to_path_buf();
            tokio::spawn(async move { executor.exec(sh(&workdir, "sleep 20; echo done")).await })
        };

        while executor.running() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        executor.stop().await.expect("stop succeeds");

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("exec returns although the sleep still holds the pipes")
            .expect("task joins");
        assert!(result.is_err());
        assert_eq!(executor.running(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_processes() {
        assert!(ProcessExecutor::new("idle").stop().await.is_ok());
    }
}
