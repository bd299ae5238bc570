//! VPN agent runner.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{ForgeError, Result, ToolError};

use super::{CommandExecutor, Invocation, Runner};

/// Starts and stops an `OpenVPN` client daemon.
pub struct VpnRunner {
    executor: Arc<dyn CommandExecutor>,
    binary: PathBuf,
    workdir: PathBuf,
}

impl VpnRunner {
    /// Creates a runner executing `binary` in `workdir`.
    #[must_use]
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        binary: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            binary: binary.into(),
            workdir: workdir.into(),
        }
    }

    /// Connects using `config`, recording the daemon pid in `pid_file`.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be started.
    pub async fn connect(&self, config: &Path, pid_file: &Path) -> Result<()> {
        if pid_file.exists() {
            info!("VPN already connected (pid file {})", pid_file.display());
            return Ok(());
        }

        info!("Connecting VPN with {}", config.display());
        self.executor
            .exec(
                Invocation::new(&self.binary, &self.workdir)
                    .arg("--config")
                    .arg(config.display().to_string())
                    .arg("--daemon")
                    .arg("--writepid")
                    .arg(pid_file.display().to_string())
                    .log_as("openvpn-connect"),
            )
            .await?;
        Ok(())
    }

    /// Terminates the daemon recorded in `pid_file`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pid file is invalid or the daemon cannot be
    /// signalled.
    pub async fn disconnect(&self, pid_file: &Path) -> Result<()> {
        let content = match tokio::fs::read_to_string(pid_file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("No VPN pid file at {}, nothing to disconnect", pid_file.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let pid: u32 = content.trim().parse().map_err(|_| {
            ForgeError::Tool(ToolError::InvalidOutput {
                binary: String::from("openvpn"),
                message: format!("invalid pid file {}", pid_file.display()),
            })
        })?;

        info!("Disconnecting VPN (pid {})", pid);
        self.executor
            .exec(
                Invocation::new("kill", &self.workdir)
                    .arg(pid.to_string())
                    .log_as("openvpn-disconnect"),
            )
            .await?;
        tokio::fs::remove_file(pid_file).await?;
        Ok(())
    }
}

#[async_trait]
impl Runner for VpnRunner {
    fn tool(&self) -> &'static str {
        "openvpn"
    }

    fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::SpyExecutor;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_connect_runs_daemon_once() {
        let dir = TempDir::new().expect("temp dir");
        let spy = Arc::new(SpyExecutor::new());
        let runner = VpnRunner::new(spy.clone(), "openvpn", dir.path());
        let pid_file = dir.path().join("vpn.pid");

        runner.connect(Path::new("client.ovpn"), &pid_file).await.expect("connect");
        assert!(spy.calls()[0].args.contains(&String::from("--daemon")));

        std::fs::write(&pid_file, "4242\n").expect("write pid");
        runner.connect(Path::new("client.ovpn"), &pid_file).await.expect("already connected");
        assert_eq!(spy.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_kills_pid() {
        let dir = TempDir::new().expect("temp dir");
        let spy = Arc::new(SpyExecutor::new());
        let runner = VpnRunner::new(spy.clone(), "openvpn", dir.path());
        let pid_file = dir.path().join("vpn.pid");
        std::fs::write(&pid_file, "4242\n").expect("write pid");

        runner.disconnect(&pid_file).await.expect("disconnect");
        assert_eq!(spy.calls()[0].args, vec![String::from("4242")]);
        assert!(!pid_file.exists());

        runner.disconnect(&pid_file).await.expect("nothing to do");
    }
}
