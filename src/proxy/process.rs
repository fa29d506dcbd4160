// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Access to the running HAProxy process.

use crate::config::ReloadStrategy;
use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::{debug, info, instrument};

#[async_trait]
pub trait ProxyProcess: Send + Sync {
    /// Send a command to the admin socket, returning the raw response
    async fn command(&self, cmd: &str) -> Result<String>;

    /// Validate a configuration file without applying it
    async fn check_config(&self, path: &Path) -> Result<()>;

    /// Start a new process with `path`, old processes finish their connections
    async fn reload(&self, strategy: ReloadStrategy, path: &Path) -> Result<()>;
}

pub struct HAProxyProcess {
    binary: PathBuf,
    admin_socket: PathBuf,
    master_socket: Option<PathBuf>,
    pid_file: PathBuf,
}

impl HAProxyProcess {
    pub fn new(
        binary: &Path,
        admin_socket: &Path,
        master_socket: Option<&Path>,
        pid_file: &Path,
    ) -> Self {
        Self {
            binary: binary.to_path_buf(),
            admin_socket: admin_socket.to_path_buf(),
            master_socket: master_socket.map(Path::to_path_buf),
            pid_file: pid_file.to_path_buf(),
        }
    }

    async fn send(socket: &Path, cmd: &str) -> Result<String> {
        let mut stream = UnixStream::connect(socket).await.map_err(|e| {
            ControllerError::ProxyCommandError(format!(
                "Failed to connect to {}: {}",
                socket.display(),
                e
            ))
        })?;
        stream.write_all(format!("{}\n", cmd).as_bytes()).await?;
        stream.shutdown().await?;

        let mut response = String::new();
        stream.read_to_string(&mut response).await?;
        Ok(response)
    }

    async fn old_pid(&self) -> Option<String> {
        let pid = tokio::fs::read_to_string(&self.pid_file).await.ok()?;
        let pid = pid.trim();
        (!pid.is_empty()).then(|| pid.to_string())
    }
}

fn check_output(what: &str, output: Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(ControllerError::ProxyCommandError(format!(
        "{} failed ({}): {}",
        what,
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

#[async_trait]
impl ProxyProcess for HAProxyProcess {
    async fn command(&self, cmd: &str) -> Result<String> {
        debug!("Sending '{}' to {}", cmd, self.admin_socket.display());
        Self::send(&self.admin_socket, cmd).await
    }

    #[instrument(skip(self))]
    async fn check_config(&self, path: &Path) -> Result<()> {
        let output = Command::new(&self.binary)
            .arg("-c")
            .arg("-f")
            .arg(path)
            .output()
            .await?;
        check_output("Configuration check", output)
    }

    #[instrument(skip(self))]
    async fn reload(&self, strategy: ReloadStrategy, path: &Path) -> Result<()> {
        if let Some(master) = &self.master_socket {
            let response = Self::send(master, "reload").await?;
            info!("Proxy reloaded through the master socket");
            debug!("Master socket response: {}", response.trim());
            return Ok(());
        }

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-f").arg(path).arg("-p").arg(&self.pid_file).arg("-D");
        if strategy == ReloadStrategy::ReuseSocket && self.admin_socket.exists() {
            cmd.arg("-x").arg(&self.admin_socket);
        }
        if let Some(pid) = self.old_pid().await {
            cmd.arg("-sf").arg(pid);
        }

        check_output("Reload", cmd.output().await?)?;
        info!("Proxy reloaded with strategy {}", strategy);
        Ok(())
    }
}
