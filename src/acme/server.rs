// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Local control socket accepting certificate check requests.
//!
//! The protocol is line based: `check` runs a certificate check and answers
//! `ok <count>` or `error <message>`.

use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Reason recorded for checks requested over the socket
pub const EXTERNAL_CALL: &str = "external call";

#[async_trait]
pub trait AcmeTrigger: Send + Sync {
    /// Run a certificate check, returning the number of enqueued certificates
    async fn check(&self, reason: &str) -> Result<usize>;
}

pub struct AcmeServer {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl AcmeServer {
    /// Bind the control socket, replacing a stale socket file
    pub fn bind(socket_path: &Path) -> Result<Self> {
        let bind_error = |source| ControllerError::AcmeSocketError {
            path: socket_path.to_path_buf(),
            source,
        };
        if socket_path.exists() {
            std::fs::remove_file(socket_path).map_err(bind_error)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(bind_error)?;
        }
        let listener = UnixListener::bind(socket_path).map_err(bind_error)?;

        info!("Acme control socket listening on {}", socket_path.display());
        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            listener,
        })
    }

    /// Serve requests until `stop` is cancelled. Open connections are closed
    /// and joined before returning.
    pub async fn serve(self, trigger: Arc<dyn AcmeTrigger>, stop: CancellationToken) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    log_join(joined);
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let trigger = trigger.clone();
                        let stop = stop.clone();
                        connections.spawn(async move {
                            let handled = handle_connection(stream, trigger.as_ref(), &stop).await;
                            if let Err(e) = handled {
                                error!("Error handling acme control connection: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept acme control connection: {}", e),
                },
            }
        }

        while let Some(joined) = connections.join_next().await {
            log_join(joined);
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!("Failed to remove {}: {}", self.socket_path.display(), e);
        }
        info!("Acme control socket stopped");
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        error!("Acme control connection task failed: {}", e);
    }
}

async fn handle_connection(
    stream: UnixStream,
    trigger: &dyn AcmeTrigger,
    stop: &CancellationToken,
) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            _ = stop.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        let response = match line.trim() {
            "" => continue,
            "check" => match trigger.check(EXTERNAL_CALL).await {
                Ok(count) => format!("ok {}\n", count),
                Err(e) => format!("error {}\n", e),
            },
            other => format!("error unknown command '{}'\n", other),
        };
        write.write_all(response.as_bytes()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTrigger {
        reasons: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AcmeTrigger for RecordingTrigger {
        async fn check(&self, reason: &str) -> Result<usize> {
            self.reasons.lock().unwrap().push(reason.to_string());
            Ok(2)
        }
    }

    async fn request(path: &Path, body: &str) -> String {
        let mut stream = UnixStream::connect(path).await.unwrap();
        stream.write_all(body.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut response = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut response)
            .await
            .unwrap();
        response
    }

    #[tokio::test]
    async fn test_check_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme.sock");
        let server = AcmeServer::bind(&path).unwrap();
        let trigger = Arc::new(RecordingTrigger::default());
        let stop = CancellationToken::new();
        let handle = tokio::spawn(server.serve(trigger.clone(), stop.clone()));

        let response = request(&path, "check\nbogus\n").await;

        assert_eq!(response, "ok 2\nerror unknown command 'bogus'\n");
        assert_eq!(*trigger.reasons.lock().unwrap(), vec![EXTERNAL_CALL.to_string()]);

        stop.cancel();
        handle.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stop_closes_idle_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme.sock");
        let server = AcmeServer::bind(&path).unwrap();
        let stop = CancellationToken::new();
        let trigger = Arc::new(RecordingTrigger::default());
        let handle = tokio::spawn(server.serve(trigger, stop.clone()));

        let mut idle = UnixStream::connect(&path).await.unwrap();
        idle.write_all(b"check\n").await.unwrap();
        let mut reply = [0u8; 5];
        tokio::io::AsyncReadExt::read_exact(&mut idle, &mut reply).await.unwrap();
        assert_eq!(&reply, b"ok 2\n");

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap();

        let mut rest = Vec::new();
        let read = tokio::io::AsyncReadExt::read_to_end(&mut idle, &mut rest).await.unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme.sock");
        std::fs::write(&path, "").unwrap();

        assert!(AcmeServer::bind(&path).is_ok());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();

        let err = AcmeServer::bind(&blocker.join("acme.sock")).err().unwrap();

        assert!(matches!(err, ControllerError::AcmeSocketError { .. }));
    }
}
