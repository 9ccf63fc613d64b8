//! Command-line bundle transport.
//!
//! Drives the agent's receive and send programs (`bprecvfile` /
//! `bpsendfile` by default). The listener runs with the spool as its working
//! directory, which is where it drops delivered files.

use crate::config::{Endpoints, TransportConfig};
use crate::error::{RelayError, Result};
use crate::transport::Transport;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

pub struct BundleTransport {
    spool_dir: PathBuf,
    recv_command: String,
    send_command: String,
    endpoints: Endpoints,
    listener: Mutex<Option<Child>>,
}

impl BundleTransport {
    pub fn new(spool_dir: impl Into<PathBuf>, config: &TransportConfig, endpoints: Endpoints) -> Self {
        Self {
            spool_dir: spool_dir.into(),
            recv_command: config.recv_command.clone(),
            send_command: config.send_command.clone(),
            endpoints,
            listener: Mutex::new(None),
        }
    }

    fn transport_error(&self, command: &str, reason: impl ToString) -> RelayError {
        RelayError::Transport {
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Transport for BundleTransport {
    async fn start_listening(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;

        if let Some(child) = listener.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => {
                    tracing::info!(%status, "previous listener exited");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to poll previous listener");
                }
            }
        }

        let mut cmd = Command::new(&self.recv_command);
        cmd.arg(&self.endpoints.listen);
        cmd.current_dir(&self.spool_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| self.transport_error(&self.recv_command, format!("spawn failed: {e}")))?;

        tracing::info!(
            command = %self.recv_command,
            endpoint = %self.endpoints.listen,
            pid = ?child.id(),
            "started listening session"
        );
        *listener = Some(child);
        Ok(())
    }

    async fn cancel(&self) {
        let Some(mut child) = self.listener.lock().await.take() else {
            return;
        };

        match child.try_wait() {
            // Finished on its own before we got here
            Ok(Some(status)) => {
                tracing::info!(%status, "listener already exited");
            }
            Ok(None) => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "failed to kill listener");
                    return;
                }
                match child.wait().await {
                    Ok(status) => tracing::info!(%status, "listener cancelled"),
                    Err(e) => tracing::warn!(error = %e, "failed to reap listener"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to poll listener");
            }
        }
    }

    async fn send(&self, file: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.send_command);
        cmd.arg(&self.endpoints.source);
        cmd.arg(&self.endpoints.destination);
        cmd.arg(file);
        cmd.current_dir(&self.spool_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .map_err(|e| self.transport_error(&self.send_command, format!("spawn failed: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(self.transport_error(
                &self.send_command,
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }
        if !stderr.trim().is_empty() {
            tracing::warn!(command = %self.send_command, stderr = %stderr.trim(), "send stderr");
        }
        tracing::debug!(
            command = %self.send_command,
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "send command finished"
        );
        Ok(())
    }

    async fn is_listening(&self) -> bool {
        match self.listener.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}
