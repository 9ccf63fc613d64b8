//! Transport session management.
//!
//! The bundle transport agent is an external program. It cannot receive and
//! send at the same time, so every send cancels the receive listener first and
//! restarts it afterwards. Cancelling is cleanup only: deliveries are observed
//! through the spool monitor whether or not a listener handle is still open.

pub mod bundle;

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use bundle::BundleTransport;

/// Operations on the external store-and-forward agent.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the receive listener unless one is already running.
    async fn start_listening(&self) -> Result<()>;

    /// Stop the receive listener. A listener that already exited is fine.
    async fn cancel(&self);

    /// Hand one file to the agent for delivery to the peer.
    async fn send(&self, file: &Path) -> Result<()>;

    async fn is_listening(&self) -> bool;
}

/// Serializes sends against the listener session.
#[derive(Clone)]
pub struct TransportSession {
    transport: Arc<dyn Transport>,
    exclusive: Arc<Mutex<()>>,
}

impl TransportSession {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            exclusive: Arc::new(Mutex::new(())),
        }
    }

    pub async fn start_listening(&self) -> Result<()> {
        let _guard = self.exclusive.lock().await;
        self.transport.start_listening().await
    }

    pub async fn cancel(&self) {
        let _guard = self.exclusive.lock().await;
        self.transport.cancel().await;
    }

    /// Cancel the listener, send `file`, then listen again.
    ///
    /// A failure to restart the listener is logged; the send result is what
    /// the caller gets.
    pub async fn send(&self, file: &Path) -> Result<()> {
        let _guard = self.exclusive.lock().await;

        if self.transport.is_listening().await {
            tracing::info!("cancelling listener for outbound send");
        }
        self.transport.cancel().await;

        let result = self.transport.send(file).await;
        match &result {
            Ok(()) => tracing::info!(file = %file.display(), "sent"),
            Err(e) => tracing::error!(file = %file.display(), error = %e, "send failed"),
        }

        if let Err(e) = self.transport.start_listening().await {
            tracing::warn!(error = %e, "failed to restart listener after send");
        }
        result
    }

    pub async fn is_listening(&self) -> bool {
        self.transport.is_listening().await
    }
}
