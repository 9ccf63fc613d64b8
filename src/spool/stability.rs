//! Stability gate.
//!
//! The transport agent writes deliveries from its own process and the directory
//! event can fire before it is done. A file counts as complete once two
//! consecutive size polls agree. This is a heuristic: a writer that stalls for
//! longer than one poll interval will still be read early.

use crate::config::StabilityConfig;
use crate::error::{RelayError, Result};
use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Outcome of a successful wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stabilized {
    pub size: u64,
    pub polls: u32,
}

#[derive(Debug, Clone)]
pub struct StabilityGate {
    poll_interval: Duration,
    max_attempts: u32,
}

impl StabilityGate {
    pub fn new(poll_interval: Duration, max_attempts: u32) -> Self {
        Self {
            poll_interval,
            max_attempts,
        }
    }

    pub fn from_config(config: &StabilityConfig) -> Self {
        Self::new(config.poll_interval(), config.max_attempts)
    }

    /// Wait until the size of `path` stops changing.
    pub async fn await_stable(&self, path: &Path) -> Result<Stabilized> {
        let probe = move || async move { tokio::fs::metadata(path).await.map(|m| m.len()) };
        self.await_stable_with(path, probe).await
    }

    /// Same as [`await_stable`](Self::await_stable) with a caller-supplied size
    /// probe. `path` is only used for the error.
    pub async fn await_stable_with<F, Fut>(&self, path: &Path, mut probe: F) -> Result<Stabilized>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<u64>>,
    {
        let mut previous = None;

        for poll in 1..=self.max_attempts {
            let size = probe().await?;
            if previous == Some(size) {
                tracing::debug!(file = %path.display(), size, polls = poll, "size stable");
                return Ok(Stabilized { size, polls: poll });
            }
            previous = Some(size);

            if poll < self.max_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        Err(RelayError::NotStabilized {
            path: path.to_path_buf(),
            attempts: self.max_attempts,
        })
    }
}
