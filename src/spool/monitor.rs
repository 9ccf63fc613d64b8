//! Spool monitor.
//!
//! Watches one spool directory, classifies new names, claims matching files and
//! hands them to a [`SpoolHandler`]. Each claimed file runs in its own task so
//! a slow stability wait or a stuck fetch never holds up other arrivals.

use crate::config::DedupeConfig;
use crate::spool::{classify, try_claim, DedupeSet, SpoolKind};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;

/// A claimed spool file ready for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolEvent {
    pub kind: SpoolKind,
    /// Name the file arrived under
    pub name: String,
    /// Path after the claim rename
    pub claimed: PathBuf,
}

/// Receives claimed files. Implementations log and drop their own failures.
#[async_trait]
pub trait SpoolHandler: Send + Sync {
    async fn handle(&self, event: SpoolEvent);
}

pub struct SpoolMonitor {
    spool_dir: PathBuf,
    dispatched: Mutex<DedupeSet>,
}

impl SpoolMonitor {
    pub fn new(spool_dir: impl Into<PathBuf>, dedupe: &DedupeConfig) -> Self {
        Self {
            spool_dir: spool_dir.into(),
            dispatched: Mutex::new(DedupeSet::new(
                dedupe.capacity,
                Duration::from_secs(dedupe.ttl_secs),
            )),
        }
    }

    /// React to one observed file name.
    ///
    /// Returns an event only if this call classified the name, found a file
    /// not yet dispatched under it, and won the claim rename.
    ///
    /// A dispatched file is renamed before its event is returned, so a file
    /// still present under a dispatched name is a new delivery reusing it.
    pub async fn observe(&self, name: &str) -> Option<SpoolEvent> {
        let kind = match classify(name) {
            Some(kind) => kind,
            None => {
                tracing::trace!(file = name, "ignoring spool entry");
                return None;
            }
        };

        let path = self.spool_dir.join(name);
        let fresh = self.dispatched().insert(name);
        if !fresh {
            if tokio::fs::symlink_metadata(&path).await.is_err() {
                tracing::debug!(file = name, "already dispatched, ignoring duplicate event");
                return None;
            }
            tracing::debug!(file = name, "dispatched name reused by a new delivery");
        }

        match try_claim(&path).await {
            Ok(Some(claimed)) => {
                tracing::info!(file = name, claimed = %claimed.display(), "claimed spool file");
                Some(SpoolEvent {
                    kind,
                    name: name.to_string(),
                    claimed,
                })
            }
            Ok(None) => {
                tracing::debug!(file = name, "file gone before claim, lost race");
                if fresh {
                    self.dispatched().remove(name);
                }
                None
            }
            Err(e) => {
                tracing::warn!(file = name, error = %e, "failed to claim spool file");
                if fresh {
                    self.dispatched().remove(name);
                }
                None
            }
        }
    }

    /// Mark a dispatched name as consumed so the transport may reuse it.
    pub fn consumed(&self, name: &str) {
        self.dispatched().remove(name);
    }

    /// Claim every matching file currently in the spool, in name order.
    pub async fn rescan(&self) -> Result<Vec<SpoolEvent>> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.spool_dir)
            .await
            .with_context(|| format!("Failed to read spool {}", self.spool_dir.display()))?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();

        let mut events = Vec::new();
        for name in names {
            if let Some(event) = self.observe(&name).await {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Watch the spool until `shutdown` resolves, dispatching every claimed
    /// file to `handler` on its own task.
    pub async fn run<H, S>(self: Arc<Self>, handler: Arc<H>, shutdown: S) -> Result<()>
    where
        H: SpoolHandler + 'static,
        S: Future<Output = ()>,
    {
        tokio::fs::create_dir_all(&self.spool_dir)
            .await
            .with_context(|| format!("Failed to create spool {}", self.spool_dir.display()))?;

        let mut names = self.subscribe()?;
        let mut tasks = JoinSet::new();

        // Files delivered while we were down
        for event in self.rescan().await? {
            self.spawn_handler(&mut tasks, &handler, event);
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(spool = %self.spool_dir.display(), "monitor shutting down");
                    break;
                }
                name = names.recv() => {
                    let Some(name) = name else {
                        anyhow::bail!("Spool event source closed");
                    };
                    if let Some(event) = self.observe(&name).await {
                        self.spawn_handler(&mut tasks, &handler, event);
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "spool handler task failed");
                    }
                }
            }
        }

        tasks.shutdown().await;
        Ok(())
    }

    fn spawn_handler<H>(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        handler: &Arc<H>,
        event: SpoolEvent,
    ) where
        H: SpoolHandler + 'static,
    {
        let monitor = Arc::clone(self);
        let handler = Arc::clone(handler);
        tasks.spawn(async move {
            let name = event.name.clone();
            handler.handle(event).await;
            monitor.consumed(&name);
        });
    }

    fn dispatched(&self) -> std::sync::MutexGuard<'_, DedupeSet> {
        self.dispatched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stream of file names appearing in the spool, from directory events.
    #[cfg(feature = "watch")]
    fn subscribe(&self) -> Result<NameStream> {
        use notify::{RecursiveMode, Watcher};

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        // Use unbounded channel: the notify callback runs on its own thread
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if !is_arrival(&event.kind) {
                        return;
                    }
                    // Renames report [from, to]; only the last path is new
                    if let Some(name) = event
                        .paths
                        .last()
                        .and_then(|p| p.file_name())
                        .and_then(|n| n.to_str())
                    {
                        let _ = tx.send(name.to_string());
                    }
                }
                Err(e) => tracing::warn!(error = %e, "spool watch error"),
            }
        })
        .context("Failed to create spool watcher")?;

        watcher
            .watch(&self.spool_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", self.spool_dir.display()))?;

        tracing::info!(spool = %self.spool_dir.display(), "watching spool");
        Ok(NameStream {
            rx,
            _watcher: watcher,
        })
    }

    /// Without directory events, poll the spool listing instead.
    #[cfg(not(feature = "watch"))]
    fn subscribe(&self) -> Result<NameStream> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let spool_dir = self.spool_dir.clone();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(POLL_INTERVAL);
            loop {
                tick.tick().await;
                let Ok(mut dir) = tokio::fs::read_dir(&spool_dir).await else {
                    continue;
                };
                while let Ok(Some(entry)) = dir.next_entry().await {
                    if let Some(name) = entry.file_name().to_str() {
                        if classify(name).is_some() && tx.send(name.to_string()).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        tracing::info!(spool = %self.spool_dir.display(), "polling spool");
        Ok(NameStream {
            rx,
            _poller: PollerGuard(task),
        })
    }
}

#[cfg(not(feature = "watch"))]
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[cfg(feature = "watch")]
fn is_arrival(kind: &notify::EventKind) -> bool {
    use notify::event::{ModifyKind, RenameMode};
    use notify::EventKind;

    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Name(
                RenameMode::To | RenameMode::Both | RenameMode::Any
            ))
    )
}

/// Names observed in the spool. Keeps the event source alive while held.
struct NameStream {
    rx: tokio::sync::mpsc::UnboundedReceiver<String>,
    #[cfg(feature = "watch")]
    _watcher: notify::RecommendedWatcher,
    #[cfg(not(feature = "watch"))]
    _poller: PollerGuard,
}

impl NameStream {
    async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

#[cfg(not(feature = "watch"))]
struct PollerGuard(tokio::task::JoinHandle<()>);

#[cfg(not(feature = "watch"))]
impl Drop for PollerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}
