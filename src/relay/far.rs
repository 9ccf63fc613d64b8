//! Internet-facing orchestrator.
//!
//! Per delivered descriptor: wait for the file to settle, decode it, fetch the
//! URL into a scratch tree, divide the tree into budget-sized chunks and send
//! each chunk archive back to the near node. The request is fire-and-forget
//! once the last chunk is handed to the transport.

use crate::archive;
use crate::chunker::Chunker;
use crate::config::RelayConfig;
use crate::descriptor::RequestDescriptor;
use crate::error::Result;
use crate::fetch::Fetcher;
use crate::relay::RelayStats;
use crate::spool::{
    chunk_file_name, divided_dir_name, download_dir_name, SpoolEvent, SpoolHandler, SpoolKind,
    StabilityGate,
};
use crate::transport::TransportSession;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct FarRelay {
    spool_dir: PathBuf,
    gate: StabilityGate,
    chunker: Chunker,
    fetcher: Arc<dyn Fetcher>,
    session: TransportSession,
    keep_scratch: bool,
    stats: RelayStats,
}

/// Scratch left behind by one request
#[derive(Debug, Default)]
struct Scratch {
    dirs: Vec<PathBuf>,
    archives: Vec<PathBuf>,
}

impl FarRelay {
    pub fn new(config: &RelayConfig, fetcher: Arc<dyn Fetcher>, session: TransportSession) -> Self {
        Self {
            spool_dir: config.spool_dir.clone(),
            gate: StabilityGate::from_config(&config.stability),
            chunker: Chunker::new(config.chunk_budget_kib),
            fetcher,
            session,
            keep_scratch: config.keep_scratch,
            stats: RelayStats::new(),
        }
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Handle one claimed descriptor delivery. Returns the chunk archives sent.
    pub async fn relay_request(&self, claimed: &Path) -> Result<Vec<PathBuf>> {
        self.gate.await_stable(claimed).await?;

        let raw = tokio::fs::read(claimed).await?;
        let descriptor = RequestDescriptor::decode(&String::from_utf8_lossy(&raw))?;
        let id = &descriptor.request_id;
        tracing::info!(url = %descriptor.url, request_id = %id, "descriptor received");

        let started = chrono::Utc::now().timestamp_millis();
        let download = self.spool_dir.join(download_dir_name(started, id));
        let divided = self.spool_dir.join(divided_dir_name(started, id));
        let mut scratch = Scratch {
            dirs: vec![download.clone(), divided.clone()],
            archives: Vec::new(),
        };

        tokio::fs::create_dir_all(&download).await?;
        self.fetcher.fetch(&descriptor.url, &download).await?;

        let chunks = self.chunker.divide(&download, &divided).await?;
        let total = chunks.len();
        tracing::info!(request_id = %id, chunks = total, "content divided");

        for chunk in &chunks {
            let out = self.spool_dir.join(chunk_file_name(id, chunk.index));
            scratch.archives.push(out.clone());

            let summary = archive::archive(&chunk.root, &out).await?;
            tracing::info!(
                request_id = %id,
                chunk = chunk.index,
                of = total,
                entries = summary.entries,
                archive_bytes = summary.archive_bytes,
                digest = %summary.digest,
                "sending chunk"
            );

            self.session.send(&out).await?;
            RelayStats::add(&self.stats.chunks_sent, 1);
        }

        // Consumed; the claim name is never reused
        tokio::fs::remove_file(claimed).await?;
        if self.keep_scratch {
            tracing::debug!(request_id = %id, "keeping scratch");
        } else {
            remove_scratch(&scratch).await;
        }

        tracing::info!(url = %descriptor.url, request_id = %id, chunks = total, "request relayed");
        Ok(scratch.archives)
    }
}

#[async_trait]
impl SpoolHandler for FarRelay {
    async fn handle(&self, event: SpoolEvent) {
        match event.kind {
            SpoolKind::Delivery => {
                RelayStats::add(&self.stats.deliveries, 1);
                if let Err(e) = self.relay_request(&event.claimed).await {
                    RelayStats::add(&self.stats.failures, 1);
                    tracing::error!(file = %event.name, error = %e, "dropping request");
                }
            }
            SpoolKind::Outbound => {
                tracing::warn!(
                    file = %event.name,
                    "outbound descriptor in far spool, leaving it claimed"
                );
            }
        }
        self.stats.log();
    }
}

async fn remove_scratch(scratch: &Scratch) {
    for dir in &scratch.dirs {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to remove scratch directory");
        }
    }
    for file in &scratch.archives {
        if let Err(e) = tokio::fs::remove_file(file).await {
            tracing::warn!(file = %file.display(), error = %e, "failed to remove chunk archive");
        }
    }
}
