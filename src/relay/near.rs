//! HTTP-facing orchestrator.
//!
//! Two kinds of spool file reach this node. Descriptors written by the
//! gateway are sent to the far node and removed. Chunk archives delivered by
//! the transport are extracted under `extracted/` and merged into the cache.

use crate::archive;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::merge::{self, MergeReport};
use crate::relay::RelayStats;
use crate::spool::{
    claim_stem, response_file_name, SpoolEvent, SpoolHandler, SpoolKind, StabilityGate,
    EXTRACTED_DIR,
};
use crate::transport::TransportSession;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub struct NearRelay {
    spool_dir: PathBuf,
    cache_dir: PathBuf,
    gate: StabilityGate,
    session: TransportSession,
    /// Merges touch shared cache directories; run one at a time
    merging: Mutex<()>,
    stats: RelayStats,
}

impl NearRelay {
    pub fn new(config: &RelayConfig, session: TransportSession) -> Self {
        Self {
            spool_dir: config.spool_dir.clone(),
            cache_dir: config.cache_dir(),
            gate: StabilityGate::from_config(&config.stability),
            session,
            merging: Mutex::new(()),
            stats: RelayStats::new(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Send a claimed descriptor to the far node, then drop it.
    pub async fn send_descriptor(&self, claimed: &Path) -> Result<()> {
        self.gate.await_stable(claimed).await?;
        self.session.send(claimed).await?;
        RelayStats::add(&self.stats.descriptors_sent, 1);
        tokio::fs::remove_file(claimed).await?;
        Ok(())
    }

    /// Extract a claimed chunk archive and merge it into the cache.
    ///
    /// The archive is removed only after a merge without failures; anything
    /// else leaves the archive and the staging tree in the spool.
    pub async fn receive_archive(&self, name: &str, claimed: &Path) -> Result<MergeReport> {
        self.gate.await_stable(claimed).await?;

        let response_name = response_file_name(claim_stem(claimed).unwrap_or(name));
        let response = self.spool_dir.join(&response_name);
        tokio::fs::rename(claimed, &response).await?;

        let stem = response_name.trim_end_matches(".zip");
        let staging = self.spool_dir.join(EXTRACTED_DIR).join(stem);
        let extracted = archive::extract(&response, &staging).await?;
        tracing::info!(
            archive = %response_name,
            files = extracted.files,
            "archive extracted"
        );

        let report = {
            let _merging = self.merging.lock().await;
            merge::merge(&staging, &self.cache_dir).await?
        };

        RelayStats::add(&self.stats.entries_merged, report.moved.len() as u64);
        RelayStats::add(&self.stats.merge_collisions, report.collisions() as u64);

        if report.is_clean() {
            tokio::fs::remove_file(&response).await?;
            tracing::info!(archive = %response_name, moved = report.moved.len(), "merged into cache");
        } else {
            for failure in &report.failures {
                tracing::warn!(
                    archive = %response_name,
                    path = %failure.path.display(),
                    error = %failure.error,
                    "entry not merged"
                );
            }
            tracing::warn!(
                archive = %response_name,
                moved = report.moved.len(),
                failed = report.failures.len(),
                staging = %staging.display(),
                "merge incomplete, leaving residue"
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl SpoolHandler for NearRelay {
    async fn handle(&self, event: SpoolEvent) {
        let result = match event.kind {
            SpoolKind::Outbound => self.send_descriptor(&event.claimed).await,
            SpoolKind::Delivery => {
                RelayStats::add(&self.stats.deliveries, 1);
                self.receive_archive(&event.name, &event.claimed)
                    .await
                    .map(|_| ())
            }
        };

        if let Err(e) = result {
            RelayStats::add(&self.stats.failures, 1);
            tracing::error!(file = %event.name, error = %e, "dropping spool file");
        }
        self.stats.log();
    }
}
