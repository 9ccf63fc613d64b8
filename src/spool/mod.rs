//! Spool directory conventions.
//!
//! The spool is the only handoff point between this process and the external
//! transport agent. Everything that happens to a spool file is driven by its
//! name:
//!
//! ```text
//! testfile*                        inbound transport delivery
//! <name>_<ms>_<seq>_processing     claimed by a monitor, mid-read
//! request_<ts>_<id>.txt            outbound descriptor written by the gateway
//! response_<claim>.zip             claimed delivery awaiting extraction (near)
//! processed_<id>_<index>.zip       one chunk of fetched content (far)
//! download_<ms>_<id>/              fetch scratch (far)
//! divided_<ms>_<id>/               chunk scratch (far)
//! extracted/                       extraction staging root (near)
//! ```
//!
//! Claiming a file is an atomic rename to a fresh `_processing` name. Nothing
//! else coordinates two monitors looking at the same directory. The transport
//! agent reuses delivery names, so the claim name carries the claim time and a
//! sequence number to keep a second `testfile1` from landing on the first.

pub mod monitor;
pub mod stability;

use crate::descriptor::RequestId;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::fs;

pub use monitor::{SpoolEvent, SpoolHandler, SpoolMonitor};
pub use stability::{Stabilized, StabilityGate};

pub const DELIVERY_PREFIX: &str = "testfile";
pub const OUTBOUND_PREFIX: &str = "request_";
pub const PROCESSING_SUFFIX: &str = "_processing";
pub const EXTRACTED_DIR: &str = "extracted";

/// What a spool file name says about its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoolKind {
    /// Written into the spool by the transport agent
    Delivery,
    /// Descriptor written locally, waiting to be sent
    Outbound,
}

/// Classify a spool file name. Claimed names and unknown names yield `None`.
pub fn classify(name: &str) -> Option<SpoolKind> {
    if name.contains(PROCESSING_SUFFIX) {
        return None;
    }
    if name.starts_with(DELIVERY_PREFIX) {
        Some(SpoolKind::Delivery)
    } else if name.starts_with(OUTBOUND_PREFIX) {
        Some(SpoolKind::Outbound)
    } else {
        None
    }
}

// =============================================================================
// Names
// =============================================================================

pub fn request_file_name(now: DateTime<Utc>, id: &RequestId) -> String {
    let ts = now
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace(':', "-");
    format!("{OUTBOUND_PREFIX}{ts}_{id}.txt")
}

/// Name for a claimed delivery about to be extracted, built from its claim
/// stem so two claims of the same delivery name stay apart.
pub fn response_file_name(claim_stem: &str) -> String {
    format!("response_{claim_stem}.zip")
}

pub fn chunk_file_name(id: &RequestId, index: usize) -> String {
    format!("processed_{id}_{index}.zip")
}

pub fn download_dir_name(epoch_ms: i64, id: &RequestId) -> String {
    format!("download_{epoch_ms}_{id}")
}

pub fn divided_dir_name(epoch_ms: i64, id: &RequestId) -> String {
    format!("divided_{epoch_ms}_{id}")
}

/// `<path>_<epoch_ms>_<seq>_processing`
pub fn processing_path(path: &Path, epoch_ms: i64, seq: u64) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!("_{epoch_ms}_{seq}{PROCESSING_SUFFIX}"));
    PathBuf::from(name)
}

/// Claimed file name without the `_processing` suffix.
pub fn claim_stem(claimed: &Path) -> Option<&str> {
    claimed
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(PROCESSING_SUFFIX))
}

// =============================================================================
// Claim
// =============================================================================

static CLAIM_SEQ: AtomicU64 = AtomicU64::new(0);

/// Claim a spool file by renaming it to a fresh `_processing` name.
///
/// Returns the claimed path, or `None` if the file was already gone: another
/// monitor won the race, which is not an error. The target name is unique per
/// claim, so the rename never replaces an earlier claim of a reused name.
pub async fn try_claim(path: &Path) -> io::Result<Option<PathBuf>> {
    let claimed = processing_path(
        path,
        Utc::now().timestamp_millis(),
        CLAIM_SEQ.fetch_add(1, Ordering::Relaxed),
    );
    match fs::rename(path, &claimed).await {
        Ok(()) => Ok(Some(claimed)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Dedupe
// =============================================================================

/// Names dispatched and not yet confirmed consumed.
///
/// Bounded by `capacity` and by `ttl`: the oldest names fall out first. This is
/// only an in-flight filter for duplicate events; the claim rename is what
/// guarantees a file is processed once.
#[derive(Debug)]
pub struct DedupeSet {
    entries: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
    capacity: usize,
    ttl: Duration,
}

impl DedupeSet {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Record `name`. Returns false if it is already present.
    pub fn insert(&mut self, name: &str) -> bool {
        self.insert_at(name, Instant::now())
    }

    pub fn insert_at(&mut self, name: &str, now: Instant) -> bool {
        self.evict_expired(now);
        if self.entries.contains_key(name) {
            return false;
        }
        while self.entries.len() >= self.capacity {
            if !self.pop_oldest() {
                break;
            }
        }
        self.entries.insert(name.to_string(), now);
        self.order.push_back((name.to_string(), now));
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Forget `name` once the file behind it is consumed or gone.
    pub fn remove(&mut self, name: &str) {
        self.entries.remove(name);
        // Stale entries in `order` are skipped when popped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((_, inserted)) = self.order.front() {
            if now.saturating_duration_since(*inserted) < self.ttl {
                break;
            }
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) -> bool {
        match self.order.pop_front() {
            Some((name, inserted)) => {
                if self.entries.get(&name) == Some(&inserted) {
                    self.entries.remove(&name);
                }
                true
            }
            None => false,
        }
    }
}
