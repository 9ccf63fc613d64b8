//! Request gateway for the HTTP-facing node.
//!
//! Resolves a requested URL in two phases. A URL whose content is in the
//! mirrored cache is served from it. Otherwise a descriptor is written to the
//! spool, where the monitor picks it up and sends it, and the caller gets a
//! correlation token to come back with. Repeat requests inside the pending
//! window get the same token without a second descriptor.

use crate::chunker::collect_files;
use crate::descriptor::{RequestDescriptor, RequestId};
use crate::error::{RelayError, Result};
use crate::spool::request_file_name;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use url::Url;

pub const INDEX_FILE: &str = "index.html";

/// Outcome of resolving one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Resolution {
    /// Cached content to return as-is
    Served { path: PathBuf },
    /// A descriptor was just written
    Accepted {
        token: RequestId,
        descriptor: PathBuf,
    },
    /// A descriptor for this URL is already on its way
    Pending { token: RequestId },
}

impl Resolution {
    /// HTTP status the front end answers with
    pub fn status(&self) -> u16 {
        match self {
            Resolution::Served { .. } => 200,
            Resolution::Accepted { .. } | Resolution::Pending { .. } => 202,
        }
    }

    pub fn token(&self) -> Option<&RequestId> {
        match self {
            Resolution::Served { .. } => None,
            Resolution::Accepted { token, .. } | Resolution::Pending { token } => Some(token),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingRequest {
    token: RequestId,
    issued: Instant,
}

pub struct Gateway {
    spool_dir: PathBuf,
    cache_dir: PathBuf,
    pending_ttl: Duration,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl Gateway {
    pub fn new(spool_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>, pending_ttl: Duration) -> Self {
        Self {
            spool_dir: spool_dir.into(),
            cache_dir: cache_dir.into(),
            pending_ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &crate::config::RelayConfig) -> Self {
        Self::new(&config.spool_dir, config.cache_dir(), config.pending_ttl())
    }

    /// Resolve `raw_url` against the cache, issuing a descriptor on a miss.
    pub async fn resolve(&self, raw_url: &str) -> Result<Resolution> {
        let url = parse_request_url(raw_url)?;
        let key = cache_key(&url)?;

        let cache_dir = self.cache_dir.clone();
        let lookup = tokio::task::spawn_blocking(move || cache_lookup(&cache_dir, &key))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if let Some(path) = lookup {
            tracing::info!(url = %url, file = %path.display(), "serving from cache");
            self.pending().remove(url.as_str());
            return Ok(Resolution::Served { path });
        }

        if let Some(token) = self.pending_token(url.as_str(), Instant::now()) {
            tracing::debug!(url = %url, token = %token, "request already pending");
            return Ok(Resolution::Pending { token });
        }

        let token = RequestId::generate();
        let descriptor = RequestDescriptor::new(url.as_str(), token.clone());
        let spool_dir = self.spool_dir.clone();
        let path = tokio::task::spawn_blocking(move || write_descriptor(&spool_dir, &descriptor))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        self.pending().insert(
            url.as_str().to_string(),
            PendingRequest {
                token: token.clone(),
                issued: Instant::now(),
            },
        );
        tracing::info!(url = %url, token = %token, file = %path.display(), "descriptor written");
        Ok(Resolution::Accepted {
            token,
            descriptor: path,
        })
    }

    /// Number of URLs awaiting content
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    fn pending_token(&self, url: &str, now: Instant) -> Option<RequestId> {
        let mut pending = self.pending();
        let ttl = self.pending_ttl;
        // Expired entries let the URL be requested again
        pending.retain(|_, p| now.saturating_duration_since(p.issued) < ttl);
        pending.get(url).map(|p| p.token.clone())
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_request_url(raw: &str) -> Result<Url> {
    let invalid = |reason: &str| RelayError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw.trim()).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("only http and https are relayed"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(url)
}

/// Cache-relative path for `url`: `<host>[:port]/<decoded path>`, laid out the
/// way the fetch utility mirrors it.
fn cache_key(url: &Url) -> Result<PathBuf> {
    let host = url.host_str().unwrap_or_default();
    let mut key = PathBuf::from(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    });

    let decoded = percent_decode_str(url.path()).decode_utf8_lossy();
    for segment in decoded.split('/') {
        match segment {
            "" | "." | ".." => continue,
            s if s.contains('\0') || s.contains('\\') => {
                return Err(RelayError::InvalidUrl {
                    url: url.to_string(),
                    reason: format!("unsafe path segment {s:?}"),
                });
            }
            s => key.push(s),
        }
    }

    if !is_plain_relative(&key) {
        return Err(RelayError::InvalidUrl {
            url: url.to_string(),
            reason: "path escapes cache root".to_string(),
        });
    }
    Ok(key)
}

fn is_plain_relative(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
}

/// Find the file to serve for `key` under `cache_dir`.
///
/// A file is served directly. A directory serves its `index.html`, or the
/// first `index.html` found depth-first below it.
pub fn cache_lookup(cache_dir: &Path, key: &Path) -> Option<PathBuf> {
    let target = cache_dir.join(key);
    let meta = std::fs::metadata(&target).ok()?;

    if meta.is_file() {
        return Some(target);
    }
    if !meta.is_dir() {
        return None;
    }

    let index = target.join(INDEX_FILE);
    if index.is_file() {
        return Some(index);
    }

    let files = collect_files(&target).ok()?;
    files
        .into_iter()
        .find(|f| f.relative.file_name().map_or(false, |n| n == INDEX_FILE))
        .map(|f| target.join(f.relative))
}

/// Write the descriptor under a temporary name and rename it into place, so
/// the monitor never sees a partial file.
fn write_descriptor(spool_dir: &Path, descriptor: &RequestDescriptor) -> Result<PathBuf> {
    std::fs::create_dir_all(spool_dir)?;
    let name = request_file_name(chrono::Utc::now(), &descriptor.request_id);
    let path = spool_dir.join(name);

    let mut tmp = tempfile::Builder::new()
        .prefix(".descriptor")
        .tempfile_in(spool_dir)?;
    tmp.write_all(descriptor.encode().as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(&path).map_err(|e| e.error)?;
    Ok(path)
}
