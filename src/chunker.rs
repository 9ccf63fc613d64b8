//! Content chunker.
//!
//! Splits a fetched tree into size-bounded sub-trees, one per transport
//! archive. Files are visited depth-first in name order and moved (not copied)
//! into numbered sub-tree directories, keeping their path relative to the
//! source root. The emitted sub-trees partition the source file set.

use crate::error::Result;
use ignore::WalkBuilder;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// One emitted partition of the source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTree {
    /// 1-based position in the chunk sequence
    pub index: usize,
    /// Directory holding this chunk's files
    pub root: PathBuf,
    /// Paths relative to both the source root and `root`
    pub files: Vec<PathBuf>,
    pub bytes: u64,
}

/// A file found in the source tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub relative: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    budget_bytes: u64,
}

impl Chunker {
    pub fn new(budget_kib: u64) -> Self {
        Self {
            budget_bytes: budget_kib.saturating_mul(1024),
        }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Group files into chunks, returning indices into `files` per chunk.
    ///
    /// A chunk is closed when the next file would push it past the budget.
    /// Chunks without files are never produced, so a file larger than the
    /// budget travels alone.
    pub fn plan(&self, files: &[SourceFile]) -> Vec<Vec<usize>> {
        let mut chunks = Vec::new();
        let mut current = Vec::new();
        let mut current_bytes = 0u64;

        for (i, file) in files.iter().enumerate() {
            if !current.is_empty() && current_bytes.saturating_add(file.size) > self.budget_bytes {
                chunks.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current.push(i);
            current_bytes = current_bytes.saturating_add(file.size);
        }

        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    /// Move every file under `source` into `chunk_<n>` directories below
    /// `scratch`. `scratch` must be on the same filesystem as `source`.
    pub async fn divide(&self, source: &Path, scratch: &Path) -> Result<Vec<SubTree>> {
        let chunker = *self;
        let source = source.to_path_buf();
        let scratch = scratch.to_path_buf();
        // Walking and renaming are blocking, run them off the event loop
        tokio::task::spawn_blocking(move || chunker.divide_blocking(&source, &scratch))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    pub fn divide_blocking(&self, source: &Path, scratch: &Path) -> Result<Vec<SubTree>> {
        let files = collect_files(source)?;
        let plan = self.plan(&files);

        let mut subtrees = Vec::with_capacity(plan.len());
        for (n, members) in plan.into_iter().enumerate() {
            let index = n + 1;
            let root = scratch.join(format!("chunk_{index}"));
            fs::create_dir_all(&root)?;

            let mut subtree = SubTree {
                index,
                root,
                files: Vec::with_capacity(members.len()),
                bytes: 0,
            };
            for i in members {
                let file = &files[i];
                move_preserving_path(source, &subtree.root, &file.relative)?;
                subtree.bytes += file.size;
                subtree.files.push(file.relative.clone());
            }

            tracing::debug!(
                chunk = index,
                files = subtree.files.len(),
                bytes = subtree.bytes,
                "chunk filled"
            );
            subtrees.push(subtree);
        }

        Ok(subtrees)
    }
}

/// Regular files below `root`, depth-first, sorted by name within each
/// directory.
pub fn collect_files(root: &Path) -> Result<Vec<SourceFile>> {
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(walk_error)?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            if entry.depth() > 0 && !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                tracing::debug!(path = %entry.path().display(), "skipping non-regular file");
            }
            continue;
        }

        let size = entry.metadata().map_err(walk_error)?.len();
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            .to_path_buf();
        files.push(SourceFile { relative, size });
    }
    Ok(files)
}

fn move_preserving_path(source_root: &Path, target_root: &Path, relative: &Path) -> io::Result<()> {
    let from = source_root.join(relative);
    let to = target_root.join(relative);
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(&from, &to)
}

fn walk_error(e: ignore::Error) -> io::Error {
    let msg = e.to_string();
    e.into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, msg))
}
