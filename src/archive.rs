//! Archive pipeline.
//!
//! Send direction packs one chunk sub-tree into a deflate zip with paths
//! relative to the sub-tree root. Receive direction unpacks a delivered zip
//! into a staging directory. A failed extraction may leave a partial tree
//! behind; the merge that follows is safe to run on it.

use crate::chunker::collect_files;
use crate::error::{RelayError, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// A written chunk archive
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub entries: usize,
    /// Uncompressed bytes packed
    pub bytes: u64,
    /// Size of the archive file
    pub archive_bytes: u64,
    /// blake3 of the archive file, hex
    pub digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub dirs: usize,
}

pub async fn archive(root: &Path, out: &Path) -> Result<ArchiveSummary> {
    let root = root.to_path_buf();
    let out = out.to_path_buf();
    tokio::task::spawn_blocking(move || archive_blocking(&root, &out))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

pub async fn extract(archive: &Path, dest: &Path) -> Result<ExtractSummary> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Pack every regular file under `root` into a zip at `out`.
///
/// Any read or write fault is an `ArchiveWrite` error; nothing is retried.
pub fn archive_blocking(root: &Path, out: &Path) -> Result<ArchiveSummary> {
    let write_err = |e: io::Error| RelayError::archive_write(out, e);

    let files = collect_files(root).map_err(|e| match e {
        RelayError::Io(e) => write_err(e),
        other => other,
    })?;

    let file = File::create(out).map_err(write_err)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut bytes = 0u64;
    for entry in &files {
        zip.start_file(entry_name(&entry.relative), options)
            .map_err(|e| write_err(e.into()))?;
        let mut src = File::open(root.join(&entry.relative)).map_err(write_err)?;
        bytes += io::copy(&mut src, &mut zip).map_err(write_err)?;
    }

    let mut writer = zip.finish().map_err(|e| write_err(e.into()))?;
    writer.flush().map_err(write_err)?;
    drop(writer);

    let written = fs::read(out).map_err(write_err)?;
    let summary = ArchiveSummary {
        path: out.to_path_buf(),
        entries: files.len(),
        bytes,
        archive_bytes: written.len() as u64,
        digest: hex::encode(blake3::hash(&written).as_bytes()),
    };

    tracing::debug!(
        archive = %out.display(),
        entries = summary.entries,
        bytes = summary.bytes,
        archive_bytes = summary.archive_bytes,
        "archive written"
    );
    Ok(summary)
}

/// Unpack `archive` under `dest`.
///
/// Entries that would land outside `dest` make the whole archive corrupt.
pub fn extract_blocking(archive: &Path, dest: &Path) -> Result<ExtractSummary> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(BufReader::new(file))
        .map_err(|e| RelayError::corrupt(archive, e))?;

    fs::create_dir_all(dest)?;

    let mut summary = ExtractSummary { files: 0, dirs: 0 };
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| RelayError::corrupt(archive, e))?;

        let relative = entry
            .enclosed_name()
            .filter(|p| is_plain_relative(p))
            .ok_or_else(|| {
                RelayError::corrupt(archive, format!("unsafe entry path {:?}", entry.name()))
            })?;
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            summary.dirs += 1;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out).map_err(|e| RelayError::corrupt(archive, e))?;
        summary.files += 1;
    }

    tracing::debug!(
        archive = %archive.display(),
        dest = %dest.display(),
        files = summary.files,
        "archive extracted"
    );
    Ok(summary)
}

/// Zip entry names always use `/`
fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_plain_relative(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
}
