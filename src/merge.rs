//! Cache merge engine.
//!
//! Folds a freshly extracted tree into the mirrored cache. Every entry is
//! attempted: a collision on one file is recorded and the walk moves on to its
//! siblings. Existing cache files are never replaced, so on a collision the
//! newer delivery is the one that loses.
//!
//! Source directories are removed once everything inside them has moved; a
//! directory that kept any child stays behind for inspection. Running the
//! merge again over that residue is safe.

use crate::error::{RelayError, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct MergeFailure {
    /// Path relative to the extracted root
    pub path: PathBuf,
    pub error: RelayError,
}

#[derive(Debug, Default)]
pub struct MergeReport {
    /// Entries moved into the cache, relative to the extracted root. A moved
    /// directory is listed once, not per file.
    pub moved: Vec<PathBuf>,
    pub failures: Vec<MergeFailure>,
}

impl MergeReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn collisions(&self) -> usize {
        self.failures
            .iter()
            .filter(|f| matches!(f.error, RelayError::MergeCollision(_)))
            .count()
    }
}

pub async fn merge(extracted: &Path, cache: &Path) -> Result<MergeReport> {
    let extracted = extracted.to_path_buf();
    let cache = cache.to_path_buf();
    tokio::task::spawn_blocking(move || merge_blocking(&extracted, &cache))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Merge `extracted` into `cache`.
///
/// Only failing to read `extracted` itself or to create `cache` is an error;
/// everything else is reported per entry.
pub fn merge_blocking(extracted: &Path, cache: &Path) -> Result<MergeReport> {
    fs::create_dir_all(cache)?;
    // Surface an unreadable root as an error rather than a per-entry failure
    fs::read_dir(extracted)?;

    let mut report = MergeReport::default();
    merge_dir(extracted, cache, Path::new(""), &mut report);

    tracing::debug!(
        extracted = %extracted.display(),
        moved = report.moved.len(),
        failures = report.failures.len(),
        "merge finished"
    );
    Ok(report)
}

/// Returns true when every child of `src_dir` was moved and `src_dir` removed.
fn merge_dir(src_dir: &Path, dest_dir: &Path, relative: &Path, report: &mut MergeReport) -> bool {
    let mut entries = match read_sorted(src_dir) {
        Ok(entries) => entries,
        Err(e) => {
            report.failures.push(MergeFailure {
                path: relative.to_path_buf(),
                error: e.into(),
            });
            return false;
        }
    };

    let mut all_moved = true;
    for (name, src_is_dir) in entries.drain(..) {
        let src = src_dir.join(&name);
        let dest = dest_dir.join(&name);
        let rel = relative.join(&name);

        if !merge_entry(&src, &dest, src_is_dir, &rel, report) {
            all_moved = false;
        }
    }

    if all_moved {
        if let Err(e) = fs::remove_dir(src_dir) {
            tracing::warn!(dir = %src_dir.display(), error = %e, "failed to remove merged directory");
            return false;
        }
    }
    all_moved
}

fn merge_entry(
    src: &Path,
    dest: &Path,
    src_is_dir: bool,
    rel: &Path,
    report: &mut MergeReport,
) -> bool {
    match fs::symlink_metadata(dest) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            match move_no_clobber(src, dest, src_is_dir) {
                Ok(()) => {
                    report.moved.push(rel.to_path_buf());
                    true
                }
                // Someone populated dest between the check and the move
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists || dest_is_dir(dest) => {
                    if src_is_dir && dest_is_dir(dest) {
                        merge_dir(src, dest, rel, report)
                    } else {
                        collision(rel, report)
                    }
                }
                Err(e) => {
                    report.failures.push(MergeFailure {
                        path: rel.to_path_buf(),
                        error: e.into(),
                    });
                    false
                }
            }
        }
        Err(e) => {
            report.failures.push(MergeFailure {
                path: rel.to_path_buf(),
                error: e.into(),
            });
            false
        }
        Ok(meta) if meta.is_dir() && src_is_dir => merge_dir(src, dest, rel, report),
        Ok(_) => collision(rel, report),
    }
}

fn collision(rel: &Path, report: &mut MergeReport) -> bool {
    tracing::warn!(path = %rel.display(), "cache entry exists, keeping cached copy");
    report.failures.push(MergeFailure {
        path: rel.to_path_buf(),
        error: RelayError::MergeCollision(rel.to_path_buf()),
    });
    false
}

/// Move without replacing an existing file. Files go through a hard link,
/// which fails atomically if `dest` exists; directories are renamed.
fn move_no_clobber(src: &Path, dest: &Path, src_is_dir: bool) -> io::Result<()> {
    if src_is_dir {
        return fs::rename(src, dest);
    }
    match fs::hard_link(src, dest) {
        Ok(()) => fs::remove_file(src),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        // Filesystem without hard links
        Err(_) => {
            if dest.exists() {
                return Err(io::Error::from(io::ErrorKind::AlreadyExists));
            }
            fs::rename(src, dest)
        }
    }
}

fn dest_is_dir(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn read_sorted(dir: &Path) -> io::Result<Vec<(std::ffi::OsString, bool)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_dir = entry.file_type()?.is_dir();
        entries.push((entry.file_name(), is_dir));
    }
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::collect_files;
    use tempfile::TempDir;

    fn write(root: &Path, path: &str, data: &str) {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, data).unwrap();
    }

    fn listing(root: &Path) -> Vec<(PathBuf, String)> {
        collect_files(root)
            .unwrap()
            .into_iter()
            .map(|f| {
                let data = fs::read_to_string(root.join(&f.relative)).unwrap();
                (f.relative, data)
            })
            .collect()
    }

    #[test]
    fn test_merge_into_empty_cache() {
        let tmp = TempDir::new().unwrap();
        let extracted = tmp.path().join("extracted/run1");
        let cache = tmp.path().join("cache");
        write(&extracted, "example.com/page/index.html", "index");
        write(&extracted, "example.com/page/style.css", "css");
        write(&extracted, "cdn.example.com/lib.js", "js");
        let expected = listing(&extracted);

        let report = merge_blocking(&extracted, &cache).unwrap();

        assert!(report.is_clean());
        assert_eq!(listing(&cache), expected);
        assert!(!extracted.exists());
    }

    #[test]
    fn test_merge_collision_contained() {
        let tmp = TempDir::new().unwrap();
        let extracted = tmp.path().join("extracted");
        let cache = tmp.path().join("cache");
        write(&cache, "a/b.txt", "old");
        write(&extracted, "a/b.txt", "new");
        write(&extracted, "a/c.txt", "c");

        let report = merge_blocking(&extracted, &cache).unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, PathBuf::from("a/b.txt"));
        assert!(matches!(
            report.failures[0].error,
            RelayError::MergeCollision(_)
        ));
        assert_eq!(report.collisions(), 1);
        assert_eq!(fs::read_to_string(cache.join("a/c.txt")).unwrap(), "c");
        assert_eq!(fs::read_to_string(cache.join("a/b.txt")).unwrap(), "old");
        // Residue left for diagnosis
        assert!(extracted.join("a/b.txt").exists());
        assert!(!extracted.join("a/c.txt").exists());
    }

    #[test]
    fn test_merge_recurses_into_existing_dirs() {
        let tmp = TempDir::new().unwrap();
        let extracted = tmp.path().join("extracted");
        let cache = tmp.path().join("cache");
        write(&cache, "example.com/page/1.html", "one");
        write(&extracted, "example.com/page/2.html", "two");
        write(&extracted, "example.com/img/x.png", "png");

        let report = merge_blocking(&extracted, &cache).unwrap();

        assert!(report.is_clean());
        assert_eq!(
            report.moved,
            vec![
                PathBuf::from("example.com/img"),
                PathBuf::from("example.com/page/2.html"),
            ]
        );
        assert_eq!(
            fs::read_to_string(cache.join("example.com/page/1.html")).unwrap(),
            "one"
        );
        assert_eq!(
            fs::read_to_string(cache.join("example.com/page/2.html")).unwrap(),
            "two"
        );
        assert!(cache.join("example.com/img/x.png").is_file());
        assert!(!extracted.exists());
    }

    #[test]
    fn test_merge_type_mismatch() {
        let tmp = TempDir::new().unwrap();
        let extracted = tmp.path().join("extracted");
        let cache = tmp.path().join("cache");
        write(&cache, "example.com/page", "wget saved this as a file");
        write(&extracted, "example.com/page/index.html", "index");
        write(&extracted, "example.com/other.html", "other");

        let report = merge_blocking(&extracted, &cache).unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, PathBuf::from("example.com/page"));
        assert!(cache.join("example.com/other.html").is_file());
        assert!(cache.join("example.com/page").is_file());
    }

    #[test]
    fn test_merge_rerun_over_residue() {
        let tmp = TempDir::new().unwrap();
        let extracted = tmp.path().join("extracted");
        let cache = tmp.path().join("cache");
        write(&cache, "a/b.txt", "old");
        write(&extracted, "a/b.txt", "new");
        write(&extracted, "a/c.txt", "c");

        merge_blocking(&extracted, &cache).unwrap();
        let again = merge_blocking(&extracted, &cache).unwrap();

        assert_eq!(again.failures.len(), 1);
        assert!(again.moved.is_empty());
        assert_eq!(fs::read_to_string(cache.join("a/c.txt")).unwrap(), "c");
    }

    #[test]
    fn test_merge_missing_extracted_root() {
        let tmp = TempDir::new().unwrap();
        let err = merge_blocking(&tmp.path().join("nope"), &tmp.path().join("cache")).unwrap_err();
        assert!(matches!(err, RelayError::Io(_)));
    }

    #[tokio::test]
    async fn test_merge_async() {
        let tmp = TempDir::new().unwrap();
        let extracted = tmp.path().join("extracted");
        write(&extracted, "example.com/index.html", "hi");
        let report = merge(&extracted, &tmp.path().join("cache")).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.moved, vec![PathBuf::from("example.com")]);
    }
}
