//! Content fetching.
//!
//! The far node delegates page retrieval to an external utility (`wget` by
//! default) that writes a mirrored tree under a scratch directory.

use crate::chunker::collect_files;
use crate::config::FetchConfig;
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Retrieve `url` into `dest`, which exists and is empty.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Runs a configured command line, substituting `{url}` and `{dir}`.
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    command: String,
    args: Vec<String>,
}

impl CommandFetcher {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }

    fn render_args(&self, url: &str, dest: &Path) -> Vec<String> {
        let dir = dest.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{url}", url).replace("{dir}", &dir))
            .collect()
    }

    fn failure(url: &str, reason: impl ToString) -> RelayError {
        RelayError::FetchFailure {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Fetcher for CommandFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let args = self.render_args(url, dest);
        tracing::info!(url, command = %self.command, dest = %dest.display(), "fetching");

        let output = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Self::failure(url, format!("failed to run {}: {}", self.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.trim().lines().last().unwrap_or("");
            return Err(Self::failure(
                url,
                format!("{} exited with {}: {}", self.command, output.status, last_line),
            ));
        }

        let dest = dest.to_path_buf();
        let files = tokio::task::spawn_blocking(move || collect_files(&dest))
            .await
            .map_err(|e| Self::failure(url, e))??;
        if files.is_empty() {
            return Err(Self::failure(url, "no content retrieved"));
        }

        let bytes: u64 = files.iter().map(|f| f.size).sum();
        tracing::info!(url, files = files.len(), bytes, "fetch complete");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fetcher(command: &str, args: &[&str]) -> CommandFetcher {
        CommandFetcher::new(&FetchConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_default_args_render() {
        let f = CommandFetcher::new(&FetchConfig::default());
        let args = f.render_args("https://example.com/page", Path::new("/spool/download_1_0000001"));
        assert_eq!(
            args,
            vec![
                "-r",
                "-l",
                "1",
                "-np",
                "-P",
                "/spool/download_1_0000001",
                "https://example.com/page"
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_writes_tree() {
        let tmp = TempDir::new().unwrap();
        let f = fetcher(
            "sh",
            &["-c", "mkdir -p \"$0/example.com\" && echo \"$1\" > \"$0/example.com/index.html\"", "{dir}", "{url}"],
        );
        f.fetch("https://example.com/", tmp.path()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("example.com/index.html")).unwrap(),
            "https://example.com/\n"
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let tmp = TempDir::new().unwrap();
        let f = fetcher("sh", &["-c", "echo 'ERROR 404: Not Found.' >&2; exit 8"]);
        let err = f.fetch("https://example.com/missing", tmp.path()).await.unwrap_err();
        match err {
            RelayError::FetchFailure { url, reason } => {
                assert_eq!(url, "https://example.com/missing");
                assert!(reason.contains("404"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_result_is_failure() {
        let tmp = TempDir::new().unwrap();
        let err = fetcher("true", &[])
            .fetch("https://example.com/", tmp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::FetchFailure { .. }));
    }

    #[tokio::test]
    async fn test_missing_command_is_failure() {
        let tmp = TempDir::new().unwrap();
        let err = fetcher("no-such-fetch-utility", &[])
            .fetch("https://example.com/", tmp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::FetchFailure { .. }));
    }
}
