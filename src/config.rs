//! Relay configuration.
//!
//! Loaded from an optional TOML file; every key has a default, and endpoint
//! addresses default per role. CLI flags are applied on top by the binary.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which side of the link this node runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// HTTP-facing node: writes descriptors, merges received archives
    Near,
    /// Internet-facing node: fetches, chunks and ships content back
    Far,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Near => "near",
            Role::Far => "far",
        }
    }
}

/// Resolved transport endpoint addresses for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Address the receive listener binds to
    pub listen: String,
    /// Local source address used when sending
    pub source: String,
    /// Peer address files are sent to
    pub destination: String,
}

impl Endpoints {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Near => Self {
                listen: "ipn:150.2".to_string(),
                source: "ipn:150.1".to_string(),
                destination: "ipn:149.2".to_string(),
            },
            Role::Far => Self {
                listen: "ipn:149.2".to_string(),
                source: "ipn:149.1".to_string(),
                destination: "ipn:150.2".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StabilityConfig {
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_attempts: 5,
        }
    }
}

impl StabilityConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupeConfig {
    /// Maximum number of remembered file names
    pub capacity: usize,
    /// Seconds a dispatched name is remembered if never confirmed consumed
    pub ttl_secs: u64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub recv_command: String,
    pub send_command: String,
    pub listen_endpoint: Option<String>,
    pub source_endpoint: Option<String>,
    pub destination_endpoint: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_command: "bprecvfile".to_string(),
            send_command: "bpsendfile".to_string(),
            listen_endpoint: None,
            source_endpoint: None,
            destination_endpoint: None,
        }
    }
}

/// External fetch utility. `{url}` and `{dir}` in `args` are substituted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            command: "wget".to_string(),
            args: ["-r", "-l", "1", "-np", "-P", "{dir}", "{url}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub role: Role,
    pub spool_dir: PathBuf,
    /// Mirrored cache root (near). Defaults to `<spool_dir>/cache`.
    pub cache_dir: Option<PathBuf>,
    pub chunk_budget_kib: u64,
    /// Leave far-side scratch directories behind after a successful send
    pub keep_scratch: bool,
    /// Seconds a URL stays pending before a new descriptor may be issued
    pub pending_ttl_secs: u64,
    pub stability: StabilityConfig,
    pub dedupe: DedupeConfig,
    pub transport: TransportConfig,
    pub fetch: FetchConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            role: Role::Near,
            spool_dir: PathBuf::from("./spool"),
            cache_dir: None,
            chunk_budget_kib: 500,
            keep_scratch: false,
            pending_ttl_secs: 600,
            stability: StabilityConfig::default(),
            dedupe: DedupeConfig::default(),
            transport: TransportConfig::default(),
            fetch: FetchConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn for_role(role: Role) -> Self {
        Self {
            role,
            ..Default::default()
        }
    }

    /// Load from a TOML file, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    RelayError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Expand `~` in configured paths and check value ranges.
    pub fn finalize(mut self) -> Result<Self> {
        self.spool_dir = expand_tilde(&self.spool_dir);
        self.cache_dir = self.cache_dir.as_deref().map(expand_tilde);

        if self.chunk_budget_kib == 0 {
            return Err(RelayError::Config(
                "chunk_budget_kib must be positive".to_string(),
            ));
        }
        // Two equal readings are needed to call a file stable
        if self.stability.max_attempts < 2 {
            return Err(RelayError::Config(
                "stability.max_attempts must be at least 2".to_string(),
            ));
        }
        if self.dedupe.capacity == 0 {
            return Err(RelayError::Config(
                "dedupe.capacity must be positive".to_string(),
            ));
        }
        if self.fetch.command.is_empty() {
            return Err(RelayError::Config("fetch.command is empty".to_string()));
        }
        Ok(self)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.spool_dir.join("cache"))
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn endpoints(&self) -> Endpoints {
        let defaults = Endpoints::for_role(self.role);
        let t = &self.transport;
        Endpoints {
            listen: t.listen_endpoint.clone().unwrap_or(defaults.listen),
            source: t.source_endpoint.clone().unwrap_or(defaults.source),
            destination: t.destination_endpoint.clone().unwrap_or(defaults.destination),
        }
    }
}

/// Resolve a leading `~` in a configured spool or cache directory against the
/// home of the user running the node. Other paths pass through unchanged.
fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
