//! Store-and-forward HTTP relay over a file-based bundle transport.
//!
//! Two nodes share this crate. The near node turns HTTP requests into
//! descriptor files and serves a mirrored cache; the far node fetches the
//! described content and ships it back as size-bounded zip chunks. The only
//! interface between a node and the transport agent is the spool directory.

pub mod archive;
pub mod chunker;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod fetch;
pub mod merge;
pub mod node;
pub mod relay;
pub mod spool;
pub mod transport;

pub use config::{RelayConfig, Role};
pub use descriptor::{RequestDescriptor, RequestId};
pub use error::{RelayError, Result};
pub use relay::{FarRelay, Gateway, NearRelay, Resolution};
pub use spool::SpoolMonitor;
pub use transport::{BundleTransport, Transport, TransportSession};
