//! Request descriptor codec.
//!
//! A descriptor is a single text line carried from the near node to the far
//! node:
//!
//! ```text
//! IncomingRequest=<absolute-url>,id=<7-digit-decimal>
//! ```
//!
//! The line is a flat comma-joined list, not a structured format. Decoders
//! ignore fields they do not know about, so new trailing fields can be added
//! without breaking older peers.
//!
//! URLs that contain a comma (or a control character) cannot be written
//! verbatim. Those are percent-escaped and the line gains a trailing `enc=pct`
//! field. URLs without a comma are written exactly as older peers expect.

use crate::error::{RelayError, Result};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use rand::Rng;
use std::fmt;
use std::str::FromStr;

/// Literal prefix of the descriptor line
pub const DESCRIPTOR_PREFIX: &str = "IncomingRequest=";

/// Marks a line whose URL field is percent-escaped
const ESCAPED_MARKER: &str = "enc=pct";

const ID_KEY: &str = "id";

/// Bytes escaped when the URL would otherwise break the line.
const FIELD_ESCAPE: &AsciiSet = &CONTROLS.add(b',').add(b'%');

// =============================================================================
// RequestId
// =============================================================================

/// Correlation ID linking a descriptor to the chunk archives it produces.
///
/// Generated IDs are 7-digit zero-padded decimals. Parsed IDs only need to be
/// non-empty ASCII alphanumerics, since they end up inside spool file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Number of digits in a generated ID
    pub const WIDTH: usize = 7;

    const SPACE: u32 = 10_000_000;

    /// Random ID. Collisions within the spool retention window are possible
    /// and accepted.
    pub fn generate() -> Self {
        let n = rand::thread_rng().gen_range(0..Self::SPACE);
        Self(format!("{:0width$}", n, width = Self::WIDTH))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RelayError::MalformedDescriptor(
                "empty request id".to_string(),
            ));
        }
        if !raw.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(RelayError::MalformedDescriptor(format!(
                "request id is not alphanumeric: {raw:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RequestId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// =============================================================================
// RequestDescriptor
// =============================================================================

/// One relayed HTTP request: the URL to fetch plus its correlation ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub url: String,
    pub request_id: RequestId,
}

impl RequestDescriptor {
    pub fn new(url: impl Into<String>, request_id: RequestId) -> Self {
        Self {
            url: url.into(),
            request_id,
        }
    }

    /// Encode to the single-line wire form.
    pub fn encode(&self) -> String {
        if needs_escape(&self.url) {
            format!(
                "{DESCRIPTOR_PREFIX}{},{ID_KEY}={},{ESCAPED_MARKER}",
                utf8_percent_encode(&self.url, FIELD_ESCAPE),
                self.request_id
            )
        } else {
            format!("{DESCRIPTOR_PREFIX}{},{ID_KEY}={}", self.url, self.request_id)
        }
    }

    /// Decode the contents of a descriptor file.
    ///
    /// The first line starting with [`DESCRIPTOR_PREFIX`] is used; other lines
    /// are ignored.
    pub fn decode(text: &str) -> Result<Self> {
        let line = text
            .lines()
            .find(|line| line.starts_with(DESCRIPTOR_PREFIX))
            .ok_or_else(|| {
                RelayError::MalformedDescriptor(format!("'{DESCRIPTOR_PREFIX}' not found"))
            })?;

        let mut fields = line[DESCRIPTOR_PREFIX.len()..].split(',');

        let raw_url = fields.next().map(str::trim).unwrap_or_default();
        if raw_url.is_empty() {
            return Err(RelayError::MalformedDescriptor("missing url".to_string()));
        }

        let id_field = fields
            .next()
            .map(str::trim)
            .ok_or_else(|| RelayError::MalformedDescriptor("missing id field".to_string()))?;
        let (key, value) = id_field.split_once('=').ok_or_else(|| {
            RelayError::MalformedDescriptor(format!("id field has no value: {id_field:?}"))
        })?;
        if key.trim() != ID_KEY {
            return Err(RelayError::MalformedDescriptor(format!(
                "expected '{ID_KEY}=' field, got {id_field:?}"
            )));
        }
        let request_id = RequestId::parse(value)?;

        let escaped = fields.any(|field| field.trim() == ESCAPED_MARKER);
        let url = if escaped {
            percent_decode_str(raw_url)
                .decode_utf8()
                .map_err(|e| RelayError::MalformedDescriptor(format!("bad url escape: {e}")))?
                .into_owned()
        } else {
            raw_url.to_string()
        };

        Ok(Self { url, request_id })
    }
}

impl fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for RequestDescriptor {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

fn needs_escape(url: &str) -> bool {
    url.bytes().any(|b| b == b',' || b.is_ascii_control())
}
