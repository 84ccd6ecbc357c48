//! Identifiers for Platen entities.
//!
//! Batch ids arrive from the upstream queue and act as the orchestrator's
//! primary key; task ids are derived deterministically from the batch id,
//! the phase tag, and the input object key so that re-discovering the same
//! batch message always produces the same id set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Number of hex characters kept from the input-key hash.
///
/// Input keys are already unique within a batch, so the hash only needs to
/// disambiguate, not to be collision-free on its own.
const TASK_HASH_LEN: usize = 8;

/// A batch identifier assigned by the upstream producer.
///
/// Non-empty, at most 256 bytes, and restricted to characters that are safe
/// in URL paths and object-store keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl<'de> Deserialize<'de> for BatchId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

impl BatchId {
    /// Creates a batch id after validating the raw string.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty, too long, or contains characters
    /// outside `[A-Za-z0-9._-]`.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(Error::InvalidId {
                message: "batch id cannot be empty".to_string(),
            });
        }
        if raw.len() > 256 {
            return Err(Error::InvalidId {
                message: format!("batch id exceeds 256 bytes ({})", raw.len()),
            });
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(Error::InvalidId {
                message: format!("batch id '{raw}' contains invalid characters"),
            });
        }
        Ok(Self(raw))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BatchId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Derives the deterministic task id for an input key within a phase.
///
/// Format: `{batch_id}:{phase_tag}:{hex(sha256(input_key))[0..8]}`.
///
/// The same `(batch_id, phase_tag, input_key)` triple always yields the same
/// id across processes and restarts, which is what makes spawn delivery
/// idempotent: a respawned worker reports against the same task.
#[must_use]
pub fn task_id(batch_id: &BatchId, phase_tag: &str, input_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input_key.as_bytes());
    let hash = hasher.finalize();

    let mut short = String::with_capacity(TASK_HASH_LEN);
    for byte in hash.iter().take(TASK_HASH_LEN / 2) {
        short.push_str(&format!("{byte:02x}"));
    }

    format!("{batch_id}:{phase_tag}:{short}")
}
