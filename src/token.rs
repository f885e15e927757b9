// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sequence tokens: positions in the upstream change log.
//!
//! A token packs a seconds timestamp and an ordinal into a single `u64`,
//! mirroring how the upstream log numbers its entries. Tokens are totally
//! ordered; the engine relies on that order for coalescing, acking, and
//! rollback windows.
//!
//! # Format
//!
//! Rendered as `"<secs>-<ord>"` (e.g. `"1712345678-3"`). Parsing accepts
//! the same form. The packed representation is `(secs << 32) | ord`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A totally ordered position in the upstream change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceToken(u64);

impl SequenceToken {
    /// Build a token from a seconds timestamp and an ordinal within that second.
    pub fn from_parts(secs: u32, ordinal: u32) -> Self {
        Self(((secs as u64) << 32) | ordinal as u64)
    }

    /// Build a token from its raw packed representation.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw packed representation.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// The seconds component.
    pub fn seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The ordinal within the second.
    pub fn ordinal(self) -> u32 {
        self.0 as u32
    }

    /// The smallest token (before anything in the log).
    pub fn zero() -> Self {
        Self(0)
    }

    /// The next token in total order. Saturates at the maximum.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.seconds(), self.ordinal())
    }
}

/// Error parsing a sequence token from its `"secs-ord"` form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid sequence token: {0}")]
pub struct ParseTokenError(String);

impl FromStr for SequenceToken {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (secs, ord) = s
            .split_once('-')
            .ok_or_else(|| ParseTokenError(format!("missing '-' in {s:?}")))?;
        let secs: u32 = secs
            .parse()
            .map_err(|_| ParseTokenError(format!("bad seconds in {s:?}")))?;
        let ord: u32 = ord
            .parse()
            .map_err(|_| ParseTokenError(format!("bad ordinal in {s:?}")))?;
        Ok(Self::from_parts(secs, ord))
    }
}
