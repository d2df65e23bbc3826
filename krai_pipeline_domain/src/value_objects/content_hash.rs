// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! SHA-256 content hash used for document and image deduplication and for
//! stage completion markers.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::PipelineError;

/// A 64-character lowercase hex SHA-256 digest.
///
/// Two byte streams with equal digests are treated as the same content
/// everywhere in the system: document resubmission resolves to the existing
/// document, and an unchanged stage input hash lets a stage be skipped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hashes raw bytes
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps an existing digest string, validating shape
    pub fn from_hex(digest: impl Into<String>) -> Result<Self, PipelineError> {
        let digest = digest.into();
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PipelineError::validation_error(format!(
                "content hash must be 64 hex characters, got '{}'",
                digest
            )));
        }
        Ok(Self(digest.to_ascii_lowercase()))
    }

    /// The hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
