// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Request and Correlation Identifiers
//!
//! A request id (`req_<8 hex>`) names one processing request for a document.
//! A correlation id (`req_<8 hex>.<stage_name>.retry_<N>`) names one attempt
//! of one stage within that request. Every error record, metric sample, and
//! alert produced by an attempt carries its correlation id, so a failure can
//! be traced across systems without joining on timestamps.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::Stage;

/// Identifier for a single processing request (`req_` + 8 hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a fresh request id
    pub fn generate() -> Self {
        let suffix: u32 = rand::rng().random();
        Self(format!("req_{:08x}", suffix))
    }

    /// Wraps an existing id without validation. Intended for replaying
    /// identifiers read back from storage.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
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

/// Identifier for one attempt of one stage: `req_<id>.<stage>.retry_<N>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Builds the correlation id for a given attempt
    pub fn new(request_id: &RequestId, stage: Stage, retry_attempt: u32) -> Self {
        Self(format!("{}.{}.retry_{}", request_id, stage.as_str(), retry_attempt))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The retry attempt number encoded in the id, if parseable
    pub fn retry_attempt(&self) -> Option<u32> {
        self.0.rsplit("retry_").next()?.parse().ok()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
