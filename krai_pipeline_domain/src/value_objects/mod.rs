// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Value objects for the document pipeline domain.
//!
//! Immutable, validated types that flow through the pipeline: document
//! identity, the canonical stage enumeration, content hashes, and the
//! request/correlation identifiers that tie retry attempts together across
//! log, metric, and alert records.

pub mod content_hash;
pub mod correlation;
pub mod document_id;
pub mod stage;

pub use content_hash::ContentHash;
pub use correlation::{CorrelationId, RequestId};
pub use document_id::DocumentId;
pub use stage::Stage;
