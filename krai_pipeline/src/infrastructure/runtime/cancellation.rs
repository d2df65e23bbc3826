// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Per-Document Cancellation
//!
//! External callers may cancel a document while it is in flight.
//! Cancellation is cooperative: in-flight stage executions finish, and
//! background retries check their token at suspension points and exit
//! without spawning further work.

use std::collections::HashMap;

use parking_lot::Mutex;

use krai_pipeline_bootstrap::CancellationToken;
use krai_pipeline_domain::DocumentId;

/// Registry of cancellation tokens keyed by document.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<DocumentId, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a document, created on first use
    pub fn token(&self, document_id: DocumentId) -> CancellationToken {
        self.tokens
            .lock()
            .entry(document_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Cancels a document's token. Scheduled retries observing the token
    /// exit without running.
    pub fn cancel(&self, document_id: DocumentId) {
        self.tokens
            .lock()
            .entry(document_id)
            .or_insert_with(CancellationToken::new)
            .cancel();
    }

    /// True when the document was cancelled
    pub fn is_cancelled(&self, document_id: DocumentId) -> bool {
        self.tokens
            .lock()
            .get(&document_id)
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }

    /// Drops the token once a document reaches a terminal status
    pub fn forget(&self, document_id: DocumentId) {
        self.tokens.lock().remove(&document_id);
    }
}
