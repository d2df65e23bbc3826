// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Bootstrap Logger
//!
//! Lightweight logging abstraction for the bootstrap phase. Composition
//! happens before the full tracing stack is configured, so early failures
//! (bad arguments, unreadable config) still need somewhere to go. The trait
//! keeps bootstrap code testable with a no-op implementation.

/// Bootstrap logging abstraction
///
/// Implementations can route through tracing or a custom backend.
pub trait BootstrapLogger: Send + Sync {
    /// Fatal errors during bootstrap that will cause termination
    fn error(&self, message: &str);

    /// Non-fatal issues that may affect operation
    fn warn(&self, message: &str);

    /// Normal bootstrap progress messages
    fn info(&self, message: &str);

    /// Detailed diagnostic information during bootstrap
    fn debug(&self, message: &str);
}

/// Console logger implementation routing through the tracing crate.
pub struct ConsoleLogger {
    prefix: String,
}

impl ConsoleLogger {
    /// Create a new console logger with default prefix
    pub fn new() -> Self {
        Self::with_prefix("bootstrap")
    }

    /// Create a new console logger with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapLogger for ConsoleLogger {
    fn error(&self, message: &str) {
        tracing::error!(target: "bootstrap", "[{}] {}", self.prefix, message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "bootstrap", "[{}] {}", self.prefix, message);
    }

    fn info(&self, message: &str) {
        tracing::info!(target: "bootstrap", "[{}] {}", self.prefix, message);
    }

    fn debug(&self, message: &str) {
        tracing::debug!(target: "bootstrap", "[{}] {}", self.prefix, message);
    }
}

/// Logger that discards all messages. Useful in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl BootstrapLogger for NoopLogger {
    fn error(&self, _message: &str) {}
    fn warn(&self, _message: &str) {}
    fn info(&self, _message: &str) {}
    fn debug(&self, _message: &str) {}
}
