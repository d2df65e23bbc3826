// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Error System
//!
//! This module provides the hierarchical error system for the document
//! pipeline domain. Failures are categorized so that callers can handle them
//! systematically: the retry engine distinguishes retriable infrastructure
//! failures from deterministic business failures, the stage tracker reacts to
//! a missing stored procedure, and the persistence port reports constraint
//! violations distinctly from lost connections.
//!
//! ## Error Categories
//!
//! ### Persistence Errors
//! - **ConnectionLost**: The database connection dropped or could not be
//!   established
//! - **ConstraintViolation**: A uniqueness or foreign-key constraint rejected
//!   a write
//! - **NotFound**: The requested row does not exist
//! - **Timeout**: An operation exceeded its bounded deadline
//! - **MissingFunction**: A stored procedure is absent (fresh install,
//!   migration not applied)
//! - **DatabaseError**: Any other backend failure
//!
//! ### Processing Errors
//! - **ProcessingFailed**: A stage processor failed deterministically
//! - **ValidationError**: Input data was rejected
//! - **DependencyUnavailable**: A downstream AI or storage service is
//!   unreachable
//! - **RateLimited**: A downstream service asked the caller to back off
//!
//! ### System Errors
//! - **SerializationError**: JSON encoding or decoding failed
//! - **InvalidConfiguration**: Malformed or missing configuration
//! - **Cancelled**: Processing was cancelled externally
//! - **MetricsError**: Metric collection or export failed
//! - **InternalError**: Unexpected failure
//!
//! ## Recovery
//!
//! `is_recoverable` marks the variants that indicate a temporary condition
//! worth retrying. The retry engine builds its transient/permanent/unknown
//! classification on top of this predicate.

use thiserror::Error;

/// Domain-specific errors for the document pipeline.
///
/// Each variant carries a descriptive message. Variants are grouped by
/// category so that systematic handling (retry, degrade, surface) stays a
/// pattern match rather than string inspection.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Function does not exist: {0}")]
    MissingFunction(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl PipelineError {
    /// Creates a new configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Creates a new validation error
    pub fn validation_error(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// Creates a new processing error
    pub fn processing_failed(msg: impl Into<String>) -> Self {
        Self::ProcessingFailed(msg.into())
    }

    /// Creates a new lost-connection error
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }

    /// Creates a new not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates a new database error
    pub fn database_error(msg: impl Into<String>) -> Self {
        Self::DatabaseError(msg.into())
    }

    /// Creates a new serialization error
    pub fn serialization_error(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }

    /// Creates a new internal error
    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    /// Creates a new metrics error
    pub fn metrics_error(msg: impl Into<String>) -> Self {
        Self::MetricsError(msg.into())
    }

    /// Checks if the error indicates a temporary condition worth retrying
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::ConnectionLost(_)
                | PipelineError::Timeout(_)
                | PipelineError::DependencyUnavailable(_)
                | PipelineError::RateLimited(_)
        )
    }

    /// Checks if the error originated in the persistence layer
    pub fn is_database_error(&self) -> bool {
        matches!(
            self,
            PipelineError::ConnectionLost(_)
                | PipelineError::ConstraintViolation(_)
                | PipelineError::NotFound(_)
                | PipelineError::Timeout(_)
                | PipelineError::MissingFunction(_)
                | PipelineError::DatabaseError(_)
        )
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::TimedOut => PipelineError::Timeout(error.to_string()),
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::BrokenPipe => PipelineError::ConnectionLost(error.to_string()),
            _ => PipelineError::InternalError(format!("IO error: {}", error)),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(error: serde_json::Error) -> Self {
        PipelineError::SerializationError(error.to_string())
    }
}
