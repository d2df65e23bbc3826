// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Command-line interface for the pipeline engine.
//!
//! Exit codes follow the CLI contract: `0` success, `1` business failure,
//! `2` setup failure.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// KRAI document pipeline engine
#[derive(Parser, Debug)]
#[command(name = "krai_pipeline", version, about = "Multi-stage document processing engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest and process a document through the pipeline
    Process {
        /// Path to the document file
        file: PathBuf,

        /// Declared document type
        #[arg(long, default_value = "service_manual")]
        document_type: String,

        /// Document language
        #[arg(long, default_value = "en")]
        language: String,
    },

    /// Show processing status for a document
    Status {
        /// Document id (UUID)
        document_id: String,
    },

    /// Request cancellation of a document's processing
    Cancel {
        /// Document id (UUID)
        document_id: String,
    },

    /// Resolve and print the effective configuration
    ValidateConfig,
}
