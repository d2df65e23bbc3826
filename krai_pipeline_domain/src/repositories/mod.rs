// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Persistence ports for the pipeline core.

pub mod database_port;

pub use database_port::{
    advisory_lock_key, CompletionMarker, DatabasePort, PipelineMetricsView, QueueMetricsView, SimilarityMatch,
};
