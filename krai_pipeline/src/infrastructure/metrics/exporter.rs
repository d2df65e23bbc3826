// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Prometheus Exporter
//!
//! Process-level counters and gauges exposed in the Prometheus text
//! format. These are operational metrics (how much work, how many
//! failures, how many frames) and deliberately coarser than the
//! performance collector's per-stage aggregates, which live in the
//! baselines table.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use krai_pipeline_domain::{PipelineError, Stage};

/// Prometheus registry plus the pipeline's metric families.
pub struct PipelineMetricsExporter {
    registry: Registry,
    documents_processed_total: IntCounter,
    documents_failed_total: IntCounter,
    stages_completed_total: IntCounterVec,
    stage_errors_total: IntCounterVec,
    stage_duration_seconds: Histogram,
    active_documents: IntGauge,
    broadcast_frames_total: IntCounter,
}

impl PipelineMetricsExporter {
    pub fn new() -> Result<Self, PipelineError> {
        let registry = Registry::new();

        let documents_processed_total = IntCounter::with_opts(
            Opts::new("documents_processed_total", "Documents that completed the pipeline").namespace("krai_pipeline"),
        )
        .map_err(|e| PipelineError::metrics_error(format!("Failed to create documents_processed_total: {}", e)))?;

        let documents_failed_total = IntCounter::with_opts(
            Opts::new("documents_failed_total", "Documents that failed the pipeline").namespace("krai_pipeline"),
        )
        .map_err(|e| PipelineError::metrics_error(format!("Failed to create documents_failed_total: {}", e)))?;

        let stages_completed_total = IntCounterVec::new(
            Opts::new("stages_completed_total", "Completed stage executions").namespace("krai_pipeline"),
            &["stage"],
        )
        .map_err(|e| PipelineError::metrics_error(format!("Failed to create stages_completed_total: {}", e)))?;

        let stage_errors_total = IntCounterVec::new(
            Opts::new("stage_errors_total", "Failed stage executions").namespace("krai_pipeline"),
            &["stage"],
        )
        .map_err(|e| PipelineError::metrics_error(format!("Failed to create stage_errors_total: {}", e)))?;

        let stage_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("stage_duration_seconds", "Stage execution time in seconds")
                .namespace("krai_pipeline")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )
        .map_err(|e| PipelineError::metrics_error(format!("Failed to create stage_duration_seconds: {}", e)))?;

        let active_documents = IntGauge::with_opts(
            Opts::new("active_documents", "Documents currently in flight").namespace("krai_pipeline"),
        )
        .map_err(|e| PipelineError::metrics_error(format!("Failed to create active_documents: {}", e)))?;

        let broadcast_frames_total = IntCounter::with_opts(
            Opts::new("broadcast_frames_total", "Frames pushed to monitoring subscribers").namespace("krai_pipeline"),
        )
        .map_err(|e| PipelineError::metrics_error(format!("Failed to create broadcast_frames_total: {}", e)))?;

        registry
            .register(Box::new(documents_processed_total.clone()))
            .map_err(|e| PipelineError::metrics_error(format!("Failed to register documents_processed_total: {}", e)))?;
        registry
            .register(Box::new(documents_failed_total.clone()))
            .map_err(|e| PipelineError::metrics_error(format!("Failed to register documents_failed_total: {}", e)))?;
        registry
            .register(Box::new(stages_completed_total.clone()))
            .map_err(|e| PipelineError::metrics_error(format!("Failed to register stages_completed_total: {}", e)))?;
        registry
            .register(Box::new(stage_errors_total.clone()))
            .map_err(|e| PipelineError::metrics_error(format!("Failed to register stage_errors_total: {}", e)))?;
        registry
            .register(Box::new(stage_duration_seconds.clone()))
            .map_err(|e| PipelineError::metrics_error(format!("Failed to register stage_duration_seconds: {}", e)))?;
        registry
            .register(Box::new(active_documents.clone()))
            .map_err(|e| PipelineError::metrics_error(format!("Failed to register active_documents: {}", e)))?;
        registry
            .register(Box::new(broadcast_frames_total.clone()))
            .map_err(|e| PipelineError::metrics_error(format!("Failed to register broadcast_frames_total: {}", e)))?;

        Ok(Self {
            registry,
            documents_processed_total,
            documents_failed_total,
            stages_completed_total,
            stage_errors_total,
            stage_duration_seconds,
            active_documents,
            broadcast_frames_total,
        })
    }

    pub fn record_document_completed(&self) {
        self.documents_processed_total.inc();
    }

    pub fn record_document_failed(&self) {
        self.documents_failed_total.inc();
    }

    pub fn record_stage_completed(&self, stage: Stage, seconds: f64) {
        self.stages_completed_total.with_label_values(&[stage.as_str()]).inc();
        self.stage_duration_seconds.observe(seconds);
    }

    pub fn record_stage_error(&self, stage: Stage) {
        self.stage_errors_total.with_label_values(&[stage.as_str()]).inc();
    }

    pub fn document_started(&self) {
        self.active_documents.inc();
    }

    pub fn document_finished(&self) {
        self.active_documents.dec();
    }

    pub fn record_broadcast_frame(&self) {
        self.broadcast_frames_total.inc();
    }

    /// Renders the registry in the Prometheus text exposition format
    pub fn gather(&self) -> Result<String, PipelineError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| PipelineError::metrics_error(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| PipelineError::metrics_error(format!("Metrics not UTF-8: {}", e)))
    }
}
