// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Database Port
//!
//! The single persistence interface the whole pipeline core talks to. The
//! production implementation targets PostgreSQL with connection pooling;
//! unit and integration tests inject an in-memory implementation that
//! satisfies the same contract, including vector similarity search. There
//! are no mock branches anywhere in production paths.
//!
//! ## Operation Groups
//!
//! - **Domain CRUD** for documents, catalog records, chunks, images, links,
//!   videos, tables, embeddings, and error codes
//! - **Deduplication lookups** by content hash, `(name, parent)`,
//!   `(document_id, chunk_index)`, and `(source_id, source_type, model)`
//! - **Completion markers** read before and written after each stage run
//! - **Stored procedures** for stage transitions, invoked by name with JSON
//!   parameters; a missing procedure surfaces as
//!   `PipelineError::MissingFunction` so the stage tracker can degrade
//! - **Advisory locks** keyed by `(document_id, stage)` that serialize
//!   concurrent stage runs across workers
//! - **Aggregate views** backing the metrics service
//! - **Monitoring records**: error log, alerts and rules, queue items, and
//!   performance baselines
//!
//! ## Failure Semantics
//!
//! Every method returns `PipelineError` variants that let callers
//! distinguish a lost connection, a constraint violation, a missing row, a
//! timeout, and anything else. Batched embedding writes report a per-item
//! outcome list rather than a single boolean, so partial success is
//! observable.
//!
//! ## Thread Safety
//!
//! Implementations must be `Send + Sync` and safe for concurrent use from
//! many stage executions at once.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{
    Alert, AlertRule, AlertSeverity, AlertStatus, BatchItemOutcome, Chunk, Document, DuplicateGroup,
    EmbeddingRecord, ErrorCodeRecord, ErrorLogRecord, ImageRecord, LinkRecord, Manufacturer,
    PerformanceBaseline, ProcessingStatus, Product, ProductSeries, QueueItem, QueueItemStatus, SourceType,
    StageAggregates, StageStatistics, TableRecord, VideoRecord,
};
use crate::value_objects::{ContentHash, DocumentId, Stage};
use crate::PipelineError;

/// Proof that a `(document, stage)` pair completed for a given input hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub document_id: DocumentId,
    pub stage: Stage,
    pub data_hash: String,
    pub completed_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// One row of the aggregated pipeline metrics view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetricsView {
    pub total_documents: u64,
    pub documents_pending: u64,
    pub documents_processing: u64,
    pub documents_completed: u64,
    pub documents_failed: u64,
    pub success_rate: f64,
    pub avg_processing_time_seconds: f64,
    /// Documents that finished in the trailing 24 hours
    pub recent_24h_count: u64,
}

/// One row of the aggregated queue metrics view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetricsView {
    pub total_items: u64,
    pub pending_count: u64,
    pub processing_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub avg_wait_time_seconds: f64,
    pub by_task_type: BTreeMap<String, u64>,
}

/// A row returned by an embedding similarity search, most similar first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityMatch {
    pub embedding: EmbeddingRecord,
    /// Cosine similarity in `[-1, 1]`
    pub similarity: f64,
}

/// Derives the advisory lock key for one `(document, stage)` pair.
///
/// The key folds the first 8 bytes of a SHA-256 over
/// `"<document_id>:<stage>"` into an `i64`. The derivation must be
/// identical on every worker, because the lock only serializes runs when
/// all parties compute the same key.
pub fn advisory_lock_key(document_id: DocumentId, stage: Stage) -> i64 {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(document_id.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(stage.as_str().as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Abstract, uniform access to the persistence layer.
#[async_trait]
pub trait DatabasePort: Send + Sync {
    /// Verifies connectivity
    async fn ping(&self) -> Result<(), PipelineError>;

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    /// Creates a document, or returns the existing id when a document with
    /// the same content hash already exists
    async fn create_document(&self, document: &Document) -> Result<DocumentId, PipelineError>;

    async fn get_document(&self, document_id: DocumentId) -> Result<Option<Document>, PipelineError>;

    async fn get_document_by_hash(&self, content_hash: &ContentHash) -> Result<Option<Document>, PipelineError>;

    async fn update_document_status(
        &self,
        document_id: DocumentId,
        status: ProcessingStatus,
    ) -> Result<(), PipelineError>;

    /// Bounded listing used by data quality aggregation
    async fn list_documents(&self, limit: usize) -> Result<Vec<Document>, PipelineError>;

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    /// Creates a manufacturer, or returns the existing id on a
    /// case-insensitive name match
    async fn create_manufacturer(&self, manufacturer: &Manufacturer) -> Result<Uuid, PipelineError>;

    async fn get_manufacturer_by_name(&self, name: &str) -> Result<Option<Manufacturer>, PipelineError>;

    async fn create_product_series(&self, series: &ProductSeries) -> Result<Uuid, PipelineError>;

    async fn get_series_by_name(
        &self,
        manufacturer_id: Uuid,
        series_name: &str,
    ) -> Result<Option<ProductSeries>, PipelineError>;

    async fn create_product(&self, product: &Product) -> Result<Uuid, PipelineError>;

    async fn get_product_by_model(
        &self,
        manufacturer_id: Uuid,
        model_number: &str,
    ) -> Result<Option<Product>, PipelineError>;

    async fn create_error_code(&self, error_code: &ErrorCodeRecord) -> Result<Uuid, PipelineError>;

    async fn get_error_code(&self, code: &str) -> Result<Option<ErrorCodeRecord>, PipelineError>;

    // ------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------

    /// Creates a chunk; `(document_id, chunk_index)` is unique
    async fn create_chunk(&self, chunk: &Chunk) -> Result<Uuid, PipelineError>;

    async fn get_chunk_by_document_and_index(
        &self,
        document_id: DocumentId,
        chunk_index: u32,
    ) -> Result<Option<Chunk>, PipelineError>;

    /// Creates an image, or returns the existing id when the content hash
    /// is already stored
    async fn create_image(&self, image: &ImageRecord) -> Result<Uuid, PipelineError>;

    async fn get_image_by_hash(&self, content_hash: &ContentHash) -> Result<Option<ImageRecord>, PipelineError>;

    async fn create_link(&self, link: &LinkRecord) -> Result<Uuid, PipelineError>;

    /// Upserts a video; conflicts on `link_id`
    async fn create_video(&self, video: &VideoRecord) -> Result<Uuid, PipelineError>;

    async fn create_table(&self, table: &TableRecord) -> Result<Uuid, PipelineError>;

    async fn count_chunks_by_document(&self, document_id: DocumentId) -> Result<u64, PipelineError>;

    async fn count_images_by_document(&self, document_id: DocumentId) -> Result<u64, PipelineError>;

    async fn count_links_by_document(&self, document_id: DocumentId) -> Result<u64, PipelineError>;

    // ------------------------------------------------------------------
    // Embeddings
    // ------------------------------------------------------------------

    /// Creates an embedding; `(source_id, source_type, model_name)` is
    /// unique and concurrent writes converge to one row
    async fn create_embedding(&self, embedding: &EmbeddingRecord) -> Result<Uuid, PipelineError>;

    /// Stores a batch, returning one outcome per item in input order
    async fn create_embeddings_batch(&self, embeddings: &[EmbeddingRecord]) -> Vec<BatchItemOutcome>;

    async fn get_embedding_by_source(
        &self,
        source_id: Uuid,
        source_type: SourceType,
        model_name: &str,
    ) -> Result<Option<EmbeddingRecord>, PipelineError>;

    async fn embedding_exists(&self, source_id: Uuid, source_type: SourceType) -> Result<bool, PipelineError>;

    /// Rows ordered by descending cosine similarity, filtered by
    /// `threshold`, limited to `limit`
    async fn search_embeddings(
        &self,
        query: &[f32],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<SimilarityMatch>, PipelineError>;

    // ------------------------------------------------------------------
    // Completion markers
    // ------------------------------------------------------------------

    async fn get_completion_marker(
        &self,
        document_id: DocumentId,
        stage: Stage,
    ) -> Result<Option<CompletionMarker>, PipelineError>;

    /// Upserts on `(document_id, stage)`
    async fn upsert_completion_marker(&self, marker: &CompletionMarker) -> Result<(), PipelineError>;

    async fn delete_completion_marker(&self, document_id: DocumentId, stage: Stage) -> Result<(), PipelineError>;

    // ------------------------------------------------------------------
    // Stored procedures and raw queries
    // ------------------------------------------------------------------

    /// Whether stage-tracking stored procedures are available. Callers may
    /// also learn this lazily through `MissingFunction` errors.
    fn supports_procedures(&self) -> bool;

    /// Invokes a stored procedure by qualified name with named JSON
    /// parameters, returning raw rows
    async fn execute_rpc(
        &self,
        function_name: &str,
        params: serde_json::Value,
    ) -> Result<Vec<serde_json::Value>, PipelineError>;

    /// Executes a raw query using either named `:param` or positional `$N`
    /// placeholders, normalized to the backend dialect. Backends without a
    /// SQL engine reject this with a structured error.
    async fn execute_raw(
        &self,
        query: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>, PipelineError>;

    // ------------------------------------------------------------------
    // Advisory locks
    // ------------------------------------------------------------------

    /// Attempts to take the advisory lock; `false` means another worker
    /// holds it
    async fn try_advisory_lock(&self, key: i64) -> Result<bool, PipelineError>;

    async fn advisory_unlock(&self, key: i64) -> Result<bool, PipelineError>;

    // ------------------------------------------------------------------
    // Aggregate views
    // ------------------------------------------------------------------

    async fn pipeline_metrics_view(&self) -> Result<PipelineMetricsView, PipelineError>;

    async fn queue_metrics_view(&self) -> Result<QueueMetricsView, PipelineError>;

    async fn stage_statistics(&self) -> Result<Vec<StageStatistics>, PipelineError>;

    async fn duplicate_hash_groups(&self) -> Result<Vec<DuplicateGroup>, PipelineError>;

    async fn duplicate_filename_groups(&self) -> Result<Vec<DuplicateGroup>, PipelineError>;

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    async fn create_queue_item(&self, item: &QueueItem) -> Result<Uuid, PipelineError>;

    async fn update_queue_item(
        &self,
        item_id: Uuid,
        status: QueueItemStatus,
        error_message: Option<String>,
    ) -> Result<(), PipelineError>;

    async fn list_queue_items(
        &self,
        limit: usize,
        status: Option<QueueItemStatus>,
    ) -> Result<Vec<QueueItem>, PipelineError>;

    // ------------------------------------------------------------------
    // Error log
    // ------------------------------------------------------------------

    /// Persists a classified failure, returning the error id
    async fn record_error(&self, record: &ErrorLogRecord) -> Result<Uuid, PipelineError>;

    async fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorLogRecord>, PipelineError>;

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    async fn load_alert_rules(&self) -> Result<Vec<AlertRule>, PipelineError>;

    async fn insert_alert_rule(&self, rule: &AlertRule) -> Result<Uuid, PipelineError>;

    async fn update_alert_rule(&self, rule: &AlertRule) -> Result<bool, PipelineError>;

    async fn delete_alert_rule(&self, rule_id: Uuid) -> Result<bool, PipelineError>;

    /// Finds the active alert for an aggregation key whose last occurrence
    /// falls within the window
    async fn find_active_alert(
        &self,
        aggregation_key: &str,
        window_minutes: u32,
    ) -> Result<Option<Alert>, PipelineError>;

    async fn insert_alert(&self, alert: &Alert) -> Result<Uuid, PipelineError>;

    /// Increments `aggregation_count` and refreshes `last_occurrence`
    async fn increment_alert_aggregation(&self, alert_id: Uuid) -> Result<(), PipelineError>;

    async fn list_alerts(
        &self,
        limit: usize,
        severity: Option<AlertSeverity>,
        status: Option<AlertStatus>,
    ) -> Result<Vec<Alert>, PipelineError>;

    async fn count_unacknowledged_alerts(&self) -> Result<u64, PipelineError>;

    async fn acknowledge_alert(&self, alert_id: Uuid, user_id: &str) -> Result<bool, PipelineError>;

    async fn delete_alert(&self, alert_id: Uuid) -> Result<bool, PipelineError>;

    // ------------------------------------------------------------------
    // Performance baselines
    // ------------------------------------------------------------------

    /// Upserts on `(stage_name, measurement_date)`
    async fn upsert_baseline(
        &self,
        stage_name: &str,
        aggregates: StageAggregates,
        test_document_ids: &[DocumentId],
        notes: Option<&str>,
    ) -> Result<Uuid, PipelineError>;

    /// Writes current metrics onto the most recent baseline for the name,
    /// recomputing the improvement percentage; `false` when no baseline
    /// exists
    async fn update_current_metrics(
        &self,
        stage_name: &str,
        aggregates: StageAggregates,
    ) -> Result<bool, PipelineError>;

    async fn latest_baseline(&self, stage_name: &str) -> Result<Option<PerformanceBaseline>, PipelineError>;

    async fn all_baselines(&self) -> Result<Vec<PerformanceBaseline>, PipelineError>;

    // ------------------------------------------------------------------
    // Analytics
    // ------------------------------------------------------------------

    /// Insert-only record of one search request
    async fn record_search_analytics(&self, analytics: serde_json::Value) -> Result<Uuid, PipelineError>;
}
