// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # In-Memory Database Port
//!
//! A complete implementation of the database port over process-local
//! state. It honors every contract the Postgres implementation does:
//! deduplication keys, completion marker upserts, stage transition
//! procedures, advisory locks, aggregate views, alert aggregation, and
//! cosine similarity search.
//!
//! Unit and integration tests inject this port; small embedded
//! deployments can run on it too. It is a real implementation, not a
//! mock: production code never branches on which port it was given.
//!
//! Construction with [`MemoryDatabasePort::without_procedures`] simulates
//! a store whose stage-tracking migration has not been applied, which is
//! how the stage tracker's degradation path is exercised.
//!
//! Raw SQL passthrough is the one unsupported operation: there is no SQL
//! engine here, so `execute_raw` returns a structured error. Core
//! services use the typed operations exclusively.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use krai_pipeline_domain::{
    Alert, AlertRule, AlertSeverity, AlertStatus, BatchItemOutcome, Chunk, CompletionMarker, ContentHash,
    DatabasePort, Document, DocumentId, DuplicateGroup, EmbeddingRecord, ErrorCodeRecord, ErrorLogRecord,
    ImageRecord, LinkRecord, Manufacturer, PerformanceBaseline, PipelineError, PipelineMetricsView,
    ProcessingStatus, Product, ProductSeries, QueueItem, QueueItemStatus, QueueMetricsView, SimilarityMatch,
    SourceType, Stage, StageAggregates, StageState, StageStatistics, StageStatus, TableRecord, VideoRecord,
};

#[derive(Default)]
struct State {
    documents: HashMap<DocumentId, Document>,
    manufacturers: Vec<Manufacturer>,
    series: Vec<ProductSeries>,
    products: Vec<Product>,
    error_codes: Vec<ErrorCodeRecord>,
    chunks: Vec<Chunk>,
    images: Vec<ImageRecord>,
    links: Vec<LinkRecord>,
    videos: Vec<VideoRecord>,
    tables: Vec<TableRecord>,
    embeddings: Vec<EmbeddingRecord>,
    markers: HashMap<(DocumentId, Stage), CompletionMarker>,
    queue: Vec<QueueItem>,
    error_log: Vec<ErrorLogRecord>,
    alert_rules: Vec<AlertRule>,
    alerts: Vec<Alert>,
    baselines: Vec<PerformanceBaseline>,
    analytics: Vec<serde_json::Value>,
}

/// Process-local implementation of [`DatabasePort`].
pub struct MemoryDatabasePort {
    state: RwLock<State>,
    locks: Mutex<HashSet<i64>>,
    procedures_enabled: bool,
}

impl Default for MemoryDatabasePort {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabasePort {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            locks: Mutex::new(HashSet::new()),
            procedures_enabled: true,
        }
    }

    /// A port whose stage-tracking procedures are absent, as on a store
    /// without the tracking migration
    pub fn without_procedures() -> Self {
        Self {
            procedures_enabled: false,
            ..Self::new()
        }
    }

    fn strip_schema(function_name: &str) -> &str {
        function_name.rsplit('.').next().unwrap_or(function_name)
    }

    fn param_document_id(params: &serde_json::Value) -> Result<DocumentId, PipelineError> {
        params
            .get("p_document_id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| PipelineError::validation_error("missing p_document_id"))?
            .parse()
    }

    fn param_stage(params: &serde_json::Value) -> Result<Stage, PipelineError> {
        params
            .get("p_stage_name")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| PipelineError::validation_error("missing p_stage_name"))?
            .parse()
    }

    fn merge_metadata(state: &mut StageState, metadata: Option<&serde_json::Value>) {
        let Some(serde_json::Value::Object(incoming)) = metadata else {
            return;
        };
        let mut merged = match state.metadata.take() {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        for (key, value) in incoming {
            merged.insert(key.clone(), value.clone());
        }
        state.metadata = serde_json::Value::Object(merged);
    }

    fn with_stage_state(
        state: &mut State,
        document_id: DocumentId,
        stage: Stage,
        apply: impl FnOnce(&mut StageState),
    ) -> Result<(), PipelineError> {
        let document = state
            .documents
            .get_mut(&document_id)
            .ok_or_else(|| PipelineError::not_found(format!("document {}", document_id)))?;
        let entry = document.stage_status.entry(stage).or_insert_with(StageState::pending);
        apply(entry);
        document.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl DatabasePort for MemoryDatabasePort {
    async fn ping(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    async fn create_document(&self, document: &Document) -> Result<DocumentId, PipelineError> {
        let mut state = self.state.write();
        if let Some(existing) = state
            .documents
            .values()
            .find(|d| d.content_hash == document.content_hash)
        {
            return Ok(existing.id);
        }
        state.documents.insert(document.id, document.clone());
        Ok(document.id)
    }

    async fn get_document(&self, document_id: DocumentId) -> Result<Option<Document>, PipelineError> {
        Ok(self.state.read().documents.get(&document_id).cloned())
    }

    async fn get_document_by_hash(&self, content_hash: &ContentHash) -> Result<Option<Document>, PipelineError> {
        Ok(self
            .state
            .read()
            .documents
            .values()
            .find(|d| &d.content_hash == content_hash)
            .cloned())
    }

    async fn update_document_status(
        &self,
        document_id: DocumentId,
        status: ProcessingStatus,
    ) -> Result<(), PipelineError> {
        let mut state = self.state.write();
        let document = state
            .documents
            .get_mut(&document_id)
            .ok_or_else(|| PipelineError::not_found(format!("document {}", document_id)))?;
        document.processing_status = status;
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn list_documents(&self, limit: usize) -> Result<Vec<Document>, PipelineError> {
        let mut documents: Vec<Document> = self.state.read().documents.values().cloned().collect();
        documents.sort_by_key(|d| d.created_at);
        documents.truncate(limit);
        Ok(documents)
    }

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    async fn create_manufacturer(&self, manufacturer: &Manufacturer) -> Result<Uuid, PipelineError> {
        let mut state = self.state.write();
        if let Some(existing) = state
            .manufacturers
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(&manufacturer.name))
        {
            return Ok(existing.id);
        }
        state.manufacturers.push(manufacturer.clone());
        Ok(manufacturer.id)
    }

    async fn get_manufacturer_by_name(&self, name: &str) -> Result<Option<Manufacturer>, PipelineError> {
        Ok(self
            .state
            .read()
            .manufacturers
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn create_product_series(&self, series: &ProductSeries) -> Result<Uuid, PipelineError> {
        let mut state = self.state.write();
        if let Some(existing) = state.series.iter().find(|s| {
            s.manufacturer_id == series.manufacturer_id && s.series_name.eq_ignore_ascii_case(&series.series_name)
        }) {
            return Ok(existing.id);
        }
        state.series.push(series.clone());
        Ok(series.id)
    }

    async fn get_series_by_name(
        &self,
        manufacturer_id: Uuid,
        series_name: &str,
    ) -> Result<Option<ProductSeries>, PipelineError> {
        Ok(self
            .state
            .read()
            .series
            .iter()
            .find(|s| s.manufacturer_id == manufacturer_id && s.series_name.eq_ignore_ascii_case(series_name))
            .cloned())
    }

    async fn create_product(&self, product: &Product) -> Result<Uuid, PipelineError> {
        let mut state = self.state.write();
        if let Some(existing) = state.products.iter().find(|p| {
            p.manufacturer_id == product.manufacturer_id
                && p.model_number.eq_ignore_ascii_case(&product.model_number)
        }) {
            return Ok(existing.id);
        }
        state.products.push(product.clone());
        Ok(product.id)
    }

    async fn get_product_by_model(
        &self,
        manufacturer_id: Uuid,
        model_number: &str,
    ) -> Result<Option<Product>, PipelineError> {
        Ok(self
            .state
            .read()
            .products
            .iter()
            .find(|p| p.manufacturer_id == manufacturer_id && p.model_number.eq_ignore_ascii_case(model_number))
            .cloned())
    }

    async fn create_error_code(&self, error_code: &ErrorCodeRecord) -> Result<Uuid, PipelineError> {
        self.state.write().error_codes.push(error_code.clone());
        Ok(error_code.id)
    }

    async fn get_error_code(&self, code: &str) -> Result<Option<ErrorCodeRecord>, PipelineError> {
        Ok(self.state.read().error_codes.iter().find(|e| e.code == code).cloned())
    }

    // ------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------

    async fn create_chunk(&self, chunk: &Chunk) -> Result<Uuid, PipelineError> {
        let mut state = self.state.write();
        if state
            .chunks
            .iter()
            .any(|c| c.document_id == chunk.document_id && c.chunk_index == chunk.chunk_index)
        {
            return Err(PipelineError::ConstraintViolation(format!(
                "chunk ({}, {}) already exists",
                chunk.document_id, chunk.chunk_index
            )));
        }
        state.chunks.push(chunk.clone());
        Ok(chunk.id)
    }

    async fn get_chunk_by_document_and_index(
        &self,
        document_id: DocumentId,
        chunk_index: u32,
    ) -> Result<Option<Chunk>, PipelineError> {
        Ok(self
            .state
            .read()
            .chunks
            .iter()
            .find(|c| c.document_id == document_id && c.chunk_index == chunk_index)
            .cloned())
    }

    async fn create_image(&self, image: &ImageRecord) -> Result<Uuid, PipelineError> {
        let mut state = self.state.write();
        if let Some(hash) = &image.content_hash {
            if let Some(existing) = state
                .images
                .iter()
                .find(|i| i.content_hash.as_ref() == Some(hash))
            {
                return Ok(existing.id);
            }
        }
        state.images.push(image.clone());
        Ok(image.id)
    }

    async fn get_image_by_hash(&self, content_hash: &ContentHash) -> Result<Option<ImageRecord>, PipelineError> {
        Ok(self
            .state
            .read()
            .images
            .iter()
            .find(|i| i.content_hash.as_ref() == Some(content_hash))
            .cloned())
    }

    async fn create_link(&self, link: &LinkRecord) -> Result<Uuid, PipelineError> {
        self.state.write().links.push(link.clone());
        Ok(link.id)
    }

    async fn create_video(&self, video: &VideoRecord) -> Result<Uuid, PipelineError> {
        let mut state = self.state.write();
        if let Some(link_id) = video.link_id {
            if let Some(existing) = state.videos.iter_mut().find(|v| v.link_id == Some(link_id)) {
                let id = existing.id;
                let mut replacement = video.clone();
                replacement.id = id;
                *existing = replacement;
                return Ok(id);
            }
        }
        state.videos.push(video.clone());
        Ok(video.id)
    }

    async fn create_table(&self, table: &TableRecord) -> Result<Uuid, PipelineError> {
        self.state.write().tables.push(table.clone());
        Ok(table.id)
    }

    async fn count_chunks_by_document(&self, document_id: DocumentId) -> Result<u64, PipelineError> {
        Ok(self
            .state
            .read()
            .chunks
            .iter()
            .filter(|c| c.document_id == document_id)
            .count() as u64)
    }

    async fn count_images_by_document(&self, document_id: DocumentId) -> Result<u64, PipelineError> {
        Ok(self
            .state
            .read()
            .images
            .iter()
            .filter(|i| i.document_id == document_id)
            .count() as u64)
    }

    async fn count_links_by_document(&self, document_id: DocumentId) -> Result<u64, PipelineError> {
        Ok(self
            .state
            .read()
            .links
            .iter()
            .filter(|l| l.document_id == document_id)
            .count() as u64)
    }

    // ------------------------------------------------------------------
    // Embeddings
    // ------------------------------------------------------------------

    async fn create_embedding(&self, embedding: &EmbeddingRecord) -> Result<Uuid, PipelineError> {
        let mut state = self.state.write();
        if let Some(existing) = state.embeddings.iter_mut().find(|e| {
            e.source_id == embedding.source_id
                && e.source_type == embedding.source_type
                && e.model_name == embedding.model_name
        }) {
            // Converge concurrent writes to one row
            let id = existing.id;
            let mut replacement = embedding.clone();
            replacement.id = id;
            *existing = replacement;
            return Ok(id);
        }
        state.embeddings.push(embedding.clone());
        Ok(embedding.id)
    }

    async fn create_embeddings_batch(&self, embeddings: &[EmbeddingRecord]) -> Vec<BatchItemOutcome> {
        let mut outcomes = Vec::with_capacity(embeddings.len());
        for embedding in embeddings {
            if embedding.embedding.is_empty() {
                outcomes.push(BatchItemOutcome::failed(embedding.source_id, "empty embedding vector"));
                continue;
            }
            match self.create_embedding(embedding).await {
                Ok(id) => outcomes.push(BatchItemOutcome::stored(embedding.source_id, id)),
                Err(e) => outcomes.push(BatchItemOutcome::failed(embedding.source_id, e.to_string())),
            }
        }
        outcomes
    }

    async fn get_embedding_by_source(
        &self,
        source_id: Uuid,
        source_type: SourceType,
        model_name: &str,
    ) -> Result<Option<EmbeddingRecord>, PipelineError> {
        Ok(self
            .state
            .read()
            .embeddings
            .iter()
            .find(|e| e.source_id == source_id && e.source_type == source_type && e.model_name == model_name)
            .cloned())
    }

    async fn embedding_exists(&self, source_id: Uuid, source_type: SourceType) -> Result<bool, PipelineError> {
        Ok(self
            .state
            .read()
            .embeddings
            .iter()
            .any(|e| e.source_id == source_id && e.source_type == source_type))
    }

    async fn search_embeddings(
        &self,
        query: &[f32],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<SimilarityMatch>, PipelineError> {
        let state = self.state.read();
        let mut matches: Vec<SimilarityMatch> = state
            .embeddings
            .iter()
            .filter(|e| e.embedding.len() == query.len())
            .map(|e| SimilarityMatch {
                similarity: cosine_similarity(query, &e.embedding),
                embedding: e.clone(),
            })
            .filter(|m| m.similarity >= threshold)
            .collect();
        matches.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(limit);
        Ok(matches)
    }

    // ------------------------------------------------------------------
    // Completion markers
    // ------------------------------------------------------------------

    async fn get_completion_marker(
        &self,
        document_id: DocumentId,
        stage: Stage,
    ) -> Result<Option<CompletionMarker>, PipelineError> {
        Ok(self.state.read().markers.get(&(document_id, stage)).cloned())
    }

    async fn upsert_completion_marker(&self, marker: &CompletionMarker) -> Result<(), PipelineError> {
        self.state
            .write()
            .markers
            .insert((marker.document_id, marker.stage), marker.clone());
        Ok(())
    }

    async fn delete_completion_marker(&self, document_id: DocumentId, stage: Stage) -> Result<(), PipelineError> {
        self.state.write().markers.remove(&(document_id, stage));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stored procedures
    // ------------------------------------------------------------------

    fn supports_procedures(&self) -> bool {
        self.procedures_enabled
    }

    async fn execute_rpc(
        &self,
        function_name: &str,
        params: serde_json::Value,
    ) -> Result<Vec<serde_json::Value>, PipelineError> {
        if !self.procedures_enabled {
            return Err(PipelineError::MissingFunction(format!(
                "function {} does not exist",
                function_name
            )));
        }

        let mut state = self.state.write();
        match Self::strip_schema(function_name) {
            "start_stage" => {
                let document_id = Self::param_document_id(&params)?;
                let stage = Self::param_stage(&params)?;
                let document = state
                    .documents
                    .get_mut(&document_id)
                    .ok_or_else(|| PipelineError::not_found(format!("document {}", document_id)))?;
                document.processing_status = ProcessingStatus::InProgress;
                let entry = document.stage_status.entry(stage).or_insert_with(StageState::pending);
                entry.status = StageStatus::Processing;
                entry.started_at = Some(Utc::now());
                entry.progress_percent = 0.0;
                document.updated_at = Utc::now();
                Ok(vec![])
            }
            "update_stage_progress" => {
                let document_id = Self::param_document_id(&params)?;
                let stage = Self::param_stage(&params)?;
                let progress = params
                    .get("p_progress")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(0.0);
                Self::with_stage_state(&mut state, document_id, stage, |entry| {
                    if entry.status == StageStatus::Pending {
                        entry.status = StageStatus::Processing;
                    }
                    entry.progress_percent = progress.clamp(0.0, 100.0);
                    Self::merge_metadata(entry, params.get("p_metadata"));
                })?;
                Ok(vec![])
            }
            "complete_stage" => {
                let document_id = Self::param_document_id(&params)?;
                let stage = Self::param_stage(&params)?;
                Self::with_stage_state(&mut state, document_id, stage, |entry| {
                    entry.status = StageStatus::Completed;
                    entry.progress_percent = 100.0;
                    entry.completed_at = Some(Utc::now());
                    Self::merge_metadata(entry, params.get("p_metadata"));
                })?;
                Ok(vec![])
            }
            "fail_stage" => {
                let document_id = Self::param_document_id(&params)?;
                let stage = Self::param_stage(&params)?;
                let error = params
                    .get("p_error")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                Self::with_stage_state(&mut state, document_id, stage, |entry| {
                    entry.status = StageStatus::Failed;
                    entry.completed_at = Some(Utc::now());
                    entry.error = Some(error);
                    Self::merge_metadata(entry, params.get("p_metadata"));
                })?;
                Ok(vec![])
            }
            "skip_stage" => {
                let document_id = Self::param_document_id(&params)?;
                let stage = Self::param_stage(&params)?;
                let reason = params
                    .get("p_reason")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("Not applicable")
                    .to_string();
                Self::with_stage_state(&mut state, document_id, stage, |entry| {
                    entry.status = StageStatus::Skipped;
                    entry.completed_at = Some(Utc::now());
                    Self::merge_metadata(entry, Some(&serde_json::json!({"skip_reason": reason})));
                })?;
                Ok(vec![])
            }
            "get_document_progress" => {
                let document_id = Self::param_document_id(&params)?;
                let progress = state
                    .documents
                    .get(&document_id)
                    .map(Document::overall_progress)
                    .unwrap_or(0.0);
                Ok(vec![serde_json::json!({"progress": progress})])
            }
            "get_current_stage" => {
                let document_id = Self::param_document_id(&params)?;
                let stage = state
                    .documents
                    .get(&document_id)
                    .and_then(Document::current_stage)
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|| "completed".to_string());
                Ok(vec![serde_json::json!({"stage": stage})])
            }
            "can_start_stage" => {
                let document_id = Self::param_document_id(&params)?;
                let stage = Self::param_stage(&params)?;
                let can_start = state
                    .documents
                    .get(&document_id)
                    .map(|d| d.can_start_stage(stage))
                    .unwrap_or(false);
                Ok(vec![serde_json::json!({"can_start": can_start})])
            }
            other => Err(PipelineError::MissingFunction(format!(
                "function {} does not exist",
                other
            ))),
        }
    }

    async fn execute_raw(
        &self,
        _query: &str,
        _params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>, PipelineError> {
        Err(PipelineError::database_error(
            "raw SQL is not supported by the in-memory backend",
        ))
    }

    // ------------------------------------------------------------------
    // Advisory locks
    // ------------------------------------------------------------------

    async fn try_advisory_lock(&self, key: i64) -> Result<bool, PipelineError> {
        Ok(self.locks.lock().insert(key))
    }

    async fn advisory_unlock(&self, key: i64) -> Result<bool, PipelineError> {
        Ok(self.locks.lock().remove(&key))
    }

    // ------------------------------------------------------------------
    // Aggregate views
    // ------------------------------------------------------------------

    async fn pipeline_metrics_view(&self) -> Result<PipelineMetricsView, PipelineError> {
        let state = self.state.read();
        let documents: Vec<&Document> = state.documents.values().collect();
        let count = |status: ProcessingStatus| documents.iter().filter(|d| d.processing_status == status).count() as u64;

        let completed = count(ProcessingStatus::Completed);
        let failed = count(ProcessingStatus::Failed);
        let finished = completed + failed;

        let mut durations = Vec::new();
        for document in &documents {
            for stage_state in document.stage_status.values() {
                if let Some(duration) = stage_state.duration_seconds() {
                    durations.push(duration);
                }
            }
        }

        let cutoff = Utc::now() - ChronoDuration::hours(24);
        let recent = documents
            .iter()
            .filter(|d| d.processing_status == ProcessingStatus::Completed && d.updated_at > cutoff)
            .count() as u64;

        Ok(PipelineMetricsView {
            total_documents: documents.len() as u64,
            documents_pending: count(ProcessingStatus::Pending),
            documents_processing: count(ProcessingStatus::InProgress),
            documents_completed: completed,
            documents_failed: failed,
            success_rate: if finished > 0 {
                completed as f64 / finished as f64 * 100.0
            } else {
                0.0
            },
            avg_processing_time_seconds: if durations.is_empty() {
                0.0
            } else {
                durations.iter().sum::<f64>() / durations.len() as f64
            },
            recent_24h_count: recent,
        })
    }

    async fn queue_metrics_view(&self) -> Result<QueueMetricsView, PipelineError> {
        let state = self.state.read();
        let now = Utc::now();
        let count = |status: QueueItemStatus| state.queue.iter().filter(|i| i.status == status).count() as u64;

        let mut by_task_type = BTreeMap::new();
        let mut waits = Vec::new();
        for item in &state.queue {
            *by_task_type.entry(item.task_type.clone()).or_insert(0u64) += 1;
            waits.push(item.wait_seconds(now));
        }

        Ok(QueueMetricsView {
            total_items: state.queue.len() as u64,
            pending_count: count(QueueItemStatus::Pending),
            processing_count: count(QueueItemStatus::Processing),
            completed_count: count(QueueItemStatus::Completed),
            failed_count: count(QueueItemStatus::Failed),
            avg_wait_time_seconds: if waits.is_empty() {
                0.0
            } else {
                waits.iter().sum::<f64>() / waits.len() as f64
            },
            by_task_type,
        })
    }

    async fn stage_statistics(&self) -> Result<Vec<StageStatistics>, PipelineError> {
        let state = self.state.read();
        let mut rows = Vec::with_capacity(Stage::ALL.len());

        for stage in Stage::ALL {
            let mut stats = StageStatistics::empty(stage);
            let mut durations = Vec::new();

            for document in state.documents.values() {
                let Some(stage_state) = document.stage_status.get(&stage) else {
                    stats.pending_count += 1;
                    continue;
                };
                match stage_state.status {
                    StageStatus::Pending => stats.pending_count += 1,
                    StageStatus::Processing => stats.processing_count += 1,
                    StageStatus::Completed => stats.completed_count += 1,
                    StageStatus::Failed => stats.failed_count += 1,
                    StageStatus::Skipped => stats.skipped_count += 1,
                }
                if let Some(duration) = stage_state.duration_seconds() {
                    durations.push(duration);
                }
            }

            let finished = stats.completed_count + stats.failed_count;
            stats.success_rate = if finished > 0 {
                stats.completed_count as f64 / finished as f64 * 100.0
            } else {
                0.0
            };
            stats.avg_duration_seconds = if durations.is_empty() {
                0.0
            } else {
                durations.iter().sum::<f64>() / durations.len() as f64
            };
            rows.push(stats);
        }
        Ok(rows)
    }

    async fn duplicate_hash_groups(&self) -> Result<Vec<DuplicateGroup>, PipelineError> {
        let state = self.state.read();
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for document in state.documents.values() {
            groups
                .entry(document.content_hash.as_str().to_string())
                .or_default()
                .push(document.filename.clone());
        }
        Ok(collect_duplicate_groups(groups))
    }

    async fn duplicate_filename_groups(&self) -> Result<Vec<DuplicateGroup>, PipelineError> {
        let state = self.state.read();
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for document in state.documents.values() {
            groups
                .entry(document.filename.clone())
                .or_default()
                .push(document.filename.clone());
        }
        Ok(collect_duplicate_groups(groups))
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    async fn create_queue_item(&self, item: &QueueItem) -> Result<Uuid, PipelineError> {
        self.state.write().queue.push(item.clone());
        Ok(item.id)
    }

    async fn update_queue_item(
        &self,
        item_id: Uuid,
        status: QueueItemStatus,
        error_message: Option<String>,
    ) -> Result<(), PipelineError> {
        let mut state = self.state.write();
        let item = state
            .queue
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(|| PipelineError::not_found(format!("queue item {}", item_id)))?;
        if status == QueueItemStatus::Processing && item.started_at.is_none() {
            item.started_at = Some(Utc::now());
        }
        item.status = status;
        item.error_message = error_message;
        Ok(())
    }

    async fn list_queue_items(
        &self,
        limit: usize,
        status: Option<QueueItemStatus>,
    ) -> Result<Vec<QueueItem>, PipelineError> {
        let state = self.state.read();
        let mut items: Vec<QueueItem> = state
            .queue
            .iter()
            .filter(|i| status.map(|s| i.status == s).unwrap_or(true))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.scheduled_at.cmp(&b.scheduled_at)));
        items.truncate(limit);
        Ok(items)
    }

    // ------------------------------------------------------------------
    // Error log
    // ------------------------------------------------------------------

    async fn record_error(&self, record: &ErrorLogRecord) -> Result<Uuid, PipelineError> {
        self.state.write().error_log.push(record.clone());
        Ok(record.id)
    }

    async fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorLogRecord>, PipelineError> {
        let state = self.state.read();
        let mut errors = state.error_log.clone();
        errors.sort_by(|a, b| b.last_occurrence.cmp(&a.last_occurrence));
        errors.truncate(limit);
        Ok(errors)
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    async fn load_alert_rules(&self) -> Result<Vec<AlertRule>, PipelineError> {
        Ok(self.state.read().alert_rules.clone())
    }

    async fn insert_alert_rule(&self, rule: &AlertRule) -> Result<Uuid, PipelineError> {
        self.state.write().alert_rules.push(rule.clone());
        Ok(rule.id)
    }

    async fn update_alert_rule(&self, rule: &AlertRule) -> Result<bool, PipelineError> {
        let mut state = self.state.write();
        match state.alert_rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => {
                *existing = rule.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_alert_rule(&self, rule_id: Uuid) -> Result<bool, PipelineError> {
        let mut state = self.state.write();
        let before = state.alert_rules.len();
        state.alert_rules.retain(|r| r.id != rule_id);
        Ok(state.alert_rules.len() < before)
    }

    async fn find_active_alert(
        &self,
        aggregation_key: &str,
        window_minutes: u32,
    ) -> Result<Option<Alert>, PipelineError> {
        let state = self.state.read();
        let cutoff = Utc::now() - ChronoDuration::minutes(window_minutes as i64);
        Ok(state
            .alerts
            .iter()
            .find(|a| {
                a.aggregation_key.as_deref() == Some(aggregation_key)
                    && !a.acknowledged
                    && a.last_occurrence > cutoff
            })
            .cloned())
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<Uuid, PipelineError> {
        self.state.write().alerts.push(alert.clone());
        Ok(alert.id)
    }

    async fn increment_alert_aggregation(&self, alert_id: Uuid) -> Result<(), PipelineError> {
        let mut state = self.state.write();
        let alert = state
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| PipelineError::not_found(format!("alert {}", alert_id)))?;
        alert.aggregation_count += 1;
        alert.last_occurrence = Utc::now();
        Ok(())
    }

    async fn list_alerts(
        &self,
        limit: usize,
        severity: Option<AlertSeverity>,
        status: Option<AlertStatus>,
    ) -> Result<Vec<Alert>, PipelineError> {
        let state = self.state.read();
        let mut alerts: Vec<Alert> = state
            .alerts
            .iter()
            .filter(|a| severity.map(|s| a.severity == s).unwrap_or(true))
            .filter(|a| status.map(|s| a.status == s).unwrap_or(true))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        alerts.truncate(limit);
        Ok(alerts)
    }

    async fn count_unacknowledged_alerts(&self) -> Result<u64, PipelineError> {
        Ok(self.state.read().alerts.iter().filter(|a| !a.acknowledged).count() as u64)
    }

    async fn acknowledge_alert(&self, alert_id: Uuid, user_id: &str) -> Result<bool, PipelineError> {
        let mut state = self.state.write();
        match state.alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                alert.acknowledged_by = Some(user_id.to_string());
                alert.acknowledged_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_alert(&self, alert_id: Uuid) -> Result<bool, PipelineError> {
        let mut state = self.state.write();
        let before = state.alerts.len();
        state.alerts.retain(|a| a.id != alert_id);
        Ok(state.alerts.len() < before)
    }

    // ------------------------------------------------------------------
    // Performance baselines
    // ------------------------------------------------------------------

    async fn upsert_baseline(
        &self,
        stage_name: &str,
        aggregates: StageAggregates,
        test_document_ids: &[DocumentId],
        notes: Option<&str>,
    ) -> Result<Uuid, PipelineError> {
        let mut state = self.state.write();
        let today = Utc::now().date_naive();

        if let Some(existing) = state
            .baselines
            .iter_mut()
            .find(|b| b.stage_name == stage_name && b.measurement_date == today)
        {
            existing.baseline = aggregates;
            existing.test_document_ids = test_document_ids.to_vec();
            existing.notes = notes.map(str::to_string);
            return Ok(existing.id);
        }

        let baseline = PerformanceBaseline {
            id: Uuid::new_v4(),
            stage_name: stage_name.to_string(),
            measurement_date: today,
            baseline: aggregates,
            current: None,
            improvement_percentage: None,
            test_document_ids: test_document_ids.to_vec(),
            notes: notes.map(str::to_string),
        };
        let id = baseline.id;
        state.baselines.push(baseline);
        Ok(id)
    }

    async fn update_current_metrics(
        &self,
        stage_name: &str,
        aggregates: StageAggregates,
    ) -> Result<bool, PipelineError> {
        let mut state = self.state.write();
        let Some(latest) = state
            .baselines
            .iter_mut()
            .filter(|b| b.stage_name == stage_name)
            .max_by_key(|b| b.measurement_date)
        else {
            return Ok(false);
        };

        latest.current = Some(aggregates);
        latest.improvement_percentage = if latest.baseline.avg_seconds != 0.0 {
            Some((latest.baseline.avg_seconds - aggregates.avg_seconds) / latest.baseline.avg_seconds * 100.0)
        } else {
            None
        };
        Ok(true)
    }

    async fn latest_baseline(&self, stage_name: &str) -> Result<Option<PerformanceBaseline>, PipelineError> {
        let state = self.state.read();
        Ok(state
            .baselines
            .iter()
            .filter(|b| b.stage_name == stage_name)
            .max_by_key(|b| b.measurement_date)
            .cloned())
    }

    async fn all_baselines(&self) -> Result<Vec<PerformanceBaseline>, PipelineError> {
        Ok(self.state.read().baselines.clone())
    }

    // ------------------------------------------------------------------
    // Analytics
    // ------------------------------------------------------------------

    async fn record_search_analytics(&self, analytics: serde_json::Value) -> Result<Uuid, PipelineError> {
        self.state.write().analytics.push(analytics);
        Ok(Uuid::new_v4())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|y| (*y as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn collect_duplicate_groups(groups: HashMap<String, Vec<String>>) -> Vec<DuplicateGroup> {
    let mut duplicates: Vec<DuplicateGroup> = groups
        .into_iter()
        .filter(|(_, filenames)| filenames.len() > 1)
        .map(|(key, filenames)| DuplicateGroup {
            key,
            count: filenames.len() as u64,
            filenames,
        })
        .collect();
    duplicates.sort_by(|a, b| b.count.cmp(&a.count));
    duplicates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(filename: &str, bytes: &[u8]) -> Document {
        Document::new(filename, bytes.len() as u64, ContentHash::of_bytes(bytes), "service_manual", "en")
    }

    #[tokio::test]
    async fn documents_deduplicate_by_content_hash() {
        let port = MemoryDatabasePort::new();
        let first = document("a.pdf", b"same bytes");
        let second = document("b.pdf", b"same bytes");

        let first_id = port.create_document(&first).await.unwrap();
        let second_id = port.create_document(&second).await.unwrap();
        assert_eq!(first_id, second_id);
        assert_eq!(port.list_documents(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn advisory_locks_are_exclusive() {
        let port = MemoryDatabasePort::new();
        assert!(port.try_advisory_lock(42).await.unwrap());
        assert!(!port.try_advisory_lock(42).await.unwrap());
        assert!(port.advisory_unlock(42).await.unwrap());
        assert!(port.try_advisory_lock(42).await.unwrap());
    }

    #[tokio::test]
    async fn chunk_index_uniqueness_is_enforced() {
        let port = MemoryDatabasePort::new();
        let doc = document("a.pdf", b"x");
        port.create_document(&doc).await.unwrap();

        let chunk = Chunk::new(doc.id, 0, "first");
        port.create_chunk(&chunk).await.unwrap();

        let duplicate = Chunk::new(doc.id, 0, "second");
        let result = port.create_chunk(&duplicate).await;
        assert!(matches!(result, Err(PipelineError::ConstraintViolation(_))));
    }

    #[tokio::test]
    async fn embeddings_round_trip_and_converge() {
        let port = MemoryDatabasePort::new();
        let source = Uuid::new_v4();
        let record = EmbeddingRecord::new(source, SourceType::Text, vec![0.1, 0.2, 0.3], "embeddinggemma");

        let id = port.create_embedding(&record).await.unwrap();
        let mut replacement = EmbeddingRecord::new(source, SourceType::Text, vec![0.4, 0.5, 0.6], "embeddinggemma");
        replacement.embedding_context = Some("updated".to_string());
        let replayed = port.create_embedding(&replacement).await.unwrap();
        assert_eq!(id, replayed);

        let fetched = port
            .get_embedding_by_source(source, SourceType::Text, "embeddinggemma")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.embedding, vec![0.4, 0.5, 0.6]);
    }

    #[tokio::test]
    async fn similarity_search_orders_descending() {
        let port = MemoryDatabasePort::new();
        for (vector, name) in [
            (vec![1.0f32, 0.0, 0.0], "exact"),
            (vec![0.7f32, 0.7, 0.0], "close"),
            (vec![0.0f32, 1.0, 0.0], "orthogonal"),
        ] {
            let mut record = EmbeddingRecord::new(Uuid::new_v4(), SourceType::Text, vector, "m");
            record.embedding_context = Some(name.to_string());
            port.create_embedding(&record).await.unwrap();
        }

        let matches = port.search_embeddings(&[1.0, 0.0, 0.0], 10, 0.1).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches[0].similarity > matches[1].similarity);
        assert_eq!(matches[0].embedding.embedding_context.as_deref(), Some("exact"));
    }

    #[tokio::test]
    async fn stage_procedures_drive_the_state_machine() {
        let port = MemoryDatabasePort::new();
        let doc = document("a.pdf", b"x");
        port.create_document(&doc).await.unwrap();

        let params = |extra: serde_json::Value| {
            let mut map = serde_json::json!({
                "p_document_id": doc.id.to_string(),
                "p_stage_name": "upload",
            });
            if let (Some(base), Some(more)) = (map.as_object_mut(), extra.as_object()) {
                for (k, v) in more {
                    base.insert(k.clone(), v.clone());
                }
            }
            map
        };

        port.execute_rpc("krai_core.start_stage", params(serde_json::json!({})))
            .await
            .unwrap();
        port.execute_rpc(
            "krai_core.update_stage_progress",
            params(serde_json::json!({"p_progress": 50.0})),
        )
        .await
        .unwrap();
        port.execute_rpc("krai_core.complete_stage", params(serde_json::json!({"p_metadata": {}})))
            .await
            .unwrap();

        let stored = port.get_document(doc.id).await.unwrap().unwrap();
        let upload = stored.stage_status.get(&Stage::Upload).unwrap();
        assert_eq!(upload.status, StageStatus::Completed);
        assert_eq!(upload.progress_percent, 100.0);

        let rows = port
            .execute_rpc(
                "krai_core.can_start_stage",
                serde_json::json!({"p_document_id": doc.id.to_string(), "p_stage_name": "text_extraction"}),
            )
            .await
            .unwrap();
        assert_eq!(rows[0]["can_start"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn queue_items_and_analytics_round_trip() {
        let port = MemoryDatabasePort::new();

        let mut item = QueueItem::new("document_processing");
        item.priority = 8;
        port.create_queue_item(&item).await.unwrap();
        port.create_queue_item(&QueueItem::new("batch_delete")).await.unwrap();

        port.update_queue_item(item.id, QueueItemStatus::Processing, None)
            .await
            .unwrap();

        let processing = port
            .list_queue_items(10, Some(QueueItemStatus::Processing))
            .await
            .unwrap();
        assert_eq!(processing.len(), 1);
        assert!(processing[0].started_at.is_some());

        let view = port.queue_metrics_view().await.unwrap();
        assert_eq!(view.total_items, 2);
        assert_eq!(view.processing_count, 1);
        assert_eq!(view.by_task_type["document_processing"], 1);

        port.record_search_analytics(serde_json::json!({"query": "fuser unit", "results": 7}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_procedures_surface_as_missing_function() {
        let port = MemoryDatabasePort::without_procedures();
        assert!(!port.supports_procedures());
        let result = port
            .execute_rpc("krai_core.start_stage", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(PipelineError::MissingFunction(_))));
    }
}
