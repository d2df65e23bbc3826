// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # PostgreSQL Database Port
//!
//! Production implementation of the database port over a sqlx connection
//! pool. Tables are segregated by concern into `<prefix>_core`,
//! `<prefix>_content`, `<prefix>_intelligence`, `<prefix>_system`, and
//! `<prefix>_parts` schemas; the prefix defaults to `krai`.
//!
//! ## Placeholder Normalization
//!
//! Raw queries may use either named `:param` or positional `$N`
//! placeholders. Named placeholders are rewritten to `$N` in first-use
//! order and the parameter list is reordered to match, so callers can
//! write whichever style reads better.
//!
//! ## Advisory Locks
//!
//! Postgres advisory locks are session-scoped, so taking one through a
//! pool is only correct when the session stays pinned. A successful
//! `try_advisory_lock` therefore parks its pooled connection in a held
//! map keyed by the lock key; `advisory_unlock` releases the lock on that
//! same connection and returns it to the pool.
//!
//! ## Stored Procedures
//!
//! `execute_rpc` builds a named-argument call (`fn(p_x := $1, ...)`) so
//! JSON parameter order never matters. Argument casts follow the
//! procedure parameter naming convention: `*_id` casts to `uuid`,
//! `p_progress` to `float8`, `p_metadata` to `jsonb`, everything else to
//! `text`. An undefined function (SQLSTATE 42883) surfaces as
//! `PipelineError::MissingFunction` so the stage tracker can degrade.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, warn};
use uuid::Uuid;

use krai_pipeline_domain::{
    Alert, AlertRule, AlertSeverity, AlertStatus, BatchItemOutcome, Chunk, CompletionMarker, ContentHash,
    DatabasePort, Document, DocumentId, DuplicateGroup, EmbeddingRecord, ErrorCodeRecord, ErrorLogRecord,
    ImageRecord, LinkRecord, Manufacturer, PerformanceBaseline, PipelineError, PipelineMetricsView,
    ProcessingStatus, Product, ProductSeries, QueueItem, QueueItemStatus, QueueMetricsView, SimilarityMatch,
    SourceType, Stage, StageAggregates, StageState, StageStatistics, TableRecord, VideoRecord,
};

use crate::infrastructure::config::DatabaseConfig;

/// sqlx-backed implementation of [`DatabasePort`].
pub struct PostgresDatabasePort {
    pool: PgPool,
    prefix: String,
    /// Connections pinned while they hold an advisory lock
    held_locks: tokio::sync::Mutex<HashMap<i64, sqlx::pool::PoolConnection<sqlx::Postgres>>>,
}

impl PostgresDatabasePort {
    /// Connects a pool and verifies connectivity
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, PipelineError> {
        if config.url.is_empty() {
            return Err(PipelineError::invalid_config("POSTGRES_URL is not set"));
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.statement_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(map_sqlx_error)?;

        let port = Self {
            pool,
            prefix: config.schema_prefix.clone(),
            held_locks: tokio::sync::Mutex::new(HashMap::new()),
        };
        port.ping().await?;
        Ok(port)
    }

    fn core(&self, table: &str) -> String {
        format!("{}_core.{}", self.prefix, table)
    }

    fn content(&self, table: &str) -> String {
        format!("{}_content.{}", self.prefix, table)
    }

    fn intelligence(&self, table: &str) -> String {
        format!("{}_intelligence.{}", self.prefix, table)
    }

    fn system(&self, table: &str) -> String {
        format!("{}_system.{}", self.prefix, table)
    }
}

// ---------------------------------------------------------------------------
// Error and value mapping helpers
// ---------------------------------------------------------------------------

fn map_sqlx_error(error: sqlx::Error) -> PipelineError {
    match &error {
        sqlx::Error::RowNotFound => PipelineError::not_found("row not found"),
        sqlx::Error::PoolTimedOut => PipelineError::timeout("connection pool timed out"),
        sqlx::Error::Io(io) => PipelineError::connection_lost(io.to_string()),
        sqlx::Error::PoolClosed => PipelineError::connection_lost("connection pool closed"),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") | Some("23503") | Some("23514") => PipelineError::ConstraintViolation(db.to_string()),
            Some("42883") => PipelineError::MissingFunction(db.to_string()),
            Some("57014") => PipelineError::timeout(db.to_string()),
            Some(code) if code.starts_with("08") => PipelineError::connection_lost(db.to_string()),
            _ => PipelineError::database_error(db.to_string()),
        },
        _ => PipelineError::database_error(error.to_string()),
    }
}

/// Rewrites named `:param` placeholders to positional `$N` in first-use
/// order, returning the rewritten query and the parameter name order.
/// Queries already using `$N` pass through untouched.
pub fn normalize_placeholders(query: &str) -> (String, Vec<String>) {
    // `::` is a cast, not a placeholder, so a bare `:name` only counts
    // when the previous character is not a colon
    static NAMED: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"(^|[^:]):([a-zA-Z_][a-zA-Z0-9_]*)").expect("valid regex")
    });

    if !query.contains(':') {
        return (query.to_string(), Vec::new());
    }

    let mut order: Vec<String> = Vec::new();
    let rewritten = NAMED.replace_all(query, |caps: &regex::Captures<'_>| {
        let name = caps[2].to_string();
        let index = match order.iter().position(|n| *n == name) {
            Some(index) => index,
            None => {
                order.push(name);
                order.len() - 1
            }
        };
        format!("{}${}", &caps[1], index + 1)
    });
    (rewritten.into_owned(), order)
}

fn bind_json<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &'q serde_json::Value,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        serde_json::Value::Null => query.bind(Option::<String>::None),
        serde_json::Value::Bool(b) => query.bind(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other),
    }
}

fn cast_for_param(name: &str) -> &'static str {
    if name.ends_with("_id") {
        "uuid"
    } else if name == "p_progress" {
        "float8"
    } else if name == "p_metadata" {
        "jsonb"
    } else {
        "text"
    }
}

fn vector_literal(values: &[f32]) -> String {
    let joined: Vec<String> = values.iter().map(|v| format!("{:.8}", v)).collect();
    format!("[{}]", joined.join(","))
}

fn parse_vector(text: &str) -> Vec<f32> {
    text.trim_matches(|c| c == '[' || c == ']')
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

fn parse_stage_status(value: serde_json::Value) -> BTreeMap<Stage, StageState> {
    let serde_json::Value::Object(map) = value else {
        return BTreeMap::new();
    };
    let mut statuses = BTreeMap::new();
    for (key, state) in map {
        let Ok(stage) = key.parse::<Stage>() else {
            warn!(stage = %key, "unknown stage name in stored stage_status; ignoring");
            continue;
        };
        match serde_json::from_value::<StageState>(state) {
            Ok(state) => {
                statuses.insert(stage, state);
            }
            Err(e) => warn!(stage = %key, error = %e, "malformed stage state; ignoring"),
        }
    }
    statuses
}

fn document_from_row(row: &PgRow) -> Result<Document, PipelineError> {
    let status: String = row.try_get("processing_status").map_err(map_sqlx_error)?;
    let hash: String = row.try_get("file_hash").map_err(map_sqlx_error)?;
    Ok(Document {
        id: DocumentId::from_uuid(row.try_get("id").map_err(map_sqlx_error)?),
        filename: row.try_get("filename").map_err(map_sqlx_error)?,
        file_size: row.try_get::<i64, _>("file_size").map_err(map_sqlx_error)? as u64,
        content_hash: ContentHash::from_hex(hash)?,
        document_type: row.try_get("document_type").map_err(map_sqlx_error)?,
        language: row.try_get("language").map_err(map_sqlx_error)?,
        processing_status: status.parse()?,
        stage_status: parse_stage_status(
            row.try_get::<serde_json::Value, _>("stage_status")
                .unwrap_or(serde_json::Value::Null),
        ),
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx_error)?,
    })
}

fn alert_from_row(row: &PgRow) -> Result<Alert, PipelineError> {
    let severity: String = row.try_get("severity").map_err(map_sqlx_error)?;
    let status: String = row.try_get("status").map_err(map_sqlx_error)?;
    Ok(Alert {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        alert_type: row.try_get("alert_type").map_err(map_sqlx_error)?,
        severity: severity.parse()?,
        title: row.try_get("title").map_err(map_sqlx_error)?,
        message: row.try_get("message").map_err(map_sqlx_error)?,
        metadata: row
            .try_get::<serde_json::Value, _>("metadata")
            .unwrap_or(serde_json::Value::Null),
        aggregation_key: row.try_get("aggregation_key").map_err(map_sqlx_error)?,
        aggregation_count: row.try_get::<i32, _>("aggregation_count").map_err(map_sqlx_error)? as u32,
        first_occurrence: row.try_get("first_occurrence").map_err(map_sqlx_error)?,
        last_occurrence: row.try_get("last_occurrence").map_err(map_sqlx_error)?,
        triggered_at: row.try_get("triggered_at").map_err(map_sqlx_error)?,
        status: if status == "sent" { AlertStatus::Sent } else { AlertStatus::Pending },
        acknowledged: row.try_get("acknowledged").map_err(map_sqlx_error)?,
        acknowledged_by: row.try_get("acknowledged_by").map_err(map_sqlx_error)?,
        acknowledged_at: row.try_get("acknowledged_at").map_err(map_sqlx_error)?,
    })
}

fn aggregates_from_prefix(row: &PgRow, prefix: &str) -> Option<StageAggregates> {
    let get = |metric: &str| -> Option<f64> { row.try_get(format!("{}_{}_seconds", prefix, metric).as_str()).ok() };
    Some(StageAggregates {
        avg_seconds: get("avg")?,
        p50_seconds: get("p50")?,
        p95_seconds: get("p95")?,
        p99_seconds: get("p99")?,
    })
}

// ---------------------------------------------------------------------------
// Port implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl DatabasePort for PostgresDatabasePort {
    async fn ping(&self) -> Result<(), PipelineError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn create_document(&self, document: &Document) -> Result<DocumentId, PipelineError> {
        if let Some(existing) = self.get_document_by_hash(&document.content_hash).await? {
            debug!(id = %existing.id, "document with identical content hash exists");
            return Ok(existing.id);
        }

        let sql = format!(
            "INSERT INTO {} (id, filename, file_size, file_hash, document_type, language, processing_status, \
             stage_status, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (file_hash) DO NOTHING RETURNING id",
            self.core("documents")
        );
        let inserted = sqlx::query(&sql)
            .bind(document.id.as_uuid())
            .bind(&document.filename)
            .bind(document.file_size as i64)
            .bind(document.content_hash.as_str())
            .bind(&document.document_type)
            .bind(&document.language)
            .bind(document.processing_status.as_str())
            .bind(serde_json::to_value(&document.stage_status)?)
            .bind(document.created_at)
            .bind(document.updated_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        match inserted {
            Some(row) => Ok(DocumentId::from_uuid(row.try_get("id").map_err(map_sqlx_error)?)),
            // Lost a concurrent insert race; the winner owns the hash
            None => self
                .get_document_by_hash(&document.content_hash)
                .await?
                .map(|d| d.id)
                .ok_or_else(|| PipelineError::database_error("conflicting document vanished")),
        }
    }

    async fn get_document(&self, document_id: DocumentId) -> Result<Option<Document>, PipelineError> {
        let sql = format!("SELECT * FROM {} WHERE id = $1", self.core("documents"));
        let row = sqlx::query(&sql)
            .bind(document_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn get_document_by_hash(&self, content_hash: &ContentHash) -> Result<Option<Document>, PipelineError> {
        let sql = format!("SELECT * FROM {} WHERE file_hash = $1 LIMIT 1", self.core("documents"));
        let row = sqlx::query(&sql)
            .bind(content_hash.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn update_document_status(
        &self,
        document_id: DocumentId,
        status: ProcessingStatus,
    ) -> Result<(), PipelineError> {
        let sql = format!(
            "UPDATE {} SET processing_status = $2, updated_at = $3 WHERE id = $1",
            self.core("documents")
        );
        let result = sqlx::query(&sql)
            .bind(document_id.as_uuid())
            .bind(status.as_str())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found(format!("document {}", document_id)));
        }
        Ok(())
    }

    async fn list_documents(&self, limit: usize) -> Result<Vec<Document>, PipelineError> {
        let sql = format!("SELECT * FROM {} ORDER BY created_at LIMIT $1", self.core("documents"));
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(document_from_row).collect()
    }

    async fn create_manufacturer(&self, manufacturer: &Manufacturer) -> Result<Uuid, PipelineError> {
        if let Some(existing) = self.get_manufacturer_by_name(&manufacturer.name).await? {
            return Ok(existing.id);
        }
        let sql = format!(
            "INSERT INTO {} (id, name, created_at) VALUES ($1, $2, $3) RETURNING id",
            self.core("manufacturers")
        );
        let row = sqlx::query(&sql)
            .bind(manufacturer.id)
            .bind(&manufacturer.name)
            .bind(manufacturer.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn get_manufacturer_by_name(&self, name: &str) -> Result<Option<Manufacturer>, PipelineError> {
        let sql = format!(
            "SELECT id, name, created_at FROM {} WHERE LOWER(name) = LOWER($1) LIMIT 1",
            self.core("manufacturers")
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(|row| Manufacturer {
            id: row.get("id"),
            name: row.get("name"),
            created_at: row.get("created_at"),
        }))
    }

    async fn create_product_series(&self, series: &ProductSeries) -> Result<Uuid, PipelineError> {
        if let Some(existing) = self.get_series_by_name(series.manufacturer_id, &series.series_name).await? {
            return Ok(existing.id);
        }
        let sql = format!(
            "INSERT INTO {} (id, manufacturer_id, series_name, created_at) VALUES ($1, $2, $3, $4) RETURNING id",
            self.core("product_series")
        );
        let row = sqlx::query(&sql)
            .bind(series.id)
            .bind(series.manufacturer_id)
            .bind(&series.series_name)
            .bind(series.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn get_series_by_name(
        &self,
        manufacturer_id: Uuid,
        series_name: &str,
    ) -> Result<Option<ProductSeries>, PipelineError> {
        let sql = format!(
            "SELECT id, manufacturer_id, series_name, created_at FROM {} \
             WHERE manufacturer_id = $1 AND LOWER(series_name) = LOWER($2) LIMIT 1",
            self.core("product_series")
        );
        let row = sqlx::query(&sql)
            .bind(manufacturer_id)
            .bind(series_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(|row| ProductSeries {
            id: row.get("id"),
            manufacturer_id: row.get("manufacturer_id"),
            series_name: row.get("series_name"),
            created_at: row.get("created_at"),
        }))
    }

    async fn create_product(&self, product: &Product) -> Result<Uuid, PipelineError> {
        if let Some(existing) = self
            .get_product_by_model(product.manufacturer_id, &product.model_number)
            .await?
        {
            return Ok(existing.id);
        }
        let sql = format!(
            "INSERT INTO {} (id, manufacturer_id, series_id, model_number, created_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
            self.core("products")
        );
        let row = sqlx::query(&sql)
            .bind(product.id)
            .bind(product.manufacturer_id)
            .bind(product.series_id)
            .bind(&product.model_number)
            .bind(product.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn get_product_by_model(
        &self,
        manufacturer_id: Uuid,
        model_number: &str,
    ) -> Result<Option<Product>, PipelineError> {
        let sql = format!(
            "SELECT id, manufacturer_id, series_id, model_number, created_at FROM {} \
             WHERE manufacturer_id = $1 AND LOWER(model_number) = LOWER($2) LIMIT 1",
            self.core("products")
        );
        let row = sqlx::query(&sql)
            .bind(manufacturer_id)
            .bind(model_number)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(|row| Product {
            id: row.get("id"),
            manufacturer_id: row.get("manufacturer_id"),
            series_id: row.get("series_id"),
            model_number: row.get("model_number"),
            created_at: row.get("created_at"),
        }))
    }

    async fn create_error_code(&self, error_code: &ErrorCodeRecord) -> Result<Uuid, PipelineError> {
        let sql = format!(
            "INSERT INTO {} (id, manufacturer_id, code, description, solution, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
            self.content("error_codes")
        );
        let row = sqlx::query(&sql)
            .bind(error_code.id)
            .bind(error_code.manufacturer_id)
            .bind(&error_code.code)
            .bind(&error_code.description)
            .bind(&error_code.solution)
            .bind(&error_code.metadata)
            .bind(error_code.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn get_error_code(&self, code: &str) -> Result<Option<ErrorCodeRecord>, PipelineError> {
        let sql = format!("SELECT * FROM {} WHERE code = $1 LIMIT 1", self.content("error_codes"));
        let row = sqlx::query(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(|row| ErrorCodeRecord {
            id: row.get("id"),
            manufacturer_id: row.get("manufacturer_id"),
            code: row.get("code"),
            description: row.get("description"),
            solution: row.get("solution"),
            metadata: row
                .try_get::<serde_json::Value, _>("metadata")
                .unwrap_or(serde_json::Value::Null),
            created_at: row.get("created_at"),
        }))
    }

    async fn create_chunk(&self, chunk: &Chunk) -> Result<Uuid, PipelineError> {
        let sql = format!(
            "INSERT INTO {} (id, document_id, chunk_index, content, page_start, page_end, chunk_type, \
             section_path, metadata, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
            self.intelligence("chunks")
        );
        let row = sqlx::query(&sql)
            .bind(chunk.id)
            .bind(chunk.document_id.as_uuid())
            .bind(chunk.chunk_index as i32)
            .bind(&chunk.content)
            .bind(chunk.page_start as i32)
            .bind(chunk.page_end as i32)
            .bind(&chunk.chunk_type)
            .bind(serde_json::to_value(&chunk.section_path)?)
            .bind(&chunk.metadata)
            .bind(chunk.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn get_chunk_by_document_and_index(
        &self,
        document_id: DocumentId,
        chunk_index: u32,
    ) -> Result<Option<Chunk>, PipelineError> {
        let sql = format!(
            "SELECT * FROM {} WHERE document_id = $1 AND chunk_index = $2 LIMIT 1",
            self.intelligence("chunks")
        );
        let row = sqlx::query(&sql)
            .bind(document_id.as_uuid())
            .bind(chunk_index as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(|row| Chunk {
            id: row.get("id"),
            document_id: DocumentId::from_uuid(row.get("document_id")),
            chunk_index: row.get::<i32, _>("chunk_index") as u32,
            content: row.get("content"),
            page_start: row.get::<i32, _>("page_start") as u32,
            page_end: row.get::<i32, _>("page_end") as u32,
            chunk_type: row.get("chunk_type"),
            section_path: row
                .try_get::<serde_json::Value, _>("section_path")
                .ok()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            metadata: row
                .try_get::<serde_json::Value, _>("metadata")
                .unwrap_or(serde_json::Value::Null),
            created_at: row.get("created_at"),
        }))
    }

    async fn create_image(&self, image: &ImageRecord) -> Result<Uuid, PipelineError> {
        if let Some(hash) = &image.content_hash {
            if let Some(existing) = self.get_image_by_hash(hash).await? {
                return Ok(existing.id);
            }
        }
        let sql = format!(
            "INSERT INTO {} (id, document_id, page_number, file_hash, storage_ref, caption, description, \
             metadata, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
            self.content("images")
        );
        let row = sqlx::query(&sql)
            .bind(image.id)
            .bind(image.document_id.as_uuid())
            .bind(image.page_number as i32)
            .bind(image.content_hash.as_ref().map(ContentHash::as_str))
            .bind(&image.storage_ref)
            .bind(&image.caption)
            .bind(&image.description)
            .bind(&image.metadata)
            .bind(image.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn get_image_by_hash(&self, content_hash: &ContentHash) -> Result<Option<ImageRecord>, PipelineError> {
        let sql = format!("SELECT * FROM {} WHERE file_hash = $1 LIMIT 1", self.content("images"));
        let row = sqlx::query(&sql)
            .bind(content_hash.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(|row| -> Result<ImageRecord, PipelineError> {
            let hash: Option<String> = row.try_get("file_hash").map_err(map_sqlx_error)?;
            Ok(ImageRecord {
                id: row.get("id"),
                document_id: DocumentId::from_uuid(row.get("document_id")),
                page_number: row.get::<i32, _>("page_number") as u32,
                content_hash: hash.map(ContentHash::from_hex).transpose()?,
                storage_ref: row.get("storage_ref"),
                caption: row.get("caption"),
                description: row.get("description"),
                metadata: row
                    .try_get::<serde_json::Value, _>("metadata")
                    .unwrap_or(serde_json::Value::Null),
                created_at: row.get("created_at"),
            })
        })
        .transpose()
    }

    async fn create_link(&self, link: &LinkRecord) -> Result<Uuid, PipelineError> {
        let sql = format!(
            "INSERT INTO {} (id, document_id, page_number, url, link_type, description, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
            self.content("links")
        );
        let row = sqlx::query(&sql)
            .bind(link.id)
            .bind(link.document_id.as_uuid())
            .bind(link.page_number as i32)
            .bind(&link.url)
            .bind(&link.link_type)
            .bind(&link.description)
            .bind(&link.metadata)
            .bind(link.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn create_video(&self, video: &VideoRecord) -> Result<Uuid, PipelineError> {
        let sql = format!(
            "INSERT INTO {} (id, document_id, link_id, page_number, title, url, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (link_id) DO UPDATE SET title = EXCLUDED.title, url = EXCLUDED.url, \
             metadata = EXCLUDED.metadata RETURNING id",
            self.content("videos")
        );
        let row = sqlx::query(&sql)
            .bind(video.id)
            .bind(video.document_id.as_uuid())
            .bind(video.link_id)
            .bind(video.page_number as i32)
            .bind(&video.title)
            .bind(&video.url)
            .bind(&video.metadata)
            .bind(video.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn create_table(&self, table: &TableRecord) -> Result<Uuid, PipelineError> {
        let sql = format!(
            "INSERT INTO {} (id, document_id, page_number, table_index, headers, rows, context, metadata, \
             created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
            self.intelligence("structured_tables")
        );
        let row = sqlx::query(&sql)
            .bind(table.id)
            .bind(table.document_id.as_uuid())
            .bind(table.page_number as i32)
            .bind(table.table_index as i32)
            .bind(serde_json::to_value(&table.headers)?)
            .bind(&table.rows)
            .bind(&table.context)
            .bind(&table.metadata)
            .bind(table.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn count_chunks_by_document(&self, document_id: DocumentId) -> Result<u64, PipelineError> {
        self.count_by_document(&self.intelligence("chunks"), document_id).await
    }

    async fn count_images_by_document(&self, document_id: DocumentId) -> Result<u64, PipelineError> {
        self.count_by_document(&self.content("images"), document_id).await
    }

    async fn count_links_by_document(&self, document_id: DocumentId) -> Result<u64, PipelineError> {
        self.count_by_document(&self.content("links"), document_id).await
    }

    async fn create_embedding(&self, embedding: &EmbeddingRecord) -> Result<Uuid, PipelineError> {
        let sql = format!(
            "INSERT INTO {} (id, source_id, source_type, embedding, model_name, embedding_context, metadata, \
             created_at) VALUES ($1, $2, $3, $4::vector, $5, $6, $7, $8) \
             ON CONFLICT (source_id, source_type, model_name) DO UPDATE SET \
             embedding = EXCLUDED.embedding, embedding_context = EXCLUDED.embedding_context, \
             metadata = EXCLUDED.metadata RETURNING id",
            self.intelligence("unified_embeddings")
        );
        let row = sqlx::query(&sql)
            .bind(embedding.id)
            .bind(embedding.source_id)
            .bind(embedding.source_type.as_str())
            .bind(vector_literal(&embedding.embedding))
            .bind(&embedding.model_name)
            .bind(&embedding.embedding_context)
            .bind(&embedding.metadata)
            .bind(embedding.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn create_embeddings_batch(&self, embeddings: &[EmbeddingRecord]) -> Vec<BatchItemOutcome> {
        let mut outcomes = Vec::with_capacity(embeddings.len());
        for embedding in embeddings {
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
        let sql = format!(
            "SELECT id, source_id, source_type, embedding::text AS embedding_text, model_name, \
             embedding_context, metadata, created_at FROM {} \
             WHERE source_id = $1 AND source_type = $2 AND model_name = $3 LIMIT 1",
            self.intelligence("unified_embeddings")
        );
        let row = sqlx::query(&sql)
            .bind(source_id)
            .bind(source_type.as_str())
            .bind(model_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(|row| embedding_from_row(&row)).transpose()
    }

    async fn embedding_exists(&self, source_id: Uuid, source_type: SourceType) -> Result<bool, PipelineError> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE source_id = $1 AND source_type = $2) AS present",
            self.intelligence("unified_embeddings")
        );
        let row = sqlx::query(&sql)
            .bind(source_id)
            .bind(source_type.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("present").map_err(map_sqlx_error)
    }

    async fn search_embeddings(
        &self,
        query: &[f32],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<SimilarityMatch>, PipelineError> {
        let sql = format!(
            "SELECT id, source_id, source_type, embedding::text AS embedding_text, model_name, \
             embedding_context, metadata, created_at, \
             (1 - (embedding <=> $1::vector)) AS similarity FROM {} \
             WHERE (1 - (embedding <=> $1::vector)) >= $2 \
             ORDER BY similarity DESC LIMIT $3",
            self.intelligence("unified_embeddings")
        );
        let rows = sqlx::query(&sql)
            .bind(vector_literal(query))
            .bind(threshold)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| {
                Ok(SimilarityMatch {
                    similarity: row.try_get("similarity").map_err(map_sqlx_error)?,
                    embedding: embedding_from_row(row)?,
                })
            })
            .collect()
    }

    async fn get_completion_marker(
        &self,
        document_id: DocumentId,
        stage: Stage,
    ) -> Result<Option<CompletionMarker>, PipelineError> {
        let sql = format!(
            "SELECT document_id, stage_name, completed_at, data_hash, metadata FROM {} \
             WHERE document_id = $1 AND stage_name = $2",
            self.system("stage_completion_markers")
        );
        let row = sqlx::query(&sql)
            .bind(document_id.as_uuid())
            .bind(stage.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(|row| -> Result<CompletionMarker, PipelineError> {
            let stage_name: String = row.try_get("stage_name").map_err(map_sqlx_error)?;
            Ok(CompletionMarker {
                document_id: DocumentId::from_uuid(row.get("document_id")),
                stage: stage_name.parse()?,
                data_hash: row.get("data_hash"),
                completed_at: row.get("completed_at"),
                metadata: row
                    .try_get::<serde_json::Value, _>("metadata")
                    .unwrap_or(serde_json::Value::Null),
            })
        })
        .transpose()
    }

    async fn upsert_completion_marker(&self, marker: &CompletionMarker) -> Result<(), PipelineError> {
        let sql = format!(
            "INSERT INTO {} (document_id, stage_name, data_hash, metadata, completed_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (document_id, stage_name) DO UPDATE SET \
             data_hash = EXCLUDED.data_hash, metadata = EXCLUDED.metadata, completed_at = EXCLUDED.completed_at",
            self.system("stage_completion_markers")
        );
        sqlx::query(&sql)
            .bind(marker.document_id.as_uuid())
            .bind(marker.stage.as_str())
            .bind(&marker.data_hash)
            .bind(&marker.metadata)
            .bind(marker.completed_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn delete_completion_marker(&self, document_id: DocumentId, stage: Stage) -> Result<(), PipelineError> {
        let sql = format!(
            "DELETE FROM {} WHERE document_id = $1 AND stage_name = $2",
            self.system("stage_completion_markers")
        );
        sqlx::query(&sql)
            .bind(document_id.as_uuid())
            .bind(stage.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    fn supports_procedures(&self) -> bool {
        true
    }

    async fn execute_rpc(
        &self,
        function_name: &str,
        params: serde_json::Value,
    ) -> Result<Vec<serde_json::Value>, PipelineError> {
        let empty = serde_json::Map::new();
        let params = params.as_object().unwrap_or(&empty);

        let mut call_args = Vec::with_capacity(params.len());
        for (index, name) in params.keys().enumerate() {
            call_args.push(format!("{} := ${}::{}", name, index + 1, cast_for_param(name)));
        }
        let sql = format!("SELECT to_jsonb(t) AS row FROM {}({}) t", function_name, call_args.join(", "));

        let mut query = sqlx::query(&sql);
        for value in params.values() {
            // Objects and arrays ride as jsonb; scalars bind as text and
            // rely on the declared cast
            query = match value {
                serde_json::Value::Object(_) | serde_json::Value::Array(_) => query.bind(value),
                serde_json::Value::Null => query.bind(Option::<String>::None),
                serde_json::Value::String(s) => query.bind(s.as_str()),
                other => query.bind(other.to_string()),
            };
        }

        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| row.try_get::<serde_json::Value, _>("row").map_err(map_sqlx_error))
            .collect()
    }

    async fn execute_raw(
        &self,
        query: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>, PipelineError> {
        let (normalized, order) = normalize_placeholders(query);

        // Named placeholders reorder params by first use; positional
        // queries keep the given order
        let reordered: Vec<&serde_json::Value> = if order.is_empty() {
            params.iter().collect()
        } else {
            // Named params arrive as one object
            let object = params
                .first()
                .and_then(serde_json::Value::as_object)
                .ok_or_else(|| PipelineError::validation_error("named placeholders need an object parameter"))?;
            order
                .iter()
                .map(|name| {
                    object
                        .get(name)
                        .ok_or_else(|| PipelineError::validation_error(format!("parameter '{}' not provided", name)))
                })
                .collect::<Result<_, _>>()?
        };

        let head = normalized.trim_start().to_lowercase();
        if head.starts_with("select") || head.starts_with("with") {
            let wrapped = format!("SELECT to_jsonb(t) AS row FROM ({}) t", normalized);
            let mut query = sqlx::query(&wrapped);
            for value in reordered {
                query = bind_json(query, value);
            }
            let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
            rows.iter()
                .map(|row| row.try_get::<serde_json::Value, _>("row").map_err(map_sqlx_error))
                .collect()
        } else {
            let mut query = sqlx::query(&normalized);
            for value in reordered {
                query = bind_json(query, value);
            }
            let result = query.execute(&self.pool).await.map_err(map_sqlx_error)?;
            Ok(vec![serde_json::json!({"rowcount": result.rows_affected()})])
        }
    }

    async fn try_advisory_lock(&self, key: i64) -> Result<bool, PipelineError> {
        let mut held = self.held_locks.lock().await;
        if held.contains_key(&key) {
            // This process already holds the lock
            return Ok(false);
        }

        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS acquired")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
        let acquired: bool = row.try_get("acquired").map_err(map_sqlx_error)?;

        if acquired {
            // Pin the session for the lifetime of the lock
            held.insert(key, conn);
        }
        Ok(acquired)
    }

    async fn advisory_unlock(&self, key: i64) -> Result<bool, PipelineError> {
        let mut held = self.held_locks.lock().await;
        let Some(mut conn) = held.remove(&key) else {
            return Ok(false);
        };
        let row = sqlx::query("SELECT pg_advisory_unlock($1) AS released")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("released").map_err(map_sqlx_error)
    }

    async fn pipeline_metrics_view(&self) -> Result<PipelineMetricsView, PipelineError> {
        let row = sqlx::query("SELECT * FROM public.vw_pipeline_metrics_aggregated LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let Some(row) = row else {
            return Ok(PipelineMetricsView::default());
        };
        let get = |name: &str| row.try_get::<i64, _>(name).unwrap_or(0) as u64;
        Ok(PipelineMetricsView {
            total_documents: get("total_documents"),
            documents_pending: get("documents_pending"),
            documents_processing: get("documents_processing"),
            documents_completed: get("documents_completed"),
            documents_failed: get("documents_failed"),
            success_rate: row.try_get("success_rate").unwrap_or(0.0),
            avg_processing_time_seconds: row.try_get("avg_processing_time_seconds").unwrap_or(0.0),
            recent_24h_count: get("recent_24h_count"),
        })
    }

    async fn queue_metrics_view(&self) -> Result<QueueMetricsView, PipelineError> {
        let row = sqlx::query("SELECT * FROM public.vw_queue_metrics_aggregated LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let mut view = match row {
            Some(row) => {
                let get = |name: &str| row.try_get::<i64, _>(name).unwrap_or(0) as u64;
                QueueMetricsView {
                    total_items: get("total_items"),
                    pending_count: get("pending_count"),
                    processing_count: get("processing_count"),
                    completed_count: get("completed_count"),
                    failed_count: get("failed_count"),
                    avg_wait_time_seconds: row.try_get("avg_wait_time_seconds").unwrap_or(0.0),
                    by_task_type: BTreeMap::new(),
                }
            }
            None => QueueMetricsView::default(),
        };

        let sql = format!(
            "SELECT task_type, COUNT(*) AS cnt FROM {} GROUP BY task_type",
            self.system("processing_queue")
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        for row in rows {
            let task_type: String = row.try_get("task_type").map_err(map_sqlx_error)?;
            let count: i64 = row.try_get("cnt").map_err(map_sqlx_error)?;
            view.by_task_type.insert(task_type, count as u64);
        }
        Ok(view)
    }

    async fn stage_statistics(&self) -> Result<Vec<StageStatistics>, PipelineError> {
        let rows = sqlx::query("SELECT * FROM public.vw_stage_metrics_aggregated")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let mut statistics = Vec::with_capacity(rows.len());
        for row in rows {
            let stage_name: String = row.try_get("stage_name").map_err(map_sqlx_error)?;
            let Ok(stage) = stage_name.parse::<Stage>() else {
                warn!(stage = %stage_name, "unknown stage in statistics view; ignoring");
                continue;
            };
            let get = |name: &str| row.try_get::<i64, _>(name).unwrap_or(0) as u64;
            let completed = get("completed_count");
            let failed = get("failed_count");
            let finished = completed + failed;
            statistics.push(StageStatistics {
                stage,
                pending_count: get("pending_count"),
                processing_count: get("processing_count"),
                completed_count: completed,
                failed_count: failed,
                skipped_count: get("skipped_count"),
                avg_duration_seconds: row.try_get("avg_duration_seconds").unwrap_or(0.0),
                success_rate: if finished > 0 {
                    completed as f64 / finished as f64 * 100.0
                } else {
                    0.0
                },
            });
        }
        Ok(statistics)
    }

    async fn duplicate_hash_groups(&self) -> Result<Vec<DuplicateGroup>, PipelineError> {
        let sql = format!(
            "SELECT file_hash AS key, COUNT(*) AS cnt, ARRAY_AGG(filename) AS filenames FROM {} \
             GROUP BY file_hash HAVING COUNT(*) > 1 ORDER BY cnt DESC",
            self.core("documents")
        );
        self.duplicate_groups(&sql).await
    }

    async fn duplicate_filename_groups(&self) -> Result<Vec<DuplicateGroup>, PipelineError> {
        let sql = format!(
            "SELECT filename AS key, COUNT(*) AS cnt, ARRAY_AGG(filename) AS filenames FROM {} \
             GROUP BY filename HAVING COUNT(*) > 1 ORDER BY cnt DESC",
            self.core("documents")
        );
        self.duplicate_groups(&sql).await
    }

    async fn create_queue_item(&self, item: &QueueItem) -> Result<Uuid, PipelineError> {
        let sql = format!(
            "INSERT INTO {} (id, task_type, status, priority, document_id, scheduled_at, started_at, \
             retry_count, error_message) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
            self.system("processing_queue")
        );
        let row = sqlx::query(&sql)
            .bind(item.id)
            .bind(&item.task_type)
            .bind(item.status.as_str())
            .bind(item.priority)
            .bind(item.document_id.map(|id| id.as_uuid()))
            .bind(item.scheduled_at)
            .bind(item.started_at)
            .bind(item.retry_count as i32)
            .bind(&item.error_message)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn update_queue_item(
        &self,
        item_id: Uuid,
        status: QueueItemStatus,
        error_message: Option<String>,
    ) -> Result<(), PipelineError> {
        let sql = format!(
            "UPDATE {} SET status = $2, error_message = $3, \
             started_at = CASE WHEN $2 = 'processing' AND started_at IS NULL THEN NOW() ELSE started_at END \
             WHERE id = $1",
            self.system("processing_queue")
        );
        let result = sqlx::query(&sql)
            .bind(item_id)
            .bind(status.as_str())
            .bind(error_message)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found(format!("queue item {}", item_id)));
        }
        Ok(())
    }

    async fn list_queue_items(
        &self,
        limit: usize,
        status: Option<QueueItemStatus>,
    ) -> Result<Vec<QueueItem>, PipelineError> {
        let sql = match status {
            Some(_) => format!(
                "SELECT * FROM {} WHERE status = $1 ORDER BY priority DESC, scheduled_at LIMIT $2",
                self.system("processing_queue")
            ),
            None => format!(
                "SELECT * FROM {} ORDER BY priority DESC, scheduled_at LIMIT $1",
                self.system("processing_queue")
            ),
        };

        let mut query = sqlx::query(&sql);
        if let Some(status) = status {
            query = query.bind(status.as_str().to_string());
        }
        query = query.bind(limit as i64);

        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| -> Result<QueueItem, PipelineError> {
                let status: String = row.try_get("status").map_err(map_sqlx_error)?;
                Ok(QueueItem {
                    id: row.get("id"),
                    task_type: row.get("task_type"),
                    status: status.parse()?,
                    priority: row.get("priority"),
                    document_id: row
                        .try_get::<Option<Uuid>, _>("document_id")
                        .map_err(map_sqlx_error)?
                        .map(DocumentId::from_uuid),
                    scheduled_at: row.get("scheduled_at"),
                    started_at: row.get("started_at"),
                    retry_count: row.get::<i32, _>("retry_count") as u32,
                    error_message: row.get("error_message"),
                })
            })
            .collect()
    }

    async fn record_error(&self, record: &ErrorLogRecord) -> Result<Uuid, PipelineError> {
        let sql = format!(
            "INSERT INTO {} (id, correlation_id, stage_name, document_id, classification, message, stack, \
             retry_count, first_occurrence, last_occurrence) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
            self.system("pipeline_errors")
        );
        let row = sqlx::query(&sql)
            .bind(record.id)
            .bind(&record.correlation_id)
            .bind(record.stage.as_str())
            .bind(record.document_id.map(|id| id.as_uuid()))
            .bind(record.classification.as_str())
            .bind(&record.message)
            .bind(&record.stack)
            .bind(record.retry_count as i32)
            .bind(record.first_occurrence)
            .bind(record.last_occurrence)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorLogRecord>, PipelineError> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY last_occurrence DESC LIMIT $1",
            self.system("pipeline_errors")
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| -> Result<ErrorLogRecord, PipelineError> {
                let stage: String = row.try_get("stage_name").map_err(map_sqlx_error)?;
                let classification: String = row.try_get("classification").map_err(map_sqlx_error)?;
                Ok(ErrorLogRecord {
                    id: row.get("id"),
                    correlation_id: row.get("correlation_id"),
                    stage: stage.parse()?,
                    document_id: row
                        .try_get::<Option<Uuid>, _>("document_id")
                        .map_err(map_sqlx_error)?
                        .map(DocumentId::from_uuid),
                    classification: serde_json::from_value(serde_json::Value::String(classification))
                        .unwrap_or(krai_pipeline_domain::ErrorClassification::Unknown),
                    message: row.get("message"),
                    stack: row.get("stack"),
                    retry_count: row.get::<i32, _>("retry_count") as u32,
                    first_occurrence: row.get("first_occurrence"),
                    last_occurrence: row.get("last_occurrence"),
                })
            })
            .collect()
    }

    async fn load_alert_rules(&self) -> Result<Vec<AlertRule>, PipelineError> {
        let sql = format!("SELECT * FROM {} WHERE enabled = TRUE", self.system("alert_rules"));
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| -> Result<AlertRule, PipelineError> {
                let severity: String = row.try_get("severity").map_err(map_sqlx_error)?;
                let operator: String = row.try_get("threshold_operator").map_err(map_sqlx_error)?;
                let severity_threshold: Option<String> = row.try_get("severity_threshold").map_err(map_sqlx_error)?;
                let stages: Vec<String> = row
                    .try_get::<serde_json::Value, _>("stages")
                    .ok()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                Ok(AlertRule {
                    id: row.get("id"),
                    rule_name: row.get("rule_name"),
                    description: row.get("description"),
                    enabled: row.get("enabled"),
                    severity: severity.parse()?,
                    error_types: row
                        .try_get::<serde_json::Value, _>("error_types")
                        .ok()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default(),
                    stages: stages.iter().filter_map(|s| s.parse().ok()).collect(),
                    severity_threshold: severity_threshold.map(|s| s.parse()).transpose()?,
                    metric_key: row.get("metric_key"),
                    threshold_value: row.try_get("threshold_value").unwrap_or(0.0),
                    threshold_operator: operator.parse()?,
                    error_count_threshold: row.try_get::<i32, _>("error_count_threshold").unwrap_or(5) as u32,
                    time_window_minutes: row.try_get::<i32, _>("time_window_minutes").unwrap_or(15) as u32,
                    aggregation_window_minutes: row.try_get::<i32, _>("aggregation_window_minutes").unwrap_or(5)
                        as u32,
                    email_recipients: row
                        .try_get::<serde_json::Value, _>("email_recipients")
                        .ok()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default(),
                    slack_webhooks: row
                        .try_get::<serde_json::Value, _>("slack_webhooks")
                        .ok()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn insert_alert_rule(&self, rule: &AlertRule) -> Result<Uuid, PipelineError> {
        let sql = format!(
            "INSERT INTO {} (id, rule_name, description, enabled, severity, error_types, stages, \
             severity_threshold, metric_key, threshold_value, threshold_operator, error_count_threshold, \
             time_window_minutes, aggregation_window_minutes, email_recipients, slack_webhooks) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) RETURNING id",
            self.system("alert_rules")
        );
        let stages: Vec<&str> = rule.stages.iter().map(Stage::as_str).collect();
        let row = sqlx::query(&sql)
            .bind(rule.id)
            .bind(&rule.rule_name)
            .bind(&rule.description)
            .bind(rule.enabled)
            .bind(rule.severity.as_str())
            .bind(serde_json::to_value(&rule.error_types)?)
            .bind(serde_json::to_value(&stages)?)
            .bind(rule.severity_threshold.map(|s| s.as_str()))
            .bind(&rule.metric_key)
            .bind(rule.threshold_value)
            .bind(rule.threshold_operator.as_str())
            .bind(rule.error_count_threshold as i32)
            .bind(rule.time_window_minutes as i32)
            .bind(rule.aggregation_window_minutes as i32)
            .bind(serde_json::to_value(&rule.email_recipients)?)
            .bind(serde_json::to_value(&rule.slack_webhooks)?)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn update_alert_rule(&self, rule: &AlertRule) -> Result<bool, PipelineError> {
        let sql = format!(
            "UPDATE {} SET rule_name = $2, description = $3, enabled = $4, severity = $5, \
             metric_key = $6, threshold_value = $7, threshold_operator = $8 WHERE id = $1",
            self.system("alert_rules")
        );
        let result = sqlx::query(&sql)
            .bind(rule.id)
            .bind(&rule.rule_name)
            .bind(&rule.description)
            .bind(rule.enabled)
            .bind(rule.severity.as_str())
            .bind(&rule.metric_key)
            .bind(rule.threshold_value)
            .bind(rule.threshold_operator.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_alert_rule(&self, rule_id: Uuid) -> Result<bool, PipelineError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.system("alert_rules"));
        let result = sqlx::query(&sql)
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_active_alert(
        &self,
        aggregation_key: &str,
        window_minutes: u32,
    ) -> Result<Option<Alert>, PipelineError> {
        let sql = format!(
            "SELECT * FROM {} WHERE aggregation_key = $1 AND acknowledged = FALSE \
             AND last_occurrence > NOW() - ($2 || ' minutes')::interval \
             ORDER BY last_occurrence DESC LIMIT 1",
            self.system("alert_queue")
        );
        let row = sqlx::query(&sql)
            .bind(aggregation_key)
            .bind(window_minutes.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(alert_from_row).transpose()
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<Uuid, PipelineError> {
        let sql = format!(
            "INSERT INTO {} (id, alert_type, severity, title, message, metadata, aggregation_key, \
             aggregation_count, first_occurrence, last_occurrence, triggered_at, status, acknowledged) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) RETURNING id",
            self.system("alert_queue")
        );
        let row = sqlx::query(&sql)
            .bind(alert.id)
            .bind(&alert.alert_type)
            .bind(alert.severity.as_str())
            .bind(&alert.title)
            .bind(&alert.message)
            .bind(&alert.metadata)
            .bind(&alert.aggregation_key)
            .bind(alert.aggregation_count as i32)
            .bind(alert.first_occurrence)
            .bind(alert.last_occurrence)
            .bind(alert.triggered_at)
            .bind(alert.status.as_str())
            .bind(alert.acknowledged)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn increment_alert_aggregation(&self, alert_id: Uuid) -> Result<(), PipelineError> {
        let sql = format!(
            "UPDATE {} SET aggregation_count = aggregation_count + 1, last_occurrence = NOW() WHERE id = $1",
            self.system("alert_queue")
        );
        let result = sqlx::query(&sql)
            .bind(alert_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found(format!("alert {}", alert_id)));
        }
        Ok(())
    }

    async fn list_alerts(
        &self,
        limit: usize,
        severity: Option<AlertSeverity>,
        status: Option<AlertStatus>,
    ) -> Result<Vec<Alert>, PipelineError> {
        let mut conditions = Vec::new();
        if severity.is_some() {
            conditions.push(format!("severity = ${}", conditions.len() + 1));
        }
        if status.is_some() {
            conditions.push(format!("status = ${}", conditions.len() + 1));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT * FROM {} {} ORDER BY triggered_at DESC LIMIT ${}",
            self.system("alert_queue"),
            where_clause,
            conditions.len() + 1
        );

        let mut query = sqlx::query(&sql);
        if let Some(severity) = severity {
            query = query.bind(severity.as_str().to_string());
        }
        if let Some(status) = status {
            query = query.bind(status.as_str().to_string());
        }
        query = query.bind(limit as i64);

        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn count_unacknowledged_alerts(&self) -> Result<u64, PipelineError> {
        let sql = format!(
            "SELECT COUNT(*) AS cnt FROM {} WHERE acknowledged = FALSE",
            self.system("alert_queue")
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await.map_err(map_sqlx_error)?;
        Ok(row.try_get::<i64, _>("cnt").map_err(map_sqlx_error)? as u64)
    }

    async fn acknowledge_alert(&self, alert_id: Uuid, user_id: &str) -> Result<bool, PipelineError> {
        let sql = format!(
            "UPDATE {} SET acknowledged = TRUE, acknowledged_by = $2, acknowledged_at = NOW() WHERE id = $1",
            self.system("alert_queue")
        );
        let result = sqlx::query(&sql)
            .bind(alert_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_alert(&self, alert_id: Uuid) -> Result<bool, PipelineError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.system("alert_queue"));
        let result = sqlx::query(&sql)
            .bind(alert_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_baseline(
        &self,
        stage_name: &str,
        aggregates: StageAggregates,
        test_document_ids: &[DocumentId],
        notes: Option<&str>,
    ) -> Result<Uuid, PipelineError> {
        let sql = format!(
            "INSERT INTO {} (id, stage_name, measurement_date, baseline_avg_seconds, baseline_p50_seconds, \
             baseline_p95_seconds, baseline_p99_seconds, test_document_ids, notes) \
             VALUES ($1, $2, CURRENT_DATE, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (stage_name, measurement_date) DO UPDATE SET \
             baseline_avg_seconds = EXCLUDED.baseline_avg_seconds, \
             baseline_p50_seconds = EXCLUDED.baseline_p50_seconds, \
             baseline_p95_seconds = EXCLUDED.baseline_p95_seconds, \
             baseline_p99_seconds = EXCLUDED.baseline_p99_seconds, \
             test_document_ids = EXCLUDED.test_document_ids, notes = EXCLUDED.notes RETURNING id",
            self.system("performance_baselines")
        );
        let ids: Vec<String> = test_document_ids.iter().map(|id| id.to_string()).collect();
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(stage_name)
            .bind(aggregates.avg_seconds)
            .bind(aggregates.p50_seconds)
            .bind(aggregates.p95_seconds)
            .bind(aggregates.p99_seconds)
            .bind(serde_json::to_value(&ids)?)
            .bind(notes)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn update_current_metrics(
        &self,
        stage_name: &str,
        aggregates: StageAggregates,
    ) -> Result<bool, PipelineError> {
        let sql = format!(
            "UPDATE {table} SET current_avg_seconds = $2, current_p50_seconds = $3, \
             current_p95_seconds = $4, current_p99_seconds = $5, \
             improvement_percentage = (baseline_avg_seconds - $2) / NULLIF(baseline_avg_seconds, 0) * 100 \
             WHERE id = (SELECT id FROM {table} WHERE stage_name = $1 \
             ORDER BY measurement_date DESC LIMIT 1)",
            table = self.system("performance_baselines")
        );
        let result = sqlx::query(&sql)
            .bind(stage_name)
            .bind(aggregates.avg_seconds)
            .bind(aggregates.p50_seconds)
            .bind(aggregates.p95_seconds)
            .bind(aggregates.p99_seconds)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn latest_baseline(&self, stage_name: &str) -> Result<Option<PerformanceBaseline>, PipelineError> {
        let sql = format!(
            "SELECT * FROM {} WHERE stage_name = $1 ORDER BY measurement_date DESC LIMIT 1",
            self.system("performance_baselines")
        );
        let row = sqlx::query(&sql)
            .bind(stage_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.as_ref().map(baseline_from_row))
    }

    async fn all_baselines(&self) -> Result<Vec<PerformanceBaseline>, PipelineError> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY stage_name, measurement_date DESC",
            self.system("performance_baselines")
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        Ok(rows.iter().map(baseline_from_row).collect())
    }

    async fn record_search_analytics(&self, analytics: serde_json::Value) -> Result<Uuid, PipelineError> {
        let sql = format!(
            "INSERT INTO {} (id, payload, created_at) VALUES ($1, $2, NOW()) RETURNING id",
            self.system("search_analytics")
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&analytics)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }
}

impl PostgresDatabasePort {
    async fn count_by_document(&self, table: &str, document_id: DocumentId) -> Result<u64, PipelineError> {
        let sql = format!("SELECT COUNT(*) AS cnt FROM {} WHERE document_id = $1", table);
        let row = sqlx::query(&sql)
            .bind(document_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.try_get::<i64, _>("cnt").map_err(map_sqlx_error)? as u64)
    }

    async fn duplicate_groups(&self, sql: &str) -> Result<Vec<DuplicateGroup>, PipelineError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| -> Result<DuplicateGroup, PipelineError> {
                Ok(DuplicateGroup {
                    key: row.try_get("key").map_err(map_sqlx_error)?,
                    count: row.try_get::<i64, _>("cnt").map_err(map_sqlx_error)? as u64,
                    filenames: row.try_get::<Vec<String>, _>("filenames").unwrap_or_default(),
                })
            })
            .collect()
    }
}

fn embedding_from_row(row: &PgRow) -> Result<EmbeddingRecord, PipelineError> {
    let source_type: String = row.try_get("source_type").map_err(map_sqlx_error)?;
    let vector_text: String = row.try_get("embedding_text").map_err(map_sqlx_error)?;
    Ok(EmbeddingRecord {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        source_id: row.try_get("source_id").map_err(map_sqlx_error)?,
        source_type: source_type.parse()?,
        embedding: parse_vector(&vector_text),
        model_name: row.try_get("model_name").map_err(map_sqlx_error)?,
        embedding_context: row.try_get("embedding_context").map_err(map_sqlx_error)?,
        metadata: row
            .try_get::<serde_json::Value, _>("metadata")
            .unwrap_or(serde_json::Value::Null),
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
    })
}

fn baseline_from_row(row: &PgRow) -> PerformanceBaseline {
    let ids: Vec<String> = row
        .try_get::<serde_json::Value, _>("test_document_ids")
        .ok()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    PerformanceBaseline {
        id: row.get("id"),
        stage_name: row.get("stage_name"),
        measurement_date: row.get("measurement_date"),
        baseline: aggregates_from_prefix(row, "baseline").unwrap_or_default(),
        current: row
            .try_get::<Option<f64>, _>("current_avg_seconds")
            .ok()
            .flatten()
            .and_then(|_| aggregates_from_prefix(row, "current")),
        improvement_percentage: row.try_get("improvement_percentage").ok().flatten(),
        test_document_ids: ids.iter().filter_map(|id| id.parse().ok()).collect(),
        notes: row.try_get("notes").ok().flatten(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_placeholders_rewrite_in_first_use_order() {
        let (query, order) = normalize_placeholders(
            "SELECT * FROM docs WHERE id = :id AND status = :status AND id != :id",
        );
        assert_eq!(query, "SELECT * FROM docs WHERE id = $1 AND status = $2 AND id != $1");
        assert_eq!(order, vec!["id".to_string(), "status".to_string()]);
    }

    #[test]
    fn positional_placeholders_pass_through() {
        let (query, order) = normalize_placeholders("SELECT * FROM docs WHERE id = $1");
        assert_eq!(query, "SELECT * FROM docs WHERE id = $1");
        assert!(order.is_empty());
    }

    #[test]
    fn casts_are_not_mistaken_for_placeholders() {
        let (query, order) = normalize_placeholders("SELECT created_at::date FROM docs WHERE id = :id");
        assert_eq!(query, "SELECT created_at::date FROM docs WHERE id = $1");
        assert_eq!(order, vec!["id".to_string()]);
    }

    #[test]
    fn vector_literals_round_trip() {
        let vector = vec![0.25f32, -1.5, 3.0];
        let parsed = parse_vector(&vector_literal(&vector));
        assert_eq!(parsed, vector);
    }

    #[test]
    fn rpc_casts_follow_parameter_naming() {
        assert_eq!(cast_for_param("p_document_id"), "uuid");
        assert_eq!(cast_for_param("p_progress"), "float8");
        assert_eq!(cast_for_param("p_metadata"), "jsonb");
        assert_eq!(cast_for_param("p_stage_name"), "text");
    }

    #[test]
    fn stage_status_parsing_skips_unknown_stages() {
        let value = serde_json::json!({
            "upload": {"status": "completed", "progress_percent": 100.0,
                        "started_at": null, "completed_at": null, "error": null, "metadata": null},
            "mystery_stage": {"status": "completed", "progress_percent": 100.0,
                        "started_at": null, "completed_at": null, "error": null, "metadata": null},
        });
        let parsed = parse_stage_status(value);
        assert_eq!(parsed.len(), 1);
        assert!(parsed.contains_key(&Stage::Upload));
    }
}
