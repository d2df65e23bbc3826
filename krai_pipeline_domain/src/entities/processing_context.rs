// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Processing Context
//!
//! The per-document, per-run value object threaded through every stage. One
//! producer (the stage sequencer) builds it; stage processors read it and
//! append their declared outputs (page texts, extracted media). The runner
//! owns the tracking fields: request id, correlation id, and retry attempt
//! are stamped onto the context before each attempt so downstream records
//! can be traced back to it.
//!
//! The context deliberately carries loosely typed intermediate results
//! (`serde_json::Value` lists for images, tables, links, videos). Their
//! concrete shapes belong to the individual processors; the core only moves
//! them between stages.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::value_objects::{CorrelationId, DocumentId, RequestId, Stage};

/// Context information for processing operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingContext {
    // Identity fields
    document_id: DocumentId,

    // Core business fields
    file_path: PathBuf,
    document_type: String,
    language: String,
    manufacturer: Option<String>,
    model: Option<String>,
    series: Option<String>,
    version: Option<String>,
    file_hash: Option<String>,
    file_size: Option<u64>,

    // Intermediate stage outputs
    page_texts: BTreeMap<u32, String>,
    images: Vec<serde_json::Value>,
    tables: Vec<serde_json::Value>,
    links: Vec<serde_json::Value>,
    videos: Vec<serde_json::Value>,
    metadata: serde_json::Map<String, serde_json::Value>,

    // Retry and error tracking fields
    request_id: Option<RequestId>,
    correlation_id: Option<CorrelationId>,
    retry_attempt: u32,
    error_id: Option<String>,
}

impl ProcessingContext {
    /// Creates a new context for one document run
    pub fn new(document_id: DocumentId, file_path: impl Into<PathBuf>, document_type: impl Into<String>) -> Self {
        Self {
            document_id,
            file_path: file_path.into(),
            document_type: document_type.into(),
            language: "en".to_string(),
            manufacturer: None,
            model: None,
            series: None,
            version: None,
            file_hash: None,
            file_size: None,
            page_texts: BTreeMap::new(),
            images: Vec::new(),
            tables: Vec::new(),
            links: Vec::new(),
            videos: Vec::new(),
            metadata: serde_json::Map::new(),
            request_id: None,
            correlation_id: None,
            retry_attempt: 0,
            error_id: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_file_hash(mut self, hash: impl Into<String>) -> Self {
        self.file_hash = Some(hash.into());
        self
    }

    pub fn with_file_size(mut self, size: u64) -> Self {
        self.file_size = Some(size);
        self
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_series(mut self, series: impl Into<String>) -> Self {
        self.series = Some(series.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn document_type(&self) -> &str {
        &self.document_type
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.manufacturer.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn series(&self) -> Option<&str> {
        self.series.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn file_hash(&self) -> Option<&str> {
        self.file_hash.as_deref()
    }

    pub fn file_size(&self) -> Option<u64> {
        self.file_size
    }

    pub fn page_texts(&self) -> &BTreeMap<u32, String> {
        &self.page_texts
    }

    /// Records extracted page text (called by the text extraction stage)
    pub fn set_page_text(&mut self, page: u32, text: impl Into<String>) {
        self.page_texts.insert(page, text.into());
    }

    pub fn images(&self) -> &[serde_json::Value] {
        &self.images
    }

    pub fn push_image(&mut self, image: serde_json::Value) {
        self.images.push(image);
    }

    pub fn tables(&self) -> &[serde_json::Value] {
        &self.tables
    }

    pub fn push_table(&mut self, table: serde_json::Value) {
        self.tables.push(table);
    }

    pub fn links(&self) -> &[serde_json::Value] {
        &self.links
    }

    pub fn push_link(&mut self, link: serde_json::Value) {
        self.links.push(link);
    }

    pub fn videos(&self) -> &[serde_json::Value] {
        &self.videos
    }

    pub fn push_video(&mut self, video: serde_json::Value) {
        self.videos.push(video);
    }

    pub fn metadata(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    /// Returns the request id, generating and storing one if absent
    pub fn ensure_request_id(&mut self) -> RequestId {
        if let Some(id) = &self.request_id {
            return id.clone();
        }
        let id = RequestId::generate();
        self.request_id = Some(id.clone());
        id
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn retry_attempt(&self) -> u32 {
        self.retry_attempt
    }

    /// Stamps the tracking fields for one attempt of one stage
    pub fn begin_attempt(&mut self, stage: Stage, retry_attempt: u32) -> CorrelationId {
        let request_id = self.ensure_request_id();
        let correlation = CorrelationId::new(&request_id, stage, retry_attempt);
        self.correlation_id = Some(correlation.clone());
        self.retry_attempt = retry_attempt;
        correlation
    }

    pub fn error_id(&self) -> Option<&str> {
        self.error_id.as_deref()
    }

    pub fn set_error_id(&mut self, error_id: impl Into<String>) {
        self.error_id = Some(error_id.into());
    }
}
