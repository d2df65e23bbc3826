// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Media Records
//!
//! Persisted fragments extracted from a document: text chunks, images,
//! links, videos, and structured tables. All media records are owned by
//! their document and destroyed with it; each carries the page number it
//! was taken from and optional context fields filled in by later stages.
//!
//! Uniqueness contracts enforced at the persistence layer:
//! - `(document_id, chunk_index)` per chunk
//! - image `content_hash` for deduplication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_objects::{ContentHash, DocumentId};

/// A persisted fragment of a document's text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: DocumentId,
    pub chunk_index: u32,
    pub content: String,
    pub page_start: u32,
    pub page_end: u32,
    pub chunk_type: String,
    /// Section hierarchy, outermost first
    pub section_path: Vec<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    pub fn new(document_id: DocumentId, chunk_index: u32, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            chunk_index,
            content: content.into(),
            page_start: 0,
            page_end: 0,
            chunk_type: "text".to_string(),
            section_path: Vec::new(),
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }
}

/// An image extracted from a document page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: Uuid,
    pub document_id: DocumentId,
    pub page_number: u32,
    /// Hash of the image bytes; equal hashes dedupe to one row
    pub content_hash: Option<ContentHash>,
    /// Key into the external object store
    pub storage_ref: Option<String>,
    pub caption: Option<String>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    pub fn new(document_id: DocumentId, page_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            page_number,
            content_hash: None,
            storage_ref: None,
            caption: None,
            description: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }
}

/// An outbound link found in a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRecord {
    pub id: Uuid,
    pub document_id: DocumentId,
    pub page_number: u32,
    pub url: String,
    pub link_type: String,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LinkRecord {
    pub fn new(document_id: DocumentId, page_number: u32, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            page_number,
            url: url.into(),
            link_type: "external".to_string(),
            description: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }
}

/// A video reference, usually resolved from a link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: Uuid,
    pub document_id: DocumentId,
    /// Link this video was resolved from; upserts conflict on it
    pub link_id: Option<Uuid>,
    pub page_number: u32,
    pub title: Option<String>,
    pub url: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A structured table extracted from a document page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRecord {
    pub id: Uuid,
    pub document_id: DocumentId,
    pub page_number: u32,
    pub table_index: u32,
    pub headers: Vec<String>,
    pub rows: serde_json::Value,
    pub context: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
