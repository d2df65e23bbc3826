// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Catalog records: manufacturers, product series, products, and error
//! codes. Deduplicated case-insensitively by name within their parent
//! (`(name)` for manufacturers, `(manufacturer, series_name)` for series,
//! `(manufacturer, model_number)` for products).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A device manufacturer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manufacturer {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Manufacturer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// A product series under a manufacturer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSeries {
    pub id: Uuid,
    pub manufacturer_id: Uuid,
    pub series_name: String,
    pub created_at: DateTime<Utc>,
}

impl ProductSeries {
    pub fn new(manufacturer_id: Uuid, series_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            manufacturer_id,
            series_name: series_name.into(),
            created_at: Utc::now(),
        }
    }
}

/// A concrete product model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub manufacturer_id: Uuid,
    pub series_id: Option<Uuid>,
    pub model_number: String,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn new(manufacturer_id: Uuid, model_number: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            manufacturer_id,
            series_id: None,
            model_number: model_number.into(),
            created_at: Utc::now(),
        }
    }
}

/// A manufacturer error code extracted from a manual.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCodeRecord {
    pub id: Uuid,
    pub manufacturer_id: Option<Uuid>,
    pub code: String,
    pub description: Option<String>,
    pub solution: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ErrorCodeRecord {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            manufacturer_id: None,
            code: code.into(),
            description: None,
            solution: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }
}
