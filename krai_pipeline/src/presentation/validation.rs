// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Request Validation Layer
//!
//! Front door for every mutating external request. The checks run in a
//! fixed order and the first failure wins:
//!
//! 1. Declared size against the configured request maximum (413).
//! 2. Header values against SQL-injection patterns (400).
//! 3. Content type against the closed allow-set for POST/PUT/PATCH (415).
//! 4. JSON bodies: parse, then recursively scan string values for SQL and
//!    script patterns, collecting dotted field paths (400).
//! 5. Multipart bodies: per file part, filename presence, path traversal,
//!    sanitization to `[A-Za-z0-9._-]` capped at 255 chars, extension
//!    allow-list, upload size cap, and a 2 KiB content sniff compared
//!    against the declared type. Text parts get the same pattern scan.
//!
//! Every rejection is a canonical body `{error_code, detail, context,
//! status}` drawn from the closed [`ValidationErrorCode`] enum. The layer
//! is transport-agnostic: the HTTP surface adapts its request type into
//! [`RequestHead`] and [`MultipartPart`] values and maps failures onto
//! responses.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::infrastructure::config::SecurityConfig;

static SQL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(;\s*drop|union\s+select|--|/\*|\*/|exec\s|xp_)").expect("valid regex"));
static XSS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(<script|javascript:|onerror=|onload=|onclick=)").expect("valid regex"));
static FILENAME_SANITIZER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]").expect("valid regex"));

const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "multipart/form-data",
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

/// How many leading bytes the MIME sniffer inspects
const SNIFF_WINDOW: usize = 2048;

/// Closed set of validation rejection codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationErrorCode {
    RequestTooLarge,
    InvalidContentType,
    InvalidFileType,
    FileTooLarge,
    MismatchedFileType,
    InvalidFilename,
    InvalidJson,
    SuspiciousInput,
}

impl ValidationErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationErrorCode::RequestTooLarge => "REQUEST_TOO_LARGE",
            ValidationErrorCode::InvalidContentType => "INVALID_CONTENT_TYPE",
            ValidationErrorCode::InvalidFileType => "INVALID_FILE_TYPE",
            ValidationErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            ValidationErrorCode::MismatchedFileType => "MISMATCHED_FILE_TYPE",
            ValidationErrorCode::InvalidFilename => "INVALID_FILENAME",
            ValidationErrorCode::InvalidJson => "INVALID_JSON",
            ValidationErrorCode::SuspiciousInput => "SUSPICIOUS_INPUT",
        }
    }
}

/// A rejection with its canonical response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub error_code: ValidationErrorCode,
    pub detail: String,
    pub context: serde_json::Value,
    pub status: u16,
}

impl ValidationFailure {
    fn new(error_code: ValidationErrorCode, detail: impl Into<String>, context: serde_json::Value, status: u16) -> Self {
        Self {
            error_code,
            detail: detail.into(),
            context,
            status,
        }
    }

    /// The canonical error body
    pub fn body(&self) -> serde_json::Value {
        json!({
            "error_code": self.error_code.as_str(),
            "detail": self.detail,
            "context": self.context,
            "status": self.status,
        })
    }
}

/// Transport-agnostic view of a request's envelope.
#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    pub method: String,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub headers: Vec<(String, String)>,
}

/// One part of a multipart body.
#[derive(Debug, Clone)]
pub enum MultipartPart {
    File {
        field: String,
        filename: String,
        content_type: String,
        data: Vec<u8>,
    },
    Text {
        field: String,
        value: String,
    },
}

/// Validates inbound request size, headers, content type, and payloads.
pub struct RequestValidator {
    config: SecurityConfig,
}

impl RequestValidator {
    pub fn new(config: SecurityConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.request_validation_enabled
    }

    fn max_request_bytes(&self) -> u64 {
        self.config.max_request_size_mb * 1024 * 1024
    }

    fn max_file_bytes(&self) -> u64 {
        self.config.max_file_size_mb * 1024 * 1024
    }

    /// Envelope checks: size, header scan, content type
    pub fn validate_head(&self, head: &RequestHead) -> Result<(), ValidationFailure> {
        if !self.enabled() {
            return Ok(());
        }

        if let Some(size) = head.content_length {
            if size > self.max_request_bytes() {
                let size_mb = size as f64 / (1024.0 * 1024.0);
                warn!(size, "request too large");
                return Err(ValidationFailure::new(
                    ValidationErrorCode::RequestTooLarge,
                    format!(
                        "Request size {:.2}MB exceeds the maximum allowed size of {}MB. Please reduce the request size.",
                        size_mb, self.config.max_request_size_mb
                    ),
                    json!({
                        "max_size_mb": self.config.max_request_size_mb,
                        "received_size_mb": (size_mb * 100.0).round() / 100.0,
                    }),
                    413,
                ));
            }
        }

        let suspicious_headers: Vec<&str> = head
            .headers
            .iter()
            .filter(|(_, value)| SQL_PATTERN.is_match(value))
            .map(|(name, _)| name.as_str())
            .collect();
        if !suspicious_headers.is_empty() {
            warn!(?suspicious_headers, "suspicious header values");
            return Err(ValidationFailure::new(
                ValidationErrorCode::SuspiciousInput,
                format!(
                    "Request headers contain potentially malicious patterns. Please remove special characters \
                     or SQL/script syntax from headers: {}.",
                    suspicious_headers.join(", ")
                ),
                json!({
                    "suspicious_headers": suspicious_headers,
                    "pattern_matched": "sql_injection",
                }),
                400,
            ));
        }

        if matches!(head.method.as_str(), "POST" | "PUT" | "PATCH") {
            if let Some(content_type) = &head.content_type {
                let base = content_type.split(';').next().unwrap_or("").trim().to_lowercase();
                if !base.is_empty() && !ALLOWED_CONTENT_TYPES.contains(&base.as_str()) {
                    return Err(ValidationFailure::new(
                        ValidationErrorCode::InvalidContentType,
                        format!(
                            "Content-Type '{}' is not supported. Allowed types: {}. \
                             Please use one of the supported content types.",
                            base,
                            ALLOWED_CONTENT_TYPES.join(", ")
                        ),
                        json!({
                            "received": base,
                            "allowed": ALLOWED_CONTENT_TYPES,
                        }),
                        415,
                    ));
                }
            }
        }

        Ok(())
    }

    /// Parses and scans a JSON body
    pub fn validate_json_body(&self, body: &[u8]) -> Result<(), ValidationFailure> {
        if !self.enabled() {
            return Ok(());
        }

        if body.len() as u64 > self.max_request_bytes() {
            let size_mb = body.len() as f64 / (1024.0 * 1024.0);
            return Err(ValidationFailure::new(
                ValidationErrorCode::RequestTooLarge,
                format!(
                    "JSON payload size {:.2}MB exceeds the maximum allowed size of {}MB. Please reduce the payload size.",
                    size_mb, self.config.max_request_size_mb
                ),
                json!({
                    "max_size_mb": self.config.max_request_size_mb,
                    "received_size_mb": (size_mb * 100.0).round() / 100.0,
                }),
                413,
            ));
        }

        let data: serde_json::Value = match serde_json::from_slice(body) {
            Ok(data) => data,
            Err(e) => {
                return Err(ValidationFailure::new(
                    ValidationErrorCode::InvalidJson,
                    "Request body contains invalid JSON. Please check your JSON syntax and ensure it is \
                     properly formatted.",
                    json!({"parse_error": e.to_string()}),
                    400,
                ));
            }
        };

        let suspicious = scan_payload(&data, "");
        if !suspicious.is_empty() {
            return Err(ValidationFailure::new(
                ValidationErrorCode::SuspiciousInput,
                format!(
                    "Input in fields [{}] contains potentially malicious patterns. Please remove special \
                     characters or SQL/script syntax.",
                    suspicious.join(", ")
                ),
                json!({
                    "suspicious_fields": suspicious,
                    "pattern_matched": "sql_injection_or_xss",
                }),
                400,
            ));
        }
        Ok(())
    }

    /// Validates every part of a multipart body
    pub fn validate_multipart(&self, parts: &[MultipartPart]) -> Result<(), ValidationFailure> {
        if !self.enabled() {
            return Ok(());
        }

        for part in parts {
            match part {
                MultipartPart::File {
                    filename,
                    content_type,
                    data,
                    ..
                } => {
                    self.validate_upload(filename, content_type, data)?;
                }
                MultipartPart::Text { field, value } => {
                    if SQL_PATTERN.is_match(value) || XSS_PATTERN.is_match(value) {
                        return Err(ValidationFailure::new(
                            ValidationErrorCode::SuspiciousInput,
                            format!(
                                "Input in field '{}' contains potentially malicious patterns. Please remove \
                                 special characters or SQL/script syntax.",
                                field
                            ),
                            json!({
                                "field": field,
                                "pattern_matched": "sql_injection_or_xss",
                            }),
                            400,
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// File-part rules: filename, traversal, extension, size, content sniff
    pub fn validate_upload(&self, filename: &str, declared_type: &str, data: &[u8]) -> Result<(), ValidationFailure> {
        if !self.enabled() {
            return Ok(());
        }

        if filename.is_empty() {
            return Err(ValidationFailure::new(
                ValidationErrorCode::InvalidFilename,
                "Filename is required for file uploads. Please provide a valid filename.",
                json!({"reason": "filename_required"}),
                400,
            ));
        }

        if is_disallowed_path(filename) {
            return Err(ValidationFailure::new(
                ValidationErrorCode::InvalidFilename,
                format!(
                    "Filename '{}' contains path traversal sequences or invalid characters. Please use a \
                     simple filename without directory paths.",
                    filename
                ),
                json!({
                    "filename": filename,
                    "reason": "path_traversal_detected",
                }),
                400,
            ));
        }

        let sanitized = sanitize_filename(filename);
        let extension = sanitized
            .rsplit_once('.')
            .map(|(_, ext)| format!(".{}", ext.to_lowercase()))
            .unwrap_or_default();
        if !self.config.allowed_file_types.contains(&extension) {
            let mut allowed = self.config.allowed_file_types.clone();
            allowed.sort();
            return Err(ValidationFailure::new(
                ValidationErrorCode::InvalidFileType,
                format!(
                    "File type '{}' is not supported. Allowed types: {}. Please upload a file with one of \
                     the supported extensions.",
                    extension,
                    allowed.join(", ")
                ),
                json!({
                    "filename": filename,
                    "extension": extension,
                    "allowed_extensions": self.config.allowed_file_types,
                }),
                400,
            ));
        }

        if data.len() as u64 > self.max_file_bytes() {
            let size_mb = data.len() as f64 / (1024.0 * 1024.0);
            return Err(ValidationFailure::new(
                ValidationErrorCode::FileTooLarge,
                format!(
                    "File size {:.2}MB exceeds the maximum allowed size of {}MB. Please reduce the file size \
                     or split into smaller files.",
                    size_mb, self.config.max_file_size_mb
                ),
                json!({
                    "filename": filename,
                    "size_mb": (size_mb * 100.0).round() / 100.0,
                    "max_size_mb": self.config.max_file_size_mb,
                }),
                413,
            ));
        }

        let window = &data[..data.len().min(SNIFF_WINDOW)];
        let Some(detected) = infer::get(window) else {
            return Err(ValidationFailure::new(
                ValidationErrorCode::InvalidFileType,
                format!(
                    "Unable to detect file type for '{}'. The file may be corrupted or in an unsupported format.",
                    filename
                ),
                json!({
                    "filename": filename,
                    "reason": "mime_detection_failed",
                }),
                400,
            ));
        };

        if detected.mime_type() != declared_type {
            return Err(ValidationFailure::new(
                ValidationErrorCode::MismatchedFileType,
                format!(
                    "File '{}' has mismatched type. Declared as '{}' but detected as '{}'. Please ensure the \
                     file type matches its content.",
                    filename,
                    declared_type,
                    detected.mime_type()
                ),
                json!({
                    "filename": filename,
                    "declared_type": declared_type,
                    "detected_type": detected.mime_type(),
                }),
                400,
            ));
        }

        Ok(())
    }
}

fn sanitize_filename(name: &str) -> String {
    let sanitized = FILENAME_SANITIZER.replace_all(name, "_");
    sanitized.chars().take(255).collect()
}

fn is_disallowed_path(name: &str) -> bool {
    let lowered = name.to_lowercase();
    lowered.contains("..") || lowered.starts_with('/') || lowered.starts_with('\\')
}

/// Recursively collects dotted paths of suspicious string values
fn scan_payload(data: &serde_json::Value, path: &str) -> Vec<String> {
    let mut suspicious = Vec::new();
    match data {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                suspicious.extend(scan_payload(value, &child));
            }
        }
        serde_json::Value::Array(items) => {
            for (index, value) in items.iter().enumerate() {
                suspicious.extend(scan_payload(value, &format!("{}[{}]", path, index)));
            }
        }
        serde_json::Value::String(value) => {
            if SQL_PATTERN.is_match(value) || XSS_PATTERN.is_match(value) {
                suspicious.push(path.to_string());
            }
        }
        _ => {}
    }
    suspicious
}
