// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Configuration
//!
//! Typed configuration for the whole engine, resolved from the process
//! environment with serde-deserializable defaults. Every knob that the
//! original deployment exposed as an environment variable keeps its name:
//! `DATABASE_TYPE`, `POSTGRES_URL`, `KRAI_SCHEMA_PREFIX`, the `SMTP_*`
//! family, and the `SLACK_*` retry settings.
//!
//! The per-stage criticality table lives here as an explicit map. A
//! critical stage failure fails the whole document; non-critical failures
//! are recorded and the run continues.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use krai_pipeline_domain::{PipelineError, Stage};

/// Database connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Backend selector; only `postgresql` is currently implemented
    pub database_type: String,
    pub url: String,
    /// Schema prefix; tables live in `<prefix>_core`, `<prefix>_content`,
    /// `<prefix>_intelligence`, `<prefix>_system`, `<prefix>_parts`
    pub schema_prefix: String,
    pub max_connections: u32,
    pub statement_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_type: "postgresql".to_string(),
            url: String::new(),
            schema_prefix: "krai".to_string(),
            max_connections: 10,
            statement_timeout_secs: 60,
        }
    }
}

/// Security limits enforced by the request validation front door.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub request_validation_enabled: bool,
    pub max_request_size_mb: u64,
    pub max_file_size_mb: u64,
    /// Allowed upload extensions including the leading dot
    pub allowed_file_types: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            request_validation_enabled: true,
            max_request_size_mb: 50,
            max_file_size_mb: 500,
            allowed_file_types: vec![".pdf".to_string(), ".docx".to_string(), ".png".to_string(), ".jpg".to_string()],
        }
    }
}

/// One named retry policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl RetryPolicyConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

/// Named retry policies plus per-stage overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub default_policy: RetryPolicyConfig,
    /// Additional named policies referenced by processors
    pub policies: BTreeMap<String, RetryPolicyConfig>,
    /// Per-stage policy assignment; falls back to the processor's declared
    /// policy id, then to the default
    pub stage_policies: BTreeMap<Stage, String>,
}

impl RetryConfig {
    /// Resolves the policy for a stage and declared policy id
    pub fn resolve(&self, stage: Stage, declared_policy_id: &str) -> RetryPolicyConfig {
        if let Some(name) = self.stage_policies.get(&stage) {
            if let Some(policy) = self.policies.get(name) {
                return *policy;
            }
        }
        if let Some(policy) = self.policies.get(declared_policy_id) {
            return *policy;
        }
        self.default_policy
    }
}

/// SMTP settings for the email notification sink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_email: Option<String>,
    pub use_tls: bool,
}

impl SmtpConfig {
    /// Email dispatch is only attempted when a host is configured
    pub fn is_configured(&self) -> bool {
        self.host.is_some()
    }
}

/// Slack webhook dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_secs: 10,
        }
    }
}

/// Broadcast hub settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Periodic metrics push interval
    pub interval_secs: u64,
    /// Heartbeat after this much subscriber idle time
    pub heartbeat_secs: u64,
    /// Per-subscriber outbound buffer; a full buffer drops the subscriber
    pub subscriber_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1,
            heartbeat_secs: 30,
            subscriber_buffer: 64,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    pub retry: RetryConfig,
    pub smtp: SmtpConfig,
    pub slack: SlackConfig,
    pub broadcast: BroadcastConfig,
    /// The authoritative per-stage criticality table
    pub critical_stages: BTreeMap<Stage, bool>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            security: SecurityConfig::default(),
            retry: RetryConfig::default(),
            smtp: SmtpConfig::default(),
            slack: SlackConfig::default(),
            broadcast: BroadcastConfig::default(),
            critical_stages: Self::default_critical_stages(),
        }
    }
}

impl PipelineConfig {
    /// The published criticality table. Stages absent from the map fall
    /// back to the processor's own declaration.
    pub fn default_critical_stages() -> BTreeMap<Stage, bool> {
        let mut table = BTreeMap::new();
        for stage in Stage::ALL {
            let critical = matches!(
                stage,
                Stage::Upload | Stage::TextExtraction | Stage::ChunkPrep | Stage::Storage | Stage::Embedding
            );
            table.insert(stage, critical);
        }
        table
    }

    /// Whether a stage failure fails the document
    pub fn is_stage_critical(&self, stage: Stage, processor_default: bool) -> bool {
        self.critical_stages.get(&stage).copied().unwrap_or(processor_default)
    }

    /// Builds the configuration from the process environment.
    ///
    /// When `KRAI_CONFIG_FILE` points at a TOML file, that file supplies
    /// the base values; individual environment variables still override
    /// it. Fails only on malformed values; absent variables take defaults
    /// so a bare environment still yields a usable (if databaseless)
    /// config.
    pub fn from_env() -> Result<Self, PipelineError> {
        let mut config = match std::env::var("KRAI_CONFIG_FILE") {
            Ok(path) => Self::from_file(std::path::Path::new(&path))?,
            Err(_) => PipelineConfig::default(),
        };

        if let Ok(database_type) = std::env::var("DATABASE_TYPE") {
            config.database.database_type = database_type;
        }
        if let Ok(url) = std::env::var("POSTGRES_URL") {
            config.database.url = url;
        } else if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(prefix) = std::env::var("KRAI_SCHEMA_PREFIX") {
            config.database.schema_prefix = prefix;
        }
        if let Ok(max) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            config.database.max_connections = parse_env("DATABASE_MAX_CONNECTIONS", &max)?;
        }

        if let Ok(enabled) = std::env::var("REQUEST_VALIDATION_ENABLED") {
            config.security.request_validation_enabled = parse_env("REQUEST_VALIDATION_ENABLED", &enabled)?;
        }
        if let Ok(mb) = std::env::var("MAX_REQUEST_SIZE_MB") {
            config.security.max_request_size_mb = parse_env("MAX_REQUEST_SIZE_MB", &mb)?;
        }
        if let Ok(mb) = std::env::var("MAX_FILE_SIZE_MB") {
            config.security.max_file_size_mb = parse_env("MAX_FILE_SIZE_MB", &mb)?;
        }

        config.smtp.host = std::env::var("SMTP_HOST").ok();
        config.smtp.port = match std::env::var("SMTP_PORT") {
            Ok(port) => parse_env("SMTP_PORT", &port)?,
            Err(_) => 587,
        };
        config.smtp.username = std::env::var("SMTP_USERNAME").ok();
        config.smtp.password = std::env::var("SMTP_PASSWORD").ok();
        config.smtp.from_email = std::env::var("SMTP_FROM_EMAIL").ok();
        config.smtp.use_tls = match std::env::var("SMTP_USE_TLS") {
            Ok(flag) => parse_env("SMTP_USE_TLS", &flag)?,
            Err(_) => true,
        };

        if let Ok(retries) = std::env::var("SLACK_MAX_RETRIES") {
            config.slack.max_retries = parse_env("SLACK_MAX_RETRIES", &retries)?;
        }
        if let Ok(timeout) = std::env::var("SLACK_TIMEOUT_SECONDS") {
            config.slack.timeout_secs = parse_env("SLACK_TIMEOUT_SECONDS", &timeout)?;
        }

        Ok(config)
    }

    /// Parses a TOML configuration file
    pub fn from_file(path: &std::path::Path) -> Result<Self, PipelineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::invalid_config(format!("cannot read '{}': {}", path.display(), e)))?;
        toml::from_str(&raw)
            .map_err(|e| PipelineError::invalid_config(format!("invalid config '{}': {}", path.display(), e)))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, PipelineError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| PipelineError::invalid_config(format!("{}='{}': {}", name, value, e)))
}
