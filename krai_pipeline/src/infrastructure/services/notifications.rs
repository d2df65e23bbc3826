// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Notification Sinks
//!
//! Outbound alert delivery. Two transports ship with the engine: SMTP
//! email (STARTTLS) and Slack incoming webhooks. Both sit behind the
//! `NotificationSink` trait so the alert service can fan one alert out to
//! any number of sinks and tests can record deliveries instead of sending
//! them.
//!
//! Delivery failures are the sink's caller's problem to log; they never
//! abort the alert evaluation loop. Slack delivery retries rate-limited
//! (429) responses with bounded exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use krai_pipeline_domain::{Alert, AlertRule, PipelineError};

use crate::infrastructure::config::{SlackConfig, SmtpConfig};

/// Transport that delivers one alert under one rule.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, alert: &Alert, rule: &AlertRule) -> Result<(), PipelineError>;
}

// ---------------------------------------------------------------------------
// Email
// ---------------------------------------------------------------------------

/// SMTP email sink with STARTTLS.
pub struct EmailSink {
    config: SmtpConfig,
}

impl EmailSink {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn render_body(alert: &Alert, rule: &AlertRule) -> String {
        format!(
            "Alert: {}\nRule: {}\nSeverity: {}\nOccurrences: {}\nFirst: {}\nLast: {}\n\n{}\n",
            alert.title,
            rule.rule_name,
            alert.severity,
            alert.aggregation_count,
            alert.first_occurrence.to_rfc3339(),
            alert.last_occurrence.to_rfc3339(),
            alert.message,
        )
    }
}

#[async_trait]
impl NotificationSink for EmailSink {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn deliver(&self, alert: &Alert, rule: &AlertRule) -> Result<(), PipelineError> {
        use lettre::message::Mailbox;
        use lettre::transport::smtp::authentication::Credentials;
        use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

        let Some(host) = self.config.host.as_deref() else {
            return Err(PipelineError::invalid_config("SMTP_HOST not configured"));
        };
        if rule.email_recipients.is_empty() {
            return Err(PipelineError::validation_error("no email recipients configured"));
        }

        let from: Mailbox = self
            .config
            .from_email
            .as_deref()
            .unwrap_or("alerts@localhost")
            .parse()
            .map_err(|e| PipelineError::invalid_config(format!("SMTP_FROM_EMAIL: {}", e)))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(format!("[{}] {}", alert.severity.as_str().to_uppercase(), alert.title));
        for recipient in &rule.email_recipients {
            let to: Mailbox = recipient
                .parse()
                .map_err(|e| PipelineError::validation_error(format!("recipient '{}': {}", recipient, e)))?;
            builder = builder.to(to);
        }

        let message = builder
            .body(Self::render_body(alert, rule))
            .map_err(|e| PipelineError::internal_error(format!("failed to build email: {}", e)))?;

        let mut transport = if self.config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| PipelineError::DependencyUnavailable(format!("SMTP relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        transport = transport.port(self.config.port);
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            transport = transport.credentials(Credentials::new(username.clone(), password.clone()));
        }

        transport
            .build()
            .send(message)
            .await
            .map_err(|e| PipelineError::DependencyUnavailable(format!("SMTP send failed: {}", e)))?;

        info!(alert_id = %alert.id, recipients = rule.email_recipients.len(), "alert email sent");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Slack
// ---------------------------------------------------------------------------

/// Slack incoming-webhook sink.
///
/// Only URLs under `https://hooks.slack.com/` are accepted; anything else
/// is rejected before a request is made.
pub struct SlackSink {
    client: reqwest::Client,
    config: SlackConfig,
}

const SLACK_WEBHOOK_PREFIX: &str = "https://hooks.slack.com/";

impl SlackSink {
    pub fn new(config: SlackConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    fn payload(alert: &Alert, rule: &AlertRule) -> serde_json::Value {
        serde_json::json!({
            "text": format!(
                ":rotating_light: *[{}] {}*\nRule: {}\nOccurrences: {}\n{}",
                alert.severity.as_str().to_uppercase(),
                alert.title,
                rule.rule_name,
                alert.aggregation_count,
                alert.message,
            )
        })
    }

    async fn post_with_retry(&self, url: &str, payload: &serde_json::Value) -> Result<(), PipelineError> {
        let mut attempt = 0u32;
        loop {
            let response = self
                .client
                .post(url)
                .json(payload)
                .send()
                .await
                .map_err(|e| PipelineError::DependencyUnavailable(format!("Slack webhook: {}", e)))?;

            if response.status().is_success() {
                return Ok(());
            }

            if response.status().as_u16() == 429 && attempt < self.config.max_retries {
                let delay = Duration::from_millis(500u64.saturating_mul(1 << attempt.min(8)));
                warn!(attempt, ?delay, "Slack rate limited; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return Err(PipelineError::DependencyUnavailable(format!(
                "Slack webhook returned status {}",
                response.status()
            )));
        }
    }
}

#[async_trait]
impl NotificationSink for SlackSink {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn deliver(&self, alert: &Alert, rule: &AlertRule) -> Result<(), PipelineError> {
        if rule.slack_webhooks.is_empty() {
            return Err(PipelineError::validation_error("no Slack webhooks configured"));
        }

        let payload = Self::payload(alert, rule);
        let mut delivered = 0usize;
        for url in &rule.slack_webhooks {
            if !url.starts_with(SLACK_WEBHOOK_PREFIX) {
                warn!(url, "refusing non-Slack webhook URL");
                continue;
            }
            self.post_with_retry(url, &payload).await?;
            delivered += 1;
        }

        if delivered == 0 {
            return Err(PipelineError::validation_error("no valid Slack webhook URLs"));
        }
        info!(alert_id = %alert.id, delivered, "alert posted to Slack");
        Ok(())
    }
}
