// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Infrastructure services: idempotency, stage tracking, metrics
//! aggregation, performance collection, alerting, and notification.

pub mod alert_service;
pub mod hardware;
pub mod idempotency;
pub mod metrics_service;
pub mod notifications;
pub mod performance_collector;
pub mod stage_tracker;

pub use alert_service::{AlertListResponse, AlertService};
pub use hardware::{HardwareProbe, StaticProbe, SysinfoProbe};
pub use idempotency::{compute_context_hash, IdempotencyChecker};
pub use metrics_service::MetricsService;
pub use notifications::{EmailSink, NotificationSink, SlackSink};
pub use performance_collector::{FlushedStageMetrics, ImprovementReport, PerformanceCollector};
pub use stage_tracker::{StageContext, StageTracker};
