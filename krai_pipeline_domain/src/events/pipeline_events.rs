// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Events and the Broadcast Port
//!
//! Stage transitions and alert triggers are pushed to subscribed monitoring
//! clients as typed frames. The stage tracker and the alert service do not
//! know how frames reach clients; they emit through the `EventBroadcaster`
//! port, and the broadcast hub in the infrastructure layer fans frames out.
//! Tests substitute a recording implementation.
//!
//! Event delivery is best-effort by contract: emitting an event never fails
//! the state change that produced it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::Alert;
use crate::value_objects::{DocumentId, Stage};

/// The closed set of frame types pushed to monitoring clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastEventKind {
    InitialData,
    PipelineUpdate,
    QueueUpdate,
    HardwareUpdate,
    AlertTriggered,
    StageCompleted,
    StageFailed,
    ProcessorStateChange,
    Heartbeat,
}

impl BroadcastEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastEventKind::InitialData => "initial_data",
            BroadcastEventKind::PipelineUpdate => "pipeline_update",
            BroadcastEventKind::QueueUpdate => "queue_update",
            BroadcastEventKind::HardwareUpdate => "hardware_update",
            BroadcastEventKind::AlertTriggered => "alert_triggered",
            BroadcastEventKind::StageCompleted => "stage_completed",
            BroadcastEventKind::StageFailed => "stage_failed",
            BroadcastEventKind::ProcessorStateChange => "processor_state_change",
            BroadcastEventKind::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for BroadcastEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame on the wire: `{type, data, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastFrame {
    #[serde(rename = "type")]
    pub kind: BroadcastEventKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl BroadcastFrame {
    pub fn new(kind: BroadcastEventKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Port through which pipeline components publish events.
///
/// Implementations must be non-blocking: a slow or absent subscriber must
/// never stall a stage transition.
pub trait EventBroadcaster: Send + Sync {
    /// Publishes a stage transition (`stage_completed`, `stage_failed`, or
    /// `processor_state_change`)
    fn stage_event(&self, kind: BroadcastEventKind, stage: Stage, document_id: Option<DocumentId>, status: &str);

    /// Publishes a triggered alert
    fn alert_event(&self, alert: &Alert);
}

/// Broadcaster that discards every event. Used where monitoring push is not
/// wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBroadcaster;

impl EventBroadcaster for NullBroadcaster {
    fn stage_event(&self, _kind: BroadcastEventKind, _stage: Stage, _document_id: Option<DocumentId>, _status: &str) {}

    fn alert_event(&self, _alert: &Alert) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_serializes_with_type_field() {
        let frame = BroadcastFrame::new(BroadcastEventKind::StageCompleted, serde_json::json!({"stage": "upload"}));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "stage_completed");
        assert_eq!(json["data"]["stage"], "upload");
        assert!(json["timestamp"].is_string());
    }
}
