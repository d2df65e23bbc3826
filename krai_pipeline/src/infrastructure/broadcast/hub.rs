// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Real-Time Broadcast Hub
//!
//! Manages the set of monitoring subscribers and fans out pipeline, queue,
//! hardware, stage, and alert events. The hub is transport-agnostic: each
//! subscriber is a bounded channel, and the WebSocket surface drains that
//! channel into its socket. The hub is injected into the stage tracker and
//! the alert service through the `EventBroadcaster` port, so tests can
//! watch frames without a socket anywhere in sight.
//!
//! ## Admission
//!
//! A connection is admitted only after its bearer token verifies and the
//! resulting user carries the `monitoring:read` permission; otherwise the
//! caller is told to close with a policy-violation code. Admitted
//! subscribers immediately receive an `initial_data` snapshot of current
//! pipeline, queue, and hardware metrics.
//!
//! ## Backpressure
//!
//! Frames are pushed with a non-blocking send. A subscriber whose buffer
//! is full or whose receiver is gone is dropped rather than ever blocking
//! a producer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use krai_pipeline_bootstrap::CancellationToken;
use krai_pipeline_domain::{
    Alert, BroadcastEventKind, BroadcastFrame, DocumentId, EventBroadcaster, Stage, TokenVerifier,
};

use crate::infrastructure::config::BroadcastConfig;
use crate::infrastructure::metrics::exporter::PipelineMetricsExporter;
use crate::infrastructure::services::metrics_service::MetricsService;

/// Close code for authentication or permission failures
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code for internal errors
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Permission required to receive monitoring frames
pub const MONITORING_READ: &str = "monitoring:read";

/// Rejection returned by [`BroadcastHub::subscribe`], carrying the close
/// code the transport should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeError {
    pub close_code: u16,
    pub reason: String,
}

/// A subscriber's receiving end.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub user_id: String,
    pub receiver: mpsc::Receiver<BroadcastFrame>,
}

struct SubscriberHandle {
    user_id: String,
    permissions: Vec<String>,
    #[allow(dead_code)]
    connected_at: Instant,
    last_sent: Instant,
    last_received: Instant,
    sender: mpsc::Sender<BroadcastFrame>,
}

/// Subscriber registry and fan-out engine.
pub struct BroadcastHub {
    verifier: Arc<dyn TokenVerifier>,
    metrics: Arc<MetricsService>,
    config: BroadcastConfig,
    subscribers: RwLock<HashMap<u64, SubscriberHandle>>,
    next_id: AtomicU64,
    frames_sent: AtomicU64,
    exporter: Option<Arc<PipelineMetricsExporter>>,
}

impl BroadcastHub {
    pub fn new(verifier: Arc<dyn TokenVerifier>, metrics: Arc<MetricsService>, config: BroadcastConfig) -> Self {
        Self {
            verifier,
            metrics,
            config,
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            frames_sent: AtomicU64::new(0),
            exporter: None,
        }
    }

    /// Attaches the Prometheus exporter; every delivered frame increments
    /// its `broadcast_frames_total` counter
    pub fn with_exporter(mut self, exporter: Arc<PipelineMetricsExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    fn count_frame(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.record_broadcast_frame();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Admits a monitoring client.
    ///
    /// Verifies the token, requires `monitoring:read`, registers the
    /// subscriber, and queues the `initial_data` snapshot.
    pub async fn subscribe(&self, token: &str) -> Result<Subscription, SubscribeError> {
        let user = self.verifier.verify(token).map_err(|e| SubscribeError {
            close_code: CLOSE_POLICY_VIOLATION,
            reason: format!("Invalid token: {}", e),
        })?;

        if !user.has_permission(MONITORING_READ) {
            return Err(SubscribeError {
                close_code: CLOSE_POLICY_VIOLATION,
                reason: "Insufficient permissions".to_string(),
            });
        }

        let (sender, receiver) = mpsc::channel(self.config.subscriber_buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        let snapshot = BroadcastFrame::new(
            BroadcastEventKind::InitialData,
            serde_json::json!({
                "pipeline": self.metrics.get_pipeline_metrics().await,
                "queue": self.metrics.get_queue_metrics().await,
                "hardware": self.metrics.get_hardware_metrics().await,
            }),
        );
        // Buffer is empty at this point; a failed send means the receiver
        // is already gone.
        if sender.try_send(snapshot).is_ok() {
            self.count_frame();
        }

        self.subscribers.write().insert(
            id,
            SubscriberHandle {
                user_id: user.user_id.clone(),
                permissions: user.permissions,
                connected_at: now,
                last_sent: now,
                last_received: now,
                sender,
            },
        );
        info!(subscriber = id, user = %user.user_id, total = self.subscriber_count(), "subscriber connected");

        Ok(Subscription {
            id,
            user_id: user.user_id,
            receiver,
        })
    }

    /// Removes a subscriber
    pub fn disconnect(&self, subscriber_id: u64) {
        let removed = self.subscribers.write().remove(&subscriber_id);
        if let Some(handle) = removed {
            info!(
                subscriber = subscriber_id,
                user = %handle.user_id,
                remaining = self.subscriber_count(),
                "subscriber disconnected"
            );
        }
    }

    /// Handles one inbound client frame; `ping` earns a `pong`
    pub fn handle_client_frame(&self, subscriber_id: u64, frame: &str) -> Option<&'static str> {
        if let Some(handle) = self.subscribers.write().get_mut(&subscriber_id) {
            handle.last_received = Instant::now();
        }
        (frame == "ping").then_some("pong")
    }

    /// Fans a frame out to every subscriber holding the permission. Slow
    /// or vanished subscribers are dropped.
    pub fn broadcast(&self, frame: BroadcastFrame, required_permission: Option<&str>) {
        let mut dropped = Vec::new();
        {
            let mut subscribers = self.subscribers.write();
            for (id, handle) in subscribers.iter_mut() {
                if let Some(permission) = required_permission {
                    if !handle.permissions.iter().any(|p| p == permission) {
                        continue;
                    }
                }
                match handle.sender.try_send(frame.clone()) {
                    Ok(()) => {
                        handle.last_sent = Instant::now();
                        self.count_frame();
                    }
                    Err(e) => {
                        warn!(subscriber = *id, error = %e, "dropping slow or closed subscriber");
                        dropped.push(*id);
                    }
                }
            }
            for id in &dropped {
                subscribers.remove(id);
            }
        }
        for id in dropped {
            debug!(subscriber = id, "removed after send failure");
        }
    }

    /// Periodic fan-out loop.
    ///
    /// Every tick pushes `pipeline_update` and `queue_update`; every fifth
    /// tick also `hardware_update`. Subscribers idle past the heartbeat
    /// window receive a `heartbeat` frame. Exits when the token cancels.
    pub async fn run_periodic(self: Arc<Self>, token: CancellationToken) {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        let heartbeat_after = Duration::from_secs(self.config.heartbeat_secs);
        info!(?interval, "starting periodic broadcast");

        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("periodic broadcast stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            if self.subscriber_count() == 0 {
                continue;
            }
            tick += 1;

            let pipeline = self.metrics.get_pipeline_metrics().await;
            self.broadcast(
                BroadcastFrame::new(BroadcastEventKind::PipelineUpdate, serde_json::json!(pipeline)),
                Some(MONITORING_READ),
            );

            let queue = self.metrics.get_queue_metrics().await;
            self.broadcast(
                BroadcastFrame::new(BroadcastEventKind::QueueUpdate, serde_json::json!(queue)),
                Some(MONITORING_READ),
            );

            if tick % 5 == 0 {
                let hardware = self.metrics.get_hardware_metrics().await;
                self.broadcast(
                    BroadcastFrame::new(BroadcastEventKind::HardwareUpdate, serde_json::json!(hardware)),
                    Some(MONITORING_READ),
                );
            }

            self.send_heartbeats(heartbeat_after);

            if tick % 60 == 0 {
                debug!(subscribers = self.subscriber_count(), "periodic broadcast active");
            }
        }
    }

    fn send_heartbeats(&self, idle_after: Duration) {
        let mut dropped = Vec::new();
        {
            let mut subscribers = self.subscribers.write();
            for (id, handle) in subscribers.iter_mut() {
                if handle.last_sent.elapsed() < idle_after {
                    continue;
                }
                let frame = BroadcastFrame::new(BroadcastEventKind::Heartbeat, serde_json::json!({}));
                match handle.sender.try_send(frame) {
                    Ok(()) => {
                        handle.last_sent = Instant::now();
                        self.count_frame();
                    }
                    Err(_) => dropped.push(*id),
                }
            }
            for id in &dropped {
                subscribers.remove(id);
            }
        }
    }
}

impl EventBroadcaster for BroadcastHub {
    fn stage_event(&self, kind: BroadcastEventKind, stage: Stage, document_id: Option<DocumentId>, status: &str) {
        let data = match kind {
            BroadcastEventKind::ProcessorStateChange => serde_json::json!({
                "processor_name": stage.processor_name(),
                "stage_name": stage.as_str(),
                "status": status,
                "document_id": document_id.map(|id| id.to_string()),
            }),
            _ => serde_json::json!({
                "stage": stage.as_str(),
                "document_id": document_id.map(|id| id.to_string()),
                "status": status,
            }),
        };
        self.broadcast(BroadcastFrame::new(kind, data), Some(MONITORING_READ));
    }

    fn alert_event(&self, alert: &Alert) {
        self.broadcast(
            BroadcastFrame::new(BroadcastEventKind::AlertTriggered, serde_json::json!(alert)),
            Some(MONITORING_READ),
        );
    }
}
