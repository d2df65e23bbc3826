// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Performance Collector
//!
//! Collects, aggregates, and stores pipeline timing metrics. Three
//! in-memory buffers accumulate durations keyed by name: stage
//! executions, database queries, and external API calls. A parallel
//! outcome buffer records success/failure per stage so flush results
//! include success rates.
//!
//! ## Aggregation Rules
//!
//! `aggregate` computes `{avg, p50, p95, p99}` in seconds rounded to three
//! decimals, with sample-size-dependent percentile handling:
//!
//! - no samples: all zeros
//! - fewer than 5 samples: p95 and p99 are the maximum
//! - 5 to 99 samples: exclusive-method quantile cut points with `n` equal
//!   to the sample count, indexed at `floor(0.95 * (n-1))` and
//!   `floor(0.99 * (n-1))`
//! - 100 or more samples: 100-quantile buckets, indices 94 and 98
//!
//! ## Baselines
//!
//! Aggregates can be persisted as baselines keyed by
//! `(name, measurement_date)`. Database query and API endpoint metrics
//! share the baselines table under `db__` and `api__` name prefixes.
//! Updating current metrics against the most recent baseline recomputes
//! the improvement percentage `(baseline_avg - current_avg) /
//! baseline_avg * 100`.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use krai_pipeline_domain::{
    DatabasePort, DocumentId, PerformanceBaseline, PipelineError, ProcessingResult, StageAggregates,
};

/// Aggregates plus outcome counters returned by a stage buffer flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FlushedStageMetrics {
    pub aggregates: StageAggregates,
    pub success_count: u64,
    pub failure_count: u64,
    /// Fraction in `[0, 1]`
    pub success_rate: f64,
}

/// Per-metric improvement percentages against the latest baseline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImprovementReport {
    pub stage_name: String,
    pub baseline: StageAggregates,
    pub current: Option<StageAggregates>,
    pub improvement_avg_percent: f64,
    pub improvement_p50_percent: f64,
    pub improvement_p95_percent: f64,
    pub improvement_p99_percent: f64,
    pub overall_improvement_percent: f64,
}

#[derive(Clone, Copy)]
enum TimingBuffer {
    Db,
    Api,
}

#[derive(Default)]
struct Buffers {
    stage_durations: BTreeMap<String, Vec<f64>>,
    stage_outcomes: BTreeMap<String, Vec<bool>>,
    db_durations: BTreeMap<String, Vec<f64>>,
    api_durations: BTreeMap<String, Vec<f64>>,
}

/// Service collecting and aggregating pipeline performance metrics.
pub struct PerformanceCollector {
    port: Arc<dyn DatabasePort>,
    buffers: Mutex<Buffers>,
}

impl PerformanceCollector {
    pub fn new(port: Arc<dyn DatabasePort>) -> Self {
        Self {
            port,
            buffers: Mutex::new(Buffers::default()),
        }
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Buffers the timing and outcome of one stage execution.
    ///
    /// Failure timings are buffered too: time spent before a failure is
    /// real load.
    pub fn collect_stage_metrics(&self, stage_name: &str, result: &ProcessingResult) {
        self.collect_stage_sample(stage_name, result.processing_time, result.success);
        debug!(
            stage = stage_name,
            seconds = result.processing_time,
            success = result.success,
            correlation_id = result.correlation_id.as_deref().unwrap_or("N/A"),
            "collected stage metric"
        );
    }

    /// Buffers a raw stage sample
    pub fn collect_stage_sample(&self, stage_name: &str, seconds: f64, success: bool) {
        let mut buffers = self.buffers.lock();
        buffers
            .stage_durations
            .entry(stage_name.to_string())
            .or_default()
            .push(seconds);
        buffers
            .stage_outcomes
            .entry(stage_name.to_string())
            .or_default()
            .push(success);
    }

    /// Buffers the duration of one database query
    pub fn collect_db_query_metric(&self, query_type: &str, seconds: f64) {
        self.buffers
            .lock()
            .db_durations
            .entry(query_type.to_string())
            .or_default()
            .push(seconds);
    }

    /// Buffers the duration of one external API call
    pub fn collect_api_response_metric(&self, endpoint: &str, seconds: f64) {
        self.buffers
            .lock()
            .api_durations
            .entry(endpoint.to_string())
            .or_default()
            .push(seconds);
    }

    /// Discards every buffered sample
    pub fn clear_buffers(&self) {
        *self.buffers.lock() = Buffers::default();
    }

    // ------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------

    /// Computes `{avg, p50, p95, p99}` for a set of durations
    pub fn aggregate(&self, name: &str, durations: &[f64]) -> StageAggregates {
        if durations.is_empty() {
            warn!(name, "no durations to aggregate");
            return StageAggregates::default();
        }

        let mut sorted = durations.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();

        let avg = sorted.iter().sum::<f64>() / n as f64;
        let p50 = median(&sorted);

        let (p95, p99) = if n < 5 {
            warn!(name, samples = n, "small sample; using max for p95 and p99");
            let max = sorted[n - 1];
            (max, max)
        } else if n < 100 {
            let cuts = quantiles_exclusive(&sorted, n);
            let p95_idx = ((0.95 * cuts.len() as f64) as usize).min(cuts.len() - 1);
            let p99_idx = ((0.99 * cuts.len() as f64) as usize).min(cuts.len() - 1);
            (cuts[p95_idx], cuts[p99_idx])
        } else {
            let cuts = quantiles_exclusive(&sorted, 100);
            (cuts[94], cuts[98])
        };

        let aggregates = StageAggregates {
            avg_seconds: round3(avg),
            p50_seconds: round3(p50),
            p95_seconds: round3(p95),
            p99_seconds: round3(p99),
        };

        debug!(
            name,
            samples = n,
            avg = aggregates.avg_seconds,
            p50 = aggregates.p50_seconds,
            p95 = aggregates.p95_seconds,
            p99 = aggregates.p99_seconds,
            "aggregated samples"
        );

        aggregates
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    /// Aggregates and clears the stage buffer.
    ///
    /// With `stage_name` set only that stage is flushed; otherwise every
    /// buffered stage.
    pub fn flush_metrics_buffer(&self, stage_name: Option<&str>) -> BTreeMap<String, FlushedStageMetrics> {
        let (durations, outcomes) = {
            let mut buffers = self.buffers.lock();
            match stage_name {
                Some(name) => {
                    let durations = buffers.stage_durations.remove(name);
                    let outcomes = buffers.stage_outcomes.remove(name);
                    if durations.is_none() && outcomes.is_none() {
                        warn!(stage = name, "no buffered metrics for stage");
                        return BTreeMap::new();
                    }
                    let mut d = BTreeMap::new();
                    d.insert(name.to_string(), durations.unwrap_or_default());
                    let mut o = BTreeMap::new();
                    o.insert(name.to_string(), outcomes.unwrap_or_default());
                    (d, o)
                }
                None => {
                    let durations = std::mem::take(&mut buffers.stage_durations);
                    let mut outcomes = std::mem::take(&mut buffers.stage_outcomes);
                    let mut merged = durations;
                    // A stage may have outcomes without durations; keep it
                    for name in outcomes.keys().cloned().collect::<Vec<_>>() {
                        merged.entry(name).or_default();
                    }
                    let outcomes_full = merged
                        .keys()
                        .map(|name| (name.clone(), outcomes.remove(name).unwrap_or_default()))
                        .collect();
                    (merged, outcomes_full)
                }
            }
        };

        let mut flushed = BTreeMap::new();
        for (name, samples) in durations {
            let outcomes = outcomes.get(&name).cloned().unwrap_or_default();
            let success_count = outcomes.iter().filter(|ok| **ok).count() as u64;
            let failure_count = outcomes.len() as u64 - success_count;
            let total = outcomes.len() as u64;
            let metrics = FlushedStageMetrics {
                aggregates: self.aggregate(&name, &samples),
                success_count,
                failure_count,
                success_rate: if total > 0 {
                    success_count as f64 / total as f64
                } else {
                    0.0
                },
            };
            info!(
                stage = %name,
                samples = samples.len(),
                success = success_count,
                failure = failure_count,
                "flushed stage metrics"
            );
            flushed.insert(name, metrics);
        }
        flushed
    }

    /// Aggregates and clears the database query buffer
    pub fn flush_db_buffer(&self, query_type: Option<&str>) -> BTreeMap<String, StageAggregates> {
        self.flush_named_buffer(query_type, TimingBuffer::Db)
    }

    /// Aggregates and clears the API call buffer
    pub fn flush_api_buffer(&self, endpoint: Option<&str>) -> BTreeMap<String, StageAggregates> {
        self.flush_named_buffer(endpoint, TimingBuffer::Api)
    }

    fn flush_named_buffer(&self, name: Option<&str>, which: TimingBuffer) -> BTreeMap<String, StageAggregates> {
        let prefix = match which {
            TimingBuffer::Db => "db__",
            TimingBuffer::Api => "api__",
        };
        let drained: BTreeMap<String, Vec<f64>> = {
            let mut buffers = self.buffers.lock();
            let buffer = match which {
                TimingBuffer::Db => &mut buffers.db_durations,
                TimingBuffer::Api => &mut buffers.api_durations,
            };
            match name {
                Some(name) => match buffer.remove(name) {
                    Some(samples) => {
                        let mut one = BTreeMap::new();
                        one.insert(name.to_string(), samples);
                        one
                    }
                    None => {
                        warn!(name, "no buffered metrics");
                        return BTreeMap::new();
                    }
                },
                None => std::mem::take(buffer),
            }
        };

        drained
            .into_iter()
            .map(|(name, samples)| {
                let aggregates = self.aggregate(&format!("{}{}", prefix, name), &samples);
                info!(name = %name, samples = samples.len(), "flushed timing buffer");
                (name, aggregates)
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Baselines
    // ------------------------------------------------------------------

    /// Persists a baseline for a stage (`db__`/`api__` prefixes share the
    /// table), upserting on `(name, measurement_date)`
    pub async fn store_baseline(
        &self,
        stage_name: &str,
        aggregates: StageAggregates,
        test_document_ids: &[DocumentId],
        notes: Option<&str>,
    ) -> Result<(), PipelineError> {
        if !validate_aggregates(&aggregates) {
            error!(stage = stage_name, "invalid aggregate values; baseline not stored");
            return Err(PipelineError::validation_error(format!(
                "invalid aggregates for '{}'",
                stage_name
            )));
        }

        self.port
            .upsert_baseline(stage_name, aggregates, test_document_ids, notes)
            .await?;
        info!(
            stage = stage_name,
            avg = aggregates.avg_seconds,
            p95 = aggregates.p95_seconds,
            "stored performance baseline"
        );
        Ok(())
    }

    /// Writes current metrics onto the most recent baseline and recomputes
    /// the improvement percentage. Returns false when no baseline exists.
    pub async fn update_current_metrics(
        &self,
        stage_name: &str,
        aggregates: StageAggregates,
    ) -> Result<bool, PipelineError> {
        if !validate_aggregates(&aggregates) {
            return Err(PipelineError::validation_error(format!(
                "invalid aggregates for '{}'",
                stage_name
            )));
        }

        let updated = self.port.update_current_metrics(stage_name, aggregates).await?;
        if updated {
            info!(stage = stage_name, avg = aggregates.avg_seconds, "updated current metrics");
        } else {
            warn!(
                stage = stage_name,
                "no baseline found; create one with store_baseline first"
            );
        }
        Ok(updated)
    }

    /// Per-metric and overall improvement against the latest baseline
    pub async fn calculate_improvement(&self, stage_name: &str) -> Result<Option<ImprovementReport>, PipelineError> {
        let Some(baseline) = self.port.latest_baseline(stage_name).await? else {
            warn!(stage = stage_name, "no baseline found");
            return Ok(None);
        };

        let current = baseline.current;
        let report = ImprovementReport {
            stage_name: stage_name.to_string(),
            baseline: baseline.baseline,
            current,
            improvement_avg_percent: improvement(
                baseline.baseline.avg_seconds,
                current.map(|c| c.avg_seconds),
            ),
            improvement_p50_percent: improvement(
                baseline.baseline.p50_seconds,
                current.map(|c| c.p50_seconds),
            ),
            improvement_p95_percent: improvement(
                baseline.baseline.p95_seconds,
                current.map(|c| c.p95_seconds),
            ),
            improvement_p99_percent: improvement(
                baseline.baseline.p99_seconds,
                current.map(|c| c.p99_seconds),
            ),
            overall_improvement_percent: baseline.improvement_percentage.unwrap_or(0.0),
        };
        Ok(Some(report))
    }

    /// All stored baselines
    pub async fn get_all_baselines(&self) -> Result<Vec<PerformanceBaseline>, PipelineError> {
        self.port.all_baselines().await
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Exclusive-method quantile cut points over sorted data.
///
/// Returns `n - 1` cut points. For cut `i` (1-based), the rank is
/// `i * (len + 1) / n`; the value interpolates between the neighboring
/// order statistics, with ranks clamped into `[1, len - 1]`.
fn quantiles_exclusive(sorted: &[f64], n: usize) -> Vec<f64> {
    let len = sorted.len();
    let m = len + 1;
    let mut cuts = Vec::with_capacity(n.saturating_sub(1));
    for i in 1..n {
        let product = i * m;
        let mut j = product / n;
        let delta = product % n;
        j = j.clamp(1, len - 1);
        let interpolated =
            (sorted[j - 1] * (n - delta) as f64 + sorted[j] * delta as f64) / n as f64;
        cuts.push(interpolated);
    }
    cuts
}

fn validate_aggregates(aggregates: &StageAggregates) -> bool {
    [
        aggregates.avg_seconds,
        aggregates.p50_seconds,
        aggregates.p95_seconds,
        aggregates.p99_seconds,
    ]
    .iter()
    .all(|value| value.is_finite() && *value >= 0.0)
}

fn improvement(baseline: f64, current: Option<f64>) -> f64 {
    match current {
        Some(current) if baseline != 0.0 => (baseline - current) / baseline * 100.0,
        _ => 0.0,
    }
}
