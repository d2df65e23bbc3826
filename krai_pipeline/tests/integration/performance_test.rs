// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Performance collector behavior against the persistence layer:
//! baselines, current-metric updates, improvement calculation, and the
//! percentile ordering property.

use std::sync::Arc;

use proptest::prelude::*;

use krai_pipeline::infrastructure::repositories::MemoryDatabasePort;
use krai_pipeline::infrastructure::services::PerformanceCollector;
use krai_pipeline_domain::{DatabasePort, DocumentId, StageAggregates};

fn collector() -> (PerformanceCollector, Arc<MemoryDatabasePort>) {
    let port = Arc::new(MemoryDatabasePort::new());
    (PerformanceCollector::new(port.clone()), port)
}

#[tokio::test]
async fn baselines_upsert_per_name_and_day() {
    let (collector, port) = collector();
    let docs = vec![DocumentId::new(), DocumentId::new()];

    let first = StageAggregates {
        avg_seconds: 2.0,
        p50_seconds: 1.8,
        p95_seconds: 3.0,
        p99_seconds: 4.0,
    };
    collector
        .store_baseline("classification", first, &docs, Some("initial"))
        .await
        .unwrap();

    // Same name, same day: the row is replaced, not duplicated
    let second = StageAggregates {
        avg_seconds: 1.5,
        p50_seconds: 1.4,
        p95_seconds: 2.2,
        p99_seconds: 2.9,
    };
    collector
        .store_baseline("classification", second, &docs, Some("re-measured"))
        .await
        .unwrap();

    let baselines = port.all_baselines().await.unwrap();
    assert_eq!(baselines.len(), 1);
    assert_eq!(baselines[0].baseline.avg_seconds, 1.5);
    assert_eq!(baselines[0].notes.as_deref(), Some("re-measured"));
    assert_eq!(baselines[0].test_document_ids.len(), 2);
}

#[tokio::test]
async fn current_metrics_compute_improvement_against_the_baseline() {
    let (collector, _port) = collector();
    let baseline = StageAggregates {
        avg_seconds: 2.0,
        p50_seconds: 1.8,
        p95_seconds: 3.0,
        p99_seconds: 4.0,
    };
    collector
        .store_baseline("embedding", baseline, &[], None)
        .await
        .unwrap();

    let current = StageAggregates {
        avg_seconds: 1.5,
        p50_seconds: 1.2,
        p95_seconds: 2.4,
        p99_seconds: 3.0,
    };
    assert!(collector.update_current_metrics("embedding", current).await.unwrap());

    let report = collector
        .calculate_improvement("embedding")
        .await
        .unwrap()
        .expect("baseline present");
    // (2.0 - 1.5) / 2.0 * 100
    assert!((report.overall_improvement_percent - 25.0).abs() < 1e-9);
    assert!((report.improvement_avg_percent - 25.0).abs() < 1e-9);
    assert!((report.improvement_p95_percent - 20.0).abs() < 1e-9);
}

#[tokio::test]
async fn current_metrics_without_a_baseline_report_false() {
    let (collector, _port) = collector();
    let aggregates = StageAggregates {
        avg_seconds: 1.0,
        p50_seconds: 1.0,
        p95_seconds: 1.0,
        p99_seconds: 1.0,
    };
    assert!(!collector.update_current_metrics("svg_processing", aggregates).await.unwrap());
    assert!(collector.calculate_improvement("svg_processing").await.unwrap().is_none());
}

#[tokio::test]
async fn db_and_api_names_share_the_baselines_table_with_prefixes() {
    let (collector, port) = collector();
    let aggregates = StageAggregates {
        avg_seconds: 0.02,
        p50_seconds: 0.02,
        p95_seconds: 0.05,
        p99_seconds: 0.08,
    };

    collector
        .store_baseline("db__get_chunks", aggregates, &[], None)
        .await
        .unwrap();
    collector
        .store_baseline("api__ollama_embed", aggregates, &[], None)
        .await
        .unwrap();

    let names: Vec<String> = port
        .all_baselines()
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.stage_name)
        .collect();
    assert!(names.contains(&"db__get_chunks".to_string()));
    assert!(names.contains(&"api__ollama_embed".to_string()));
}

#[tokio::test]
async fn invalid_aggregates_are_rejected() {
    let (collector, _port) = collector();
    let negative = StageAggregates {
        avg_seconds: -1.0,
        p50_seconds: 0.0,
        p95_seconds: 0.0,
        p99_seconds: 0.0,
    };
    assert!(collector.store_baseline("upload", negative, &[], None).await.is_err());
}

proptest! {
    /// For any non-empty sample set, p50 <= p95 <= p99 and avg >= 0
    #[test]
    fn percentiles_are_monotonic(samples in proptest::collection::vec(0.0f64..10_000.0, 1..300)) {
        let port = Arc::new(MemoryDatabasePort::new());
        let collector = PerformanceCollector::new(port);
        let aggregates = collector.aggregate("any", &samples);

        prop_assert!(aggregates.avg_seconds >= 0.0);
        prop_assert!(aggregates.p50_seconds <= aggregates.p95_seconds + 1e-9);
        prop_assert!(aggregates.p95_seconds <= aggregates.p99_seconds + 1e-9);
    }
}
