// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Binary entry point: parses the CLI, wires the composition root, and
//! maps outcomes onto process exit codes.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use krai_pipeline::application::services::document_pipeline::{
    PipelineRunOutcome, ProcessorRegistry, StageSequencer,
};
use krai_pipeline::application::use_cases::ingest_document::{IngestDocument, IngestOutcome};
use krai_pipeline::infrastructure::broadcast::{BroadcastHub, StaticTokenVerifier};
use krai_pipeline::infrastructure::config::PipelineConfig;
use krai_pipeline::infrastructure::metrics::exporter::PipelineMetricsExporter;
use krai_pipeline::infrastructure::repositories::{MemoryDatabasePort, PostgresDatabasePort};
use krai_pipeline::infrastructure::runtime::{CancellationRegistry, RetryListener, StageRunner};
use krai_pipeline::infrastructure::services::{
    AlertService, EmailSink, MetricsService, PerformanceCollector, SlackSink, StageTracker, SysinfoProbe,
};
use krai_pipeline::presentation::cli::{Cli, Command};
use krai_pipeline::presentation::validation::RequestValidator;
use krai_pipeline_bootstrap::ExitCode;
use krai_pipeline_domain::{DatabasePort, DocumentId, EventBroadcaster};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            ExitCode::SetupFailure.exit();
        }
    };

    let code = runtime.block_on(run(cli));
    code.exit();
}

async fn run(cli: Cli) -> ExitCode {
    let config = match PipelineConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::SetupFailure;
        }
    };

    if matches!(cli.command, Command::ValidateConfig) {
        return validate_config(&config);
    }

    let port: Arc<dyn DatabasePort> = if config.database.url.is_empty() {
        warn!("POSTGRES_URL not set; using the in-memory store (state is process-local)");
        Arc::new(MemoryDatabasePort::new())
    } else {
        match PostgresDatabasePort::connect(&config.database).await {
            Ok(port) => Arc::new(port),
            Err(e) => {
                eprintln!("database connection failed: {}", e);
                return ExitCode::SetupFailure;
            }
        }
    };

    // Composition root: monitoring first, then the execution machinery
    let collector = Arc::new(PerformanceCollector::new(port.clone()));
    let metrics = Arc::new(MetricsService::new(port.clone(), Arc::new(SysinfoProbe::new())));

    let exporter = match PipelineMetricsExporter::new() {
        Ok(exporter) => Arc::new(exporter),
        Err(e) => {
            eprintln!("metrics exporter setup failed: {}", e);
            return ExitCode::SetupFailure;
        }
    };

    let monitoring_token = std::env::var("KRAI_MONITORING_TOKEN").unwrap_or_default();
    let hub = Arc::new(
        BroadcastHub::new(
            Arc::new(StaticTokenVerifier::monitoring(monitoring_token)),
            metrics.clone(),
            config.broadcast.clone(),
        )
        .with_exporter(exporter.clone()),
    );
    let broadcaster: Arc<dyn EventBroadcaster> = hub.clone();

    let alerts = Arc::new(
        AlertService::new(port.clone(), metrics.clone())
            .with_broadcaster(broadcaster.clone())
            .with_sink(Arc::new(EmailSink::new(config.smtp.clone())))
            .with_sink(Arc::new(SlackSink::new(config.slack.clone()))),
    );

    let tracker = Arc::new(StageTracker::new(port.clone(), &config.database.schema_prefix).with_broadcaster(broadcaster));
    let cancellations = Arc::new(CancellationRegistry::new());

    let runner = Arc::new(
        StageRunner::new(port.clone(), config.retry.clone(), cancellations.clone())
            .with_collector(collector.clone())
            .with_alerts(alerts.clone())
            .with_exporter(exporter.clone()),
    );

    // Content processors are registered by the embedding application;
    // the bare CLI runs with an empty registry and every stage records a
    // skip.
    let registry = Arc::new(ProcessorRegistry::new());
    if registry.is_empty() {
        info!("no stage processors registered; stages will be skipped");
    }

    let sequencer = Arc::new(
        StageSequencer::new(
            port.clone(),
            runner.clone(),
            tracker.clone(),
            registry,
            config.clone(),
            cancellations.clone(),
        )
        .with_exporter(exporter.clone()),
    );
    let listener: Arc<dyn RetryListener> = sequencer.clone();
    runner.set_retry_listener(Arc::downgrade(&listener));

    let validator = Arc::new(RequestValidator::new(config.security.clone()));
    let ingest = IngestDocument::new(port.clone(), sequencer.clone(), validator);

    match cli.command {
        Command::Process {
            file,
            document_type,
            language,
        } => match ingest.ingest_file(&file, &document_type, &language).await {
            Ok(IngestOutcome::Duplicate { document_id }) => {
                println!("duplicate content; existing document: {}", document_id);
                ExitCode::Success
            }
            Ok(IngestOutcome::Processed { document_id, run }) => match run {
                PipelineRunOutcome::Completed => {
                    println!("document {} completed", document_id);
                    ExitCode::Success
                }
                PipelineRunOutcome::Suspended { stage } => {
                    println!("document {} suspended at {}; background retries own the stage", document_id, stage);
                    ExitCode::Success
                }
                PipelineRunOutcome::Cancelled => {
                    println!("document {} cancelled", document_id);
                    ExitCode::BusinessFailure
                }
                PipelineRunOutcome::Failed { stage, error } => {
                    eprintln!("document {} failed at {}: {}", document_id, stage, error);
                    ExitCode::BusinessFailure
                }
            },
            Err(e) => {
                eprintln!("ingest rejected: {}", e);
                ExitCode::BusinessFailure
            }
        },

        Command::Status { document_id } => {
            let Ok(document_id) = document_id.parse::<DocumentId>() else {
                eprintln!("invalid document id");
                return ExitCode::SetupFailure;
            };
            match port.get_document(document_id).await {
                Ok(Some(document)) => {
                    println!("document:  {}", document.id);
                    println!("filename:  {}", document.filename);
                    println!("status:    {}", document.processing_status);
                    println!("progress:  {:.1}%", document.overall_progress());
                    if let Some(stage) = document.current_stage() {
                        println!("stage:     {}", stage);
                    }
                    for (stage, state) in &document.stage_status {
                        println!("  {:<22} {:<12} {:>5.1}%", stage.as_str(), state.status, state.progress_percent);
                    }
                    ExitCode::Success
                }
                Ok(None) => {
                    eprintln!("document {} not found", document_id);
                    ExitCode::BusinessFailure
                }
                Err(e) => {
                    eprintln!("status lookup failed: {}", e);
                    ExitCode::SetupFailure
                }
            }
        }

        Command::Cancel { document_id } => {
            let Ok(document_id) = document_id.parse::<DocumentId>() else {
                eprintln!("invalid document id");
                return ExitCode::SetupFailure;
            };
            match sequencer.cancel_document(document_id).await {
                Ok(()) => {
                    println!("cancellation requested for {}", document_id);
                    ExitCode::Success
                }
                Err(e) => {
                    eprintln!("cancellation failed: {}", e);
                    ExitCode::BusinessFailure
                }
            }
        }

        Command::ValidateConfig => unreachable!("handled before wiring"),
    }
}

fn validate_config(config: &PipelineConfig) -> ExitCode {
    // Redact credentials before printing
    let mut printable = config.clone();
    if !printable.database.url.is_empty() {
        printable.database.url = "<set>".to_string();
    }
    printable.smtp.password = printable.smtp.password.map(|_| "<set>".to_string());

    match serde_json::to_string_pretty(&printable) {
        Ok(rendered) => {
            println!("{}", rendered);
            ExitCode::Success
        }
        Err(e) => {
            eprintln!("failed to render configuration: {}", e);
            ExitCode::SetupFailure
        }
    }
}
