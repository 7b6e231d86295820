mod cli;
mod conditioner;
mod config;
mod detect;
mod error;
mod fetch;
mod offline;
mod pipeline;
mod scheduler;
mod sink;
mod store;
mod telemetry;

use crate::cli::{Cli, Commands};
use crate::conditioner::SignalConditioner;
use crate::config::Config;
use crate::detect::{ClusterDetector, TransitionDetector};
use crate::fetch::WindowFetcher;
use crate::offline::OfflineAnalyzer;
use crate::pipeline::{CyclePipeline, FaultPipeline, PipelineStats, TransitionPipeline};
use crate::scheduler::PollScheduler;
use crate::sink::AnomalySink;
use crate::store::InfluxStore;
use crate::telemetry::RF_CHANNELS;
use anyhow::{Context, Result};
use clap::Parser;
use futures::future;
use std::sync::Arc;
use tokio::sync::watch;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,anomaly_sidecar=info".into());
    // stdout carries the offline JSON reports, so logs go to stderr.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "anomaly-sidecar"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

/// Resolves once ctrl-c has been received, however late it is first polled.
fn shutdown_signal() -> impl std::future::Future<Output = ()> {
    let (tx, mut rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for shutdown signal");
            future::pending::<()>().await;
        }
        tracing::info!("shutdown signal received");
        let _ = tx.send(true);
    });
    async move {
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

async fn drive<P: CyclePipeline>(mut scheduler: PollScheduler<P>, once: bool) {
    if once {
        let (report, _) = scheduler.tick().await;
        tracing::info!(pipeline = scheduler.pipeline().name(), ?report, "single cycle complete");
    } else {
        scheduler.run_until(shutdown_signal()).await;
    }
}

fn store_channels(config: &Config) -> Vec<String> {
    let mut channels: Vec<String> = RF_CHANNELS.iter().map(|c| c.to_string()).collect();
    if config.transitions_with_faults {
        for channel in config.fault_channels() {
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
    }
    channels
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env(cli.command.mode())?;
    init_tracing(&config)?;

    if let Commands::Analyze(args) = &cli.command {
        let analyzer = OfflineAnalyzer::from_config(&config, args.window_rows);
        for report in analyzer.analyze_directory(&args.dir)? {
            println!("{}", serde_json::to_string(&report).context("failed to encode report")?);
        }
        return Ok(());
    }

    let store = Arc::new(InfluxStore::new(config.require_store()?.clone()).context("failed to build store client")?);
    let stats = Arc::new(PipelineStats::new());
    tracing::info!(
        mode = ?config.mode,
        poll_period_ms = config.poll_period.as_millis() as u64,
        lookback_secs = config.lookback.as_secs(),
        "anomaly-sidecar starting"
    );

    match cli.command {
        Commands::Transitions => {
            let mut pipeline = TransitionPipeline::new(
                store.clone(),
                WindowFetcher::new(store_channels(&config), config.lookback, config.align_tolerance),
                SignalConditioner::new(config.conditioner.clone()),
                TransitionDetector::new(config.transition.clone()),
                AnomalySink::new(store.clone(), config.transition_measurement.clone(), stats.clone()),
            );
            if config.transitions_with_faults {
                pipeline = pipeline.with_faults(
                    ClusterDetector::new(config.cluster.clone()),
                    AnomalySink::new(store.clone(), config.fault_measurement.clone(), stats.clone()),
                    config.cluster_resets_filter,
                );
            }
            let scheduler = PollScheduler::new(pipeline, config.poll_period, config.idle_backoff, stats.clone());
            drive(scheduler, cli.once).await;
        }
        Commands::Faults => {
            let pipeline = FaultPipeline::new(
                store.clone(),
                WindowFetcher::new(config.fault_channels(), config.lookback, config.align_tolerance),
                ClusterDetector::new(config.cluster.clone()),
                AnomalySink::new(store.clone(), config.fault_measurement.clone(), stats.clone()),
            );
            let scheduler = PollScheduler::new(pipeline, config.poll_period, config.idle_backoff, stats.clone());
            drive(scheduler, cli.once).await;
        }
        Commands::Analyze(_) => {}
    }

    drop(store);
    Ok(())
}
