#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

use anyhow::Result;
use clap::Parser;
use gpsgate_rs::admin::{self, AdminState};
use gpsgate_rs::buffer_pool::BufferPool;
use gpsgate_rs::config::Config;
use gpsgate_rs::endpoints::{tcp, udp};
use gpsgate_rs::pipeline::Pipeline;
use gpsgate_rs::plugin::PluginRegistry;
use gpsgate_rs::plugins::nmea::NmeaDecoder;
use gpsgate_rs::publisher::{BusProducer, KafkaBusProducer, MemoryBusProducer, Publisher};
use gpsgate_rs::resilience::{Backoff, RetryPolicy};
use gpsgate_rs::sessions::SessionTracker;
use gpsgate_rs::stats::{GatewaySample, StatsHistory};
use gpsgate_rs::validator::Validator;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "gpsgate.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("Starting gpsgate-rs with config: {}", args.config);

    let config = match Config::load(&args.config).await {
        Ok(c) => c,
        Err(e) => {
            error!("Error loading config: {:#}", e);
            return Err(e.into());
        }
    };

    let server_config = config.telemetry_server.clone();
    let workers = server_config.effective_workers();
    let intake_capacity = server_config.intake_capacity();
    info!(
        tcp_port = server_config.tcp_port,
        udp_port = server_config.udp_port,
        workers,
        intake_capacity,
        "Loaded configuration"
    );

    // Shared core singletons
    let tracker = Arc::new(SessionTracker::new());
    let pool = BufferPool::new(
        intake_capacity.min(4096).max(64),
        server_config.buffer_size,
    );

    let registry = Arc::new(PluginRegistry::new());
    registry.register(Arc::new(NmeaDecoder::new()), &config.plugin_settings)?;
    if config.plugin_settings.enable_hot_reload {
        warn!("Hot reload is not supported with static plugin registration; ignoring");
    }
    if let Some(directory) = &config.plugin_settings.directory {
        info!(
            directory = %directory,
            "Plugin directory configured; decoders are statically registered"
        );
    }

    let producer: Arc<dyn BusProducer> = if config.kafka.bootstrap_servers.is_empty() {
        warn!("kafka.bootstrap_servers is empty; using the in-memory bus (dev mode)");
        MemoryBusProducer::new()
    } else {
        Arc::new(KafkaBusProducer::new(&config.kafka)?)
    };
    let publisher = Arc::new(Publisher::new(
        producer,
        &config.kafka,
        &config.resilience.kafka,
        config.monitoring.service_name.clone(),
    ));
    let validator = Arc::new(Validator::new());

    let cancel_token = CancellationToken::new();
    // Fired only to abandon workers that missed the drain deadline
    let pipeline_token = CancellationToken::new();
    // Endpoint restarts reuse the connection policy's backoff
    let restart_backoff = Backoff::from_config(&config.resilience.connection);

    let (pipeline, intake) = Pipeline::spawn(
        workers,
        intake_capacity,
        registry.clone(),
        validator,
        publisher.clone(),
        RetryPolicy::from_config("processing", &config.resilience.processing),
        tracker.clone(),
        pipeline_token.clone(),
    );
    let pipeline = Arc::new(pipeline);

    let mut handles = vec![];

    // TCP acceptor
    {
        let name = format!("TCP Server :{}", server_config.tcp_port);
        let cfg = server_config.clone();
        let intake = intake.clone();
        let tracker = tracker.clone();
        let pool = pool.clone();
        let task_token = cancel_token.child_token();

        handles.push(tokio::spawn(supervise(
            name,
            restart_backoff.clone(),
            task_token.clone(),
            move || {
                let cfg = cfg.clone();
                let intake = intake.clone();
                let tracker = tracker.clone();
                let pool = pool.clone();
                let token = task_token.clone();
                async move { tcp::run(cfg, intake, tracker, pool, token).await }
            },
        )));
    }

    // UDP endpoint
    {
        let name = format!("UDP Endpoint :{}", server_config.udp_port);
        let cfg = server_config.clone();
        let intake = intake.clone();
        let tracker = tracker.clone();
        let pool = pool.clone();
        let task_token = cancel_token.child_token();

        handles.push(tokio::spawn(supervise(
            name,
            restart_backoff.clone(),
            task_token.clone(),
            move || {
                let cfg = cfg.clone();
                let intake = intake.clone();
                let tracker = tracker.clone();
                let pool = pool.clone();
                let token = task_token.clone();
                async move { udp::run(cfg, intake, tracker, pool, token).await }
            },
        )));
    }

    // Admin HTTP surface
    {
        let name = format!("Admin HTTP :{}", config.monitoring.admin_port);
        let publisher_check = publisher.clone();
        let pipeline_check = pipeline.clone();
        let checks: Vec<admin::HealthCheck> = vec![
            ("publisher", Arc::new(move || publisher_check.healthy())),
            ("pipeline", Arc::new(move || pipeline_check.is_running())),
        ];
        let state = Arc::new(AdminState::new(
            config.monitoring.service_name.clone(),
            tracker.clone(),
            checks,
        ));
        let port = config.monitoring.admin_port;
        let task_token = cancel_token.child_token();

        handles.push(tokio::spawn(supervise(
            name,
            restart_backoff.clone(),
            task_token.clone(),
            move || {
                let state = state.clone();
                let token = task_token.clone();
                async move { admin::run(port, state, token).await }
            },
        )));
    }

    // Stats reporting task
    let sample_interval = config.monitoring.stats_sample_interval_secs;
    let retention = config.monitoring.stats_retention_secs;
    let log_interval = config.monitoring.stats_log_interval_secs;

    if sample_interval > 0 && retention > 0 {
        let metrics = pipeline.metrics();
        let tracker_stats = tracker.clone();
        let stats_token = cancel_token.child_token();

        handles.push(tokio::spawn(async move {
            let mut history = StatsHistory::new(retention);
            let mut last_log_time = 0u64;

            loop {
                tokio::select! {
                    _ = stats_token.cancelled() => {
                        info!("Stats Reporter shutting down.");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(sample_interval)) => {
                        let snapshot = metrics.snapshot();
                        let timestamp = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_secs();

                        history.push(GatewaySample {
                            messages_received: snapshot.received,
                            messages_published: snapshot.published,
                            messages_failed: snapshot.failed_total(),
                            active_sessions: tracker_stats.active_sessions(),
                            timestamp,
                        });

                        if timestamp.saturating_sub(last_log_time) >= log_interval {
                            if let Some(min1) = history.aggregate(60) {
                                info!(
                                    "Stats [1min] in={:.1}/s out={:.1}/s failed={} sessions={}",
                                    min1.received_per_sec,
                                    min1.published_per_sec,
                                    min1.failed,
                                    min1.max_sessions
                                );
                            }
                            if let Some(all) = history.aggregate(retention) {
                                info!(
                                    "Stats [{}m] in={:.1}/s out={:.1}/s failed={} samples={}",
                                    retention / 60,
                                    all.received_per_sec,
                                    all.published_per_sec,
                                    all.failed,
                                    all.sample_count
                                );
                            }
                            last_log_time = timestamp;
                        }
                    }
                }
            }
        }));
    }

    let supervisors_done = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received. Initiating graceful shutdown...");
            false
        }
        _ = futures::future::join_all(&mut handles) => {
            info!("All supervised tasks completed/failed. Shutting down.");
            true
        }
    };

    // Graceful shutdown: stop intake first (acceptor, UDP, session readers
    // drain pending buffers into the pipeline on their way out)
    cancel_token.cancel();
    if !supervisors_done
        && tokio::time::timeout(
            Duration::from_secs(10),
            futures::future::join_all(handles),
        )
        .await
        .is_err()
    {
        error!("Connection layer exceeded its shutdown deadline; abandoning");
    }

    // Close the pipeline intake and await worker drain
    drop(intake);
    if !pipeline.drain(Duration::from_secs(15)).await {
        pipeline_token.cancel();
    }

    // Await delivery confirmation for in-flight records
    if let Err(e) = publisher.flush(Duration::from_secs(30)).await {
        error!("Publisher flush failed: {}", e);
    }
    publisher.shutdown();

    registry.shutdown();

    info!("Shutdown complete.");
    Ok(())
}

async fn supervise<F, Fut>(
    name: String,
    backoff: Backoff,
    cancel_token: CancellationToken,
    task_factory: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = gpsgate_rs::error::Result<()>> + Send + 'static,
{
    let mut delay = backoff.first();
    loop {
        let started = tokio::time::Instant::now();
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Supervisor for {} received cancellation signal. Exiting.", name);
                break;
            }
            result = task_factory() => {
                match result {
                    Ok(_) => {
                        warn!("Supervisor: Task {} finished cleanly (unexpected). Restarting in {:?}...", name, delay);
                    }
                    Err(e) => {
                        error!("Supervisor: Task {} failed: {:#}. Restarting in {:?}...", name, e, delay);
                    }
                }
                // A run that stayed up for a while resets the backoff
                if started.elapsed() > Duration::from_secs(60) {
                    delay = backoff.first();
                }
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = backoff.advance(delay);
            }
        }
    }
}
