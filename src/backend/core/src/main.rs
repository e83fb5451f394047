//! Tally consumer service - Main entry point
//!
//! Runs one consumer worker per event kind against the configured bus and
//! projection store until SIGINT/SIGTERM.

use clap::Parser;
use std::sync::Arc;

use tally_core::{
    bus::{InMemoryBus, MessageBus, RedisBus},
    config::{BusBackend, Config},
    consumers::ConsumerRegistry,
    delivery::{DeadLetterSink, InMemoryDeadLetters, RedisDeadLetters},
    events::EventKind,
    store::{redis_store, InMemoryStore, ProjectionStore, RedisStore},
    telemetry,
    worker::{ConsumerWorker, WorkerConfig},
};

#[derive(Parser, Debug)]
#[command(name = "tally-consumer")]
#[command(author, version, about = "Tally projection consumer service")]
struct Args {
    /// Configuration file (TOML/YAML/JSON); environment variables override it
    #[arg(short, long, env = "TALLY_CONFIG")]
    config: Option<String>,

    /// Event kinds to consume (repeatable); all kinds when omitted
    #[arg(short, long = "kind", value_name = "KIND")]
    kinds: Vec<EventKind>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    telemetry::init_telemetry(&config.logging, &config.environment)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        backend = ?config.bus.backend,
        "Starting Tally consumer"
    );

    let (store, bus, dead_letters): (
        Arc<dyn ProjectionStore>,
        Arc<dyn MessageBus>,
        Arc<dyn DeadLetterSink>,
    ) = match config.bus.backend {
        BusBackend::Redis => {
            let conn = redis_store::connect(&config.redis).await?;
            (
                Arc::new(RedisStore::new(conn.clone())),
                Arc::new(RedisBus::new(conn.clone(), config.bus.redis.clone())),
                Arc::new(RedisDeadLetters::new(
                    conn,
                    config.bus.dead_letter_key.clone(),
                    config.bus.dead_letter_max,
                )),
            )
        }
        BusBackend::Memory => {
            tracing::warn!("Running on the in-memory bus and store; nothing is persisted");
            (
                Arc::new(InMemoryStore::new()),
                Arc::new(InMemoryBus::new()),
                Arc::new(InMemoryDeadLetters::new(config.bus.dead_letter_max)),
            )
        }
    };

    let registry = Arc::new(ConsumerRegistry::with_defaults(
        config.store.consumer_context(store),
    ));

    let kinds = if args.kinds.is_empty() {
        EventKind::ALL.to_vec()
    } else {
        args.kinds.clone()
    };

    let mut handles = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let worker_config = WorkerConfig {
            name: format!("{}-{}", config.worker.name, kind),
            ..config.worker.clone()
        };
        let worker = ConsumerWorker::new(kind, bus.clone(), registry.clone(), dead_letters.clone())
            .with_retry_policy(config.retry.clone())
            .with_config(worker_config);
        handles.push(worker.start());
    }

    tracing::info!(workers = handles.len(), "Consumer workers running");

    shutdown_signal().await;

    for handle in &handles {
        handle.shutdown();
    }
    for handle in handles {
        let stats = handle.stats().clone();
        handle.join().await;
        tracing::info!(
            received = stats.received(),
            applied = stats.applied(),
            duplicates = stats.duplicates(),
            retried = stats.retried(),
            dead_lettered = stats.dead_lettered(),
            "Worker finished"
        );
    }

    tracing::info!(dead_letters = dead_letters.len().await?, "Tally consumer stopped");
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
