//! AccountFlow Development Monolith
//!
//! All-in-one binary for local development containing:
//! - Account service with its transactional outbox (in-memory or SQLite)
//! - Embedded partitioned broker
//! - Stats aggregator with its read API
//! - Gateway session cache, invalidation consumer and expiry sweeper
//! - Metrics endpoint

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::net::TcpListener;
use anyhow::Result;
use tracing::{info, warn, error};
use tracing_subscriber::EnvFilter;
use axum::{extract::State, routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::trace::TraceLayer;
use sqlx::sqlite::SqlitePoolOptions;

use af_account::{AccountService, InMemoryAccountRepository, NewAccount};
use af_broker::{InMemoryBroker, SubscriptionConfig, SubscriptionLoop};
use af_common::{
    DeadLetterRouter, InMemoryDeadLetterLog, WarningService, WarningServiceConfig, LIFECYCLE_TOPICS,
};
use af_config::AppConfig;
use af_gateway::{consumer_group, SessionAuthCache, SessionInvalidator};
use af_outbox::{
    InMemoryOutboxStore, OutboxPublisher, OutboxPublisherConfig, OutboxStore, SqliteOutboxStore,
    TransactionManager,
};
use af_stats::{stats_router, AggregatorConfig, InMemoryStatsStore, LifecycleAggregator, STATS_CONSUMER_GROUP};

/// AccountFlow Development Server
#[derive(Parser, Debug)]
#[command(name = "af-dev")]
#[command(about = "AccountFlow Development Monolith - All components in one binary")]
struct Args {
    /// Path to a TOML config file; defaults plus AF_* variables when unset
    #[arg(long, env = "AF_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP port for stats, health and metrics (overrides stats.http_port)
    #[arg(long, env = "AF_HTTP_PORT")]
    http_port: Option<u16>,

    /// Outbox store: memory or sqlite
    #[arg(long, env = "AF_OUTBOX_DB_TYPE", default_value = "memory")]
    outbox_db_type: String,

    /// SQLite URL for the outbox
    #[arg(long, env = "AF_OUTBOX_DB_URL", default_value = "sqlite::memory:")]
    outbox_db_url: String,

    /// Accounts to create at startup to exercise the pipeline
    #[arg(long, env = "AF_SEED_ACCOUNTS", default_value = "0")]
    seed_accounts: u32,

    /// Emit logs as JSON
    #[arg(long, env = "AF_LOG_JSON", default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::from_env()?,
    };
    let http_port = args.http_port.unwrap_or(config.stats.http_port);

    info!("Starting AccountFlow Dev Monolith");
    info!(
        http_port = http_port,
        partitions = config.broker.partitions,
        gateway_instance = %config.gateway.instance_id,
        "Configuration ready"
    );

    let metrics_handle = PrometheusBuilder::new().install_recorder()?;

    // Setup shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // 1. Embedded broker
    let broker = Arc::new(InMemoryBroker::new(
        config.broker.partitions,
        config.broker.retention_per_partition,
    ));

    // 2. Warnings and dead letters
    let warnings = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let dead_letters = Arc::new(InMemoryDeadLetterLog::new());

    // 3. Outbox and account service
    let outbox_store = create_outbox_store(&args).await?;
    let publisher = OutboxPublisher::new(
        outbox_store.clone(),
        broker.clone(),
        DeadLetterRouter::new(dead_letters.clone(), warnings.clone(), "account-outbox"),
        OutboxPublisherConfig {
            retry: config.retry.clone(),
            max_concurrent_deliveries: config.outbox.max_concurrent_deliveries,
            group_channel_capacity: config.outbox.channel_capacity,
            recovery_batch_size: config.outbox.recovery_batch_size,
            ..Default::default()
        },
    );
    // Pick up anything committed by a previous run
    publisher.recover_pending().await?;
    let recovery_handle = publisher.spawn_recovery(config.outbox.recovery_interval(), shutdown_tx.subscribe());

    let transactions = TransactionManager::new(outbox_store, publisher.clone());
    let accounts = AccountService::new(Arc::new(InMemoryAccountRepository::new()), transactions);

    // 4. Stats aggregator
    let aggregator = Arc::new(
        LifecycleAggregator::restore(
            Arc::new(InMemoryStatsStore::new(config.stats.dedup_window)),
            AggregatorConfig {
                dedup_window: config.stats.dedup_window,
                dedup_shards: config.stats.dedup_shards,
            },
        )
        .await?,
    );
    let stats_subscription = Arc::new(SubscriptionLoop::subscribe(
        broker.clone(),
        aggregator.clone(),
        DeadLetterRouter::new(dead_letters.clone(), warnings.clone(), "stats-consumer"),
        subscription_config(STATS_CONSUMER_GROUP, &config),
    ));
    stats_subscription.start();

    // 5. Gateway session cache
    let sessions = Arc::new(SessionAuthCache::new());
    let gateway_subscription = Arc::new(SubscriptionLoop::subscribe(
        broker.clone(),
        Arc::new(SessionInvalidator::new(sessions.clone())),
        DeadLetterRouter::new(dead_letters.clone(), warnings.clone(), "gateway-consumer"),
        subscription_config(&consumer_group(&config.gateway.instance_id), &config),
    ));
    gateway_subscription.start();
    let sweeper_handle = sessions.spawn_sweeper(config.gateway.sweep_interval(), shutdown_tx.subscribe());

    // 6. Optional seed traffic
    for i in 1..=args.seed_accounts {
        let account = NewAccount {
            username: format!("dev-user-{}", i),
            role: "USER".to_string(),
            positions: Vec::new(),
        };
        if let Err(e) = accounts.create_account(account).await {
            warn!(error = %e, "Seed account creation failed");
        }
    }

    // 7. HTTP: stats, health, metrics
    let app = stats_router(aggregator.clone())
        .merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(metrics_handle),
        )
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", http_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);

    let http_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let server = axum::serve(listener, app);
            tokio::select! {
                result = server => {
                    if let Err(e) = result {
                        error!("HTTP server error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("HTTP server shutting down");
                }
            }
        })
    };

    info!("AccountFlow Dev Monolith started successfully");
    info!("Press Ctrl+C to shutdown");

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    // Stop taking new work, then let in-flight deliveries finish
    publisher.shutdown();
    if !publisher.wait_idle(Duration::from_secs(10)).await {
        warn!(
            in_flight = publisher.in_flight_count(),
            "Outbox deliveries still in flight, they will be recovered on next start"
        );
    }

    // Broadcast shutdown to all components
    let _ = shutdown_tx.send(());

    stats_subscription.shutdown().await;
    gateway_subscription.shutdown().await;

    // Wait for all handles with timeout
    let shutdown_timeout = Duration::from_secs(30);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = http_handle.await;
        let _ = recovery_handle.await;
        let _ = sweeper_handle.await;
    }).await;

    let stats = aggregator.snapshot().await;
    info!(
        total_accounts = stats.total_accounts,
        applied_events = stats.applied_events,
        dead_letters = dead_letters.len(),
        critical_warnings = warnings.critical_count(),
        "AccountFlow Dev Monolith shutdown complete"
    );
    Ok(())
}

fn subscription_config(group: &str, config: &AppConfig) -> SubscriptionConfig {
    let consumer = &config.consumer;
    let mut subscription = SubscriptionConfig::new(group, &LIFECYCLE_TOPICS);
    subscription.worker_count = consumer.worker_count;
    subscription.poll_batch_size = consumer.poll_batch_size;
    subscription.idle_poll_interval = consumer.idle_poll_interval();
    subscription.processing_timeout = consumer.processing_timeout();
    subscription.retry = config.retry.clone();
    subscription
}

async fn create_outbox_store(args: &Args) -> Result<Arc<dyn OutboxStore>> {
    match args.outbox_db_type.as_str() {
        "memory" => {
            info!("Outbox using in-memory store");
            Ok(Arc::new(InMemoryOutboxStore::new()))
        }
        "sqlite" => {
            let pool = SqlitePoolOptions::new()
                .max_connections(sqlite_max_connections(&args.outbox_db_url))
                .connect(&args.outbox_db_url)
                .await?;
            let store = SqliteOutboxStore::new(pool);
            store.init_schema().await?;
            info!("Outbox using SQLite: {}", args.outbox_db_url);
            Ok(Arc::new(store))
        }
        other => {
            Err(anyhow::anyhow!("Unknown outbox database type: {}. Use memory or sqlite", other))
        }
    }
}

/// Every connection to an in-memory SQLite URL opens its own empty
/// database, so the schema is only visible on a single connection
fn sqlite_max_connections(url: &str) -> u32 {
    if url.contains(":memory:") || url.contains("mode=memory") {
        1
    } else {
        4
    }
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
