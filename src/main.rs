use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pg_event_ledger::config::AppConfig;
use pg_event_ledger::domain::endpoint::{
    ApiEndpoint, CreateEndpoint, EndpointCommand, EndpointCommandHandler, EndpointEvent, EndpointProjection,
    HttpMethod, UpdateEndpoint, ENDPOINT_PROJECTION,
};
use pg_event_ledger::event_sourcing::store::{
    connect, EventStore, PostgresEventRepository, PostgresSnapshotStore, PostgresSubscriptionStore,
};
use pg_event_ledger::event_sourcing::{Aggregate, SubscriptionDispatcher};
use pg_event_ledger::metrics::{self, Metrics};
use pg_event_ledger::utils::RetryConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pg_event_ledger=debug")),
        )
        .init();

    tracing::info!("🚀 Starting PostgreSQL event ledger demo");

    let config = AppConfig::from_env()?;

    // === 1. Initialize Prometheus metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // Start metrics HTTP server in background thread
    let metrics_registry = metrics.registry().clone();
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        if let Err(e) = system.block_on(metrics::start_metrics_server(metrics_registry, metrics_port)) {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    // === 2. Connect to PostgreSQL and apply the schema ===
    tracing::info!("Connecting to PostgreSQL...");
    let pool = connect(&config.database).await?;
    let repository = Arc::new(PostgresEventRepository::new(pool.clone()));
    repository.migrate().await?;

    let store = Arc::new(
        EventStore::new(repository)
            .with_snapshots(Arc::new(PostgresSnapshotStore::new(pool.clone())))
            .with_snapshot_policy(config.snapshot_policy())
            .with_metrics(metrics.clone()),
    );

    // === 3. Start the subscription dispatcher ===
    let projection = EndpointProjection::new();
    let mut dispatcher = SubscriptionDispatcher::new(
        Arc::new(PostgresSubscriptionStore::new(pool.clone())),
        config.dispatcher_config(),
    )
    .with_metrics(metrics.clone());
    dispatcher.register_handler::<EndpointEvent, _>(
        ENDPOINT_PROJECTION,
        ApiEndpoint::AGGREGATE_TYPE,
        projection.clone(),
    )?;
    let dispatcher = dispatcher.spawn();

    // === 4. Demonstrate the endpoint lifecycle ===
    tracing::info!("📝 Demonstrating endpoint lifecycle");
    let handler = EndpointCommandHandler::new(store.clone()).with_conflict_retry(RetryConfig::default());

    let endpoint_id = handler
        .create(CreateEndpoint {
            name: "Public status".to_string(),
            url: "https://status.example.com/health".to_string(),
            method: HttpMethod::Get,
            headers: None,
            body: None,
            owner_id: 1,
            recurring_enabled: true,
            recurring_interval: Some("5m".to_string()),
        })
        .await?;
    tracing::info!("✅ Endpoint created: {}", endpoint_id);

    let version = handler
        .handle(
            endpoint_id,
            EndpointCommand::Update(UpdateEndpoint {
                method: Some(HttpMethod::Head),
                ..UpdateEndpoint::default()
            }),
        )
        .await?;
    tracing::info!("✅ Endpoint updated to version {}", version);

    // Wait for the projection to catch up
    let poll_interval = config.dispatcher_config().poll_interval;
    for _ in 0..30 {
        if projection.get(endpoint_id).await.map(|v| v.version) == Some(version) {
            break;
        }
        tokio::time::sleep(poll_interval).await;
    }
    match projection.get(endpoint_id).await {
        Some(view) => tracing::info!(
            endpoint_id = %endpoint_id,
            method = %view.method,
            version = view.version,
            "🔎 Read model caught up"
        ),
        None => tracing::warn!(endpoint_id = %endpoint_id, "Read model has not caught up yet"),
    }

    let history = store.history(endpoint_id, None, None).await?;
    tracing::info!("📜 Endpoint history has {} events", history.len());

    tracing::info!("Running until Ctrl-C");
    tokio::signal::ctrl_c().await?;

    dispatcher.stop().await;
    pool.close().await;
    tracing::info!("👋 Shut down");

    Ok(())
}
