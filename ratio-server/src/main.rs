use std::sync::Arc;
use std::time::Duration;

use ratio_core::bus::{Event, EventBus};
use ratio_core::bus_local::LocalEventBus;
use ratio_core::events;
use ratio_core::jwt::{InternalJwtManager, LocalKeySigner};
use ratio_core::process_table::ProcessTable;
use ratio_core::process_table_memory::MemoryProcessTable;
use ratio_core::storage_memory::MemoryStorage;
use ratio_core::subscriptions::{
    MemoryFilesystemSubscriptionTable, MemorySubscriptionTable, SubscriptionDispatcher,
    SubscriptionDispatcherConfig,
};
use ratio_core::{Coordinator, CoordinatorConfig, Reconciler, ReconcilerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let storage = Arc::new(MemoryStorage::new());

    let processes: Arc<dyn ProcessTable> = match parse_database_url() {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("connecting to PostgreSQL...");
            let pool = sqlx::PgPool::connect(&url).await?;
            let table = ratio_core::process_table_postgres::PostgresProcessTable::new(pool);
            table.migrate().await?;
            tracing::info!("using PostgresProcessTable (migrations applied)");
            Arc::new(table)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "DATABASE_URL set but postgres feature not enabled, using MemoryProcessTable"
            );
            Arc::new(MemoryProcessTable::new())
        }
        None => {
            tracing::info!("using MemoryProcessTable (no database URL configured)");
            Arc::new(MemoryProcessTable::new())
        }
    };

    let signing_key = std::env::var("RATIO_SIGNING_KEY")
        .unwrap_or_else(|_| uuid::Uuid::now_v7().to_string());
    let jwt = Arc::new(InternalJwtManager::new(
        Arc::new(LocalKeySigner::new("ratio-worker", signing_key.into_bytes())),
        15,
    ));

    let (bus, mut rx) = LocalEventBus::channel();
    let bus: Arc<dyn EventBus> = Arc::new(bus);

    let mut coordinator_config = CoordinatorConfig::default();
    if let Ok(default_dir) = std::env::var("RATIO_DEFAULT_WORKING_DIR") {
        storage.seed_directory(&default_dir).await;
        coordinator_config.default_working_directory = Some(default_dir);
    }

    let coordinator = Arc::new(Coordinator::new(
        storage.clone(),
        processes.clone(),
        bus.clone(),
        jwt.clone(),
        coordinator_config,
    ));

    let subscriptions = Arc::new(MemorySubscriptionTable::new());
    let fs_subscriptions = Arc::new(MemoryFilesystemSubscriptionTable::new());
    let dispatcher = Arc::new(SubscriptionDispatcher::new(
        subscriptions,
        fs_subscriptions,
        coordinator.clone(),
        jwt.clone(),
        SubscriptionDispatcherConfig::default(),
    ));

    // Periodic reconciliation sweep.
    let sweep_interval = std::env::var("RATIO_RECONCILE_INTERVAL_SECS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(60u64);
    let reconciler = Reconciler::new(
        processes.clone(),
        bus.clone(),
        jwt.clone(),
        ReconcilerConfig::default(),
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(sweep_interval));
        loop {
            ticker.tick().await;
            if let Err(err) = reconciler.run_sweep().await {
                tracing::error!(error = %err, "reconciliation sweep failed");
            }
        }
    });

    tracing::info!("ratio worker consuming events");

    while let Some(event) = rx.recv().await {
        if let Err(err) = route_event(&coordinator, &dispatcher, event).await {
            tracing::error!(error = %err, "event handler failed");
        }
    }

    Ok(())
}

async fn route_event(
    coordinator: &Arc<Coordinator>,
    dispatcher: &Arc<SubscriptionDispatcher>,
    event: Event,
) -> anyhow::Result<()> {
    match event.event_type.as_str() {
        events::EXECUTE_COMPOSITE_TOOL => {
            coordinator.handle_execute_composite(event.body_as()?).await?;
        }
        events::TOOL_RESPONSE => {
            coordinator.handle_tool_response(event.body_as()?).await?;
        }
        events::PARALLEL_COMPLETION_RECONCILIATION => {
            coordinator
                .handle_parallel_reconciliation(event.body_as()?)
                .await?;
        }
        events::GENERAL_SYSTEM_EVENT => {
            dispatcher.handle_general_event(event.body_as()?).await?;
        }
        events::FILE_UPDATE_EVENT => {
            dispatcher.handle_file_event(event.body_as()?).await?;
        }
        other => {
            // Leaf tool endpoints are served by external runtimes.
            tracing::debug!(event_type = %other, "no local handler for event type");
        }
    }
    Ok(())
}

/// Parse database URL from `--database-url <url>` CLI arg or
/// `DATABASE_URL` env var.
fn parse_database_url() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(url) = args
        .windows(2)
        .find(|w| w[0] == "--database-url")
        .map(|w| w[1].clone())
    {
        return Some(url);
    }
    std::env::var("DATABASE_URL").ok()
}
