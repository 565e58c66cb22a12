use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;

use crate::server::bus::EventBus;
use crate::server::collector::service::CollectorService;
use crate::server::collector::storage::ConfigStore;
use crate::server::config::ServerConfig;
use crate::server::graph::store::Neo4jStore;
use crate::server::graph::writer::GraphWriter;
use crate::server::orchestrator::service::ScanOrchestrator;
use crate::server::scanner::driver::NmapDriver;
use crate::server::tasks::service::TaskRegistry;

/// Wires every service once at startup; handlers reach them through
/// [`crate::server::config::AppState`]
pub struct ServiceFactory {
    pub config_store: Arc<ConfigStore>,
    pub event_bus: Arc<EventBus>,
    pub task_registry: Arc<TaskRegistry>,
    pub orchestrator: Arc<ScanOrchestrator>,
    pub collector_service: Arc<CollectorService>,
}

impl ServiceFactory {
    pub async fn new(config: &ServerConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&config.database_url)
            .await?;

        let config_store = Arc::new(ConfigStore::new(pool));
        config_store.ensure_schema().await?;

        let event_bus = EventBus::new(config.subscription_queue_cap);
        let task_registry =
            TaskRegistry::new(Duration::from_secs(config.task_retention_seconds));

        let graph_store = Arc::new(
            Neo4jStore::connect(&config.graph_url, &config.graph_user, &config.graph_password)
                .await?,
        );
        let graph_writer = GraphWriter::new(graph_store);

        let driver = Arc::new(NmapDriver::new(&config.scanner_bin));
        let orchestrator = ScanOrchestrator::new(
            driver,
            graph_writer,
            event_bus.clone(),
            task_registry.clone(),
            Duration::from_secs(config.ping_stage_timeout_secs),
            Duration::from_secs(config.port_stage_timeout_secs),
        );

        let collector_service = Arc::new(CollectorService::new(
            config_store.clone(),
            task_registry.clone(),
            orchestrator.clone(),
        ));

        Ok(Self {
            config_store,
            event_bus,
            task_registry,
            orchestrator,
            collector_service,
        })
    }
}
