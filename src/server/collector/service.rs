//! Glue between the HTTP surface and the scan runtime: config loading,
//! plan validation, task registration and orchestrator hand-off.

use std::sync::Arc;

use uuid::Uuid;

use crate::server::collector::storage::ConfigStore;
use crate::server::orchestrator::service::ScanOrchestrator;
use crate::server::planner::base::build_plan;
use crate::server::planner::types::ScanConfig;
use crate::server::shared::types::api::ApiError;
use crate::server::tasks::service::{CancelOutcome, Task, TaskRegistry};

pub struct CollectorService {
    config_store: Arc<ConfigStore>,
    registry: Arc<TaskRegistry>,
    orchestrator: Arc<ScanOrchestrator>,
}

impl CollectorService {
    pub fn new(
        config_store: Arc<ConfigStore>,
        registry: Arc<TaskRegistry>,
        orchestrator: Arc<ScanOrchestrator>,
    ) -> Self {
        Self {
            config_store,
            registry,
            orchestrator,
        }
    }

    /// Start a scan from the user's stored configuration. Validation and
    /// the one-scan-per-user rule are enforced before anything runs.
    pub async fn start_scan(&self, user_id: &str) -> Result<Task, ApiError> {
        let config = self
            .config_store
            .get(user_id)
            .await
            .map_err(|e| ApiError::internal_error(e.to_string()))?
            .unwrap_or_default();

        let plan = build_plan(&config).map_err(|e| ApiError::bad_request(e.to_string()))?;

        let task = self
            .registry
            .start(user_id)
            .await
            .map_err(|e| ApiError::conflict(e.to_string()))?;

        tracing::info!(
            task_id = %task.task_id,
            user_id = %user_id,
            "Starting scan of {} hosts, {} ports",
            plan.hosts.len(),
            if plan.scan_all_ports { 65535 } else { plan.ports.len() }
        );

        self.orchestrator.spawn_scan(task.clone(), plan);
        Ok(task)
    }

    pub async fn cancel_scan(&self, task_id: &Uuid) -> CancelOutcome {
        self.registry.cancel(task_id).await
    }

    pub async fn get_task(&self, task_id: &Uuid) -> Option<Task> {
        self.registry.get(task_id).await
    }

    pub async fn get_config(&self, user_id: &str) -> Result<ScanConfig, ApiError> {
        Ok(self
            .config_store
            .get(user_id)
            .await
            .map_err(|e| ApiError::internal_error(e.to_string()))?
            .unwrap_or_default())
    }

    /// Validate and persist a scan config; the stored value is returned
    pub async fn put_config(
        &self,
        user_id: &str,
        config: ScanConfig,
    ) -> Result<ScanConfig, ApiError> {
        build_plan(&config).map_err(|e| ApiError::bad_request(e.to_string()))?;

        self.config_store
            .upsert(user_id, &config)
            .await
            .map_err(|e| ApiError::internal_error(e.to_string()))
    }
}
