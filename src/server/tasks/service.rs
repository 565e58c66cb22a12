//! Registry of running and recently finished scan tasks.
//!
//! One mutexed map for the whole process; contention is O(concurrent
//! scans). Terminal tasks stay in the map for a short retention window so a
//! late cancel gets `already_terminal` instead of `not_found`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::server::scanner::events::ScanStage;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Complete,
    Partial,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }

    pub fn as_stream_status(self) -> &'static str {
        match self {
            Self::Running => "progress",
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    AlreadyTerminal,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a scan is already running for user '{0}'")]
    ScanAlreadyRunning(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub task_id: Uuid,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub stage: ScanStage,
    pub cancel_requested: bool,
    /// Processed-event counters keyed by collector (stage) name
    pub events_processed: HashMap<String, u64>,
    pub total_events: Option<u64>,
    pub status: TaskStatus,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl Task {
    fn new(user_id: String) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            user_id,
            created_at: Utc::now(),
            stage: ScanStage::Ping,
            cancel_requested: false,
            events_processed: HashMap::new(),
            total_events: None,
            status: TaskStatus::Running,
            finished_at: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn processed(&self, stage: ScanStage) -> u64 {
        self.events_processed
            .get(&stage.to_string())
            .copied()
            .unwrap_or(0)
    }
}

pub struct TaskRegistry {
    tasks: Mutex<HashMap<Uuid, Task>>,
    retention: Duration,
}

impl TaskRegistry {
    pub fn new(retention: Duration) -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            retention,
        })
    }

    /// Register a new running task. At most one running task per user.
    pub async fn start(&self, user_id: &str) -> Result<Task, RegistryError> {
        let mut tasks = self.tasks.lock().await;
        if tasks
            .values()
            .any(|t| t.user_id == user_id && t.status == TaskStatus::Running)
        {
            return Err(RegistryError::ScanAlreadyRunning(user_id.to_string()));
        }

        let task = Task::new(user_id.to_string());
        tasks.insert(task.task_id, task.clone());
        tracing::info!(task_id = %task.task_id, user_id = %user_id, "Scan task created");
        Ok(task)
    }

    pub async fn get(&self, task_id: &Uuid) -> Option<Task> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    pub async fn snapshot_all(&self) -> Vec<Task> {
        self.tasks.lock().await.values().cloned().collect()
    }

    /// Request cancellation. Idempotent while the task runs; terminal and
    /// unknown tasks are reported as such.
    pub async fn cancel(&self, task_id: &Uuid) -> CancelOutcome {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(task_id) else {
            return CancelOutcome::NotFound;
        };
        if task.status.is_terminal() {
            return CancelOutcome::AlreadyTerminal;
        }

        task.cancel_requested = true;
        task.cancel.cancel();
        tracing::info!(task_id = %task_id, "Cancellation requested");
        CancelOutcome::Cancelled
    }

    /// Transition to a terminal status. At most one finalization wins;
    /// returns whether this call was it. Removal from the registry is
    /// scheduled after the retention window.
    pub async fn finalize(self: &Arc<Self>, task_id: &Uuid, status: TaskStatus) -> bool {
        debug_assert!(status.is_terminal());

        let finalized = {
            let mut tasks = self.tasks.lock().await;
            match tasks.get_mut(task_id) {
                Some(task) if !task.status.is_terminal() => {
                    task.status = status;
                    task.stage = ScanStage::Finalizing;
                    task.finished_at = Some(Utc::now());
                    true
                }
                _ => false,
            }
        };

        if finalized {
            tracing::info!(task_id = %task_id, status = %status, "Scan task finalized");
            let registry = Arc::clone(self);
            let task_id = *task_id;
            let retention = self.retention;
            tokio::spawn(async move {
                tokio::time::sleep(retention).await;
                registry.tasks.lock().await.remove(&task_id);
                tracing::debug!(task_id = %task_id, "Retired terminal task");
            });
        }
        finalized
    }

    pub async fn set_stage(&self, task_id: &Uuid, stage: ScanStage) {
        if let Some(task) = self.tasks.lock().await.get_mut(task_id) {
            task.stage = stage;
        }
    }

    pub async fn set_total(&self, task_id: &Uuid, total: u64) {
        if let Some(task) = self.tasks.lock().await.get_mut(task_id) {
            task.total_events = Some(total);
        }
    }

    /// Bump the processed counter for one collector; returns the new value
    pub async fn record_processed(&self, task_id: &Uuid, stage: ScanStage) -> u64 {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(task_id) else {
            return 0;
        };
        let counter = task.events_processed.entry(stage.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub async fn running_count(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .count()
    }

    /// Cancel every running task and wait (bounded) for them to finalize
    pub async fn shutdown(&self) {
        let task_ids: Vec<Uuid> = self
            .snapshot_all()
            .await
            .into_iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.task_id)
            .collect();

        for task_id in &task_ids {
            self.cancel(task_id).await;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.running_count().await > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("Shutdown proceeding with tasks still running");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
