//! Persistence Port: the abstract interface the core depends on for
//! schedule and execution-history durability. The backing store (on-disk
//! row store, in-memory) is a collaborator's choice; this crate ships
//! one in-memory implementation used by tests and standalone operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::scheduler::ScheduledJob;

/// One audit row per scheduled fire. Append-only; most recent first on
/// read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub schedule_id: Uuid,
    pub job_id: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub duration_seconds: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// The fire landed outside every configured TimeWindow; no Submit was made.
    Skipped,
    /// `JobManager::submit_scheduled` itself returned an error (e.g. QueueFull).
    SubmitFailed,
    /// The materialized job ran to completion.
    Completed,
    /// The materialized job reached a terminal Failed status.
    Failed,
    /// The materialized job was cancelled before finishing.
    Cancelled,
}

/// Abstract interface exposed to the core. `save_schedule` is upsert by
/// id; `delete_schedule` is idempotent; `list_executions` returns
/// most-recent-first. Implementations need only guarantee that
/// `save_schedule` is atomic per-row.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn save_schedule(&self, schedule: ScheduledJob) -> Result<(), PersistenceError>;
    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduledJob>, PersistenceError>;
    async fn list_schedules(&self) -> Result<Vec<ScheduledJob>, PersistenceError>;
    async fn delete_schedule(&self, id: Uuid) -> Result<(), PersistenceError>;
    async fn append_execution(&self, record: ExecutionRecord) -> Result<(), PersistenceError>;
    async fn list_executions(&self, schedule_id: Uuid, limit: usize) -> Result<Vec<ExecutionRecord>, PersistenceError>;
}

#[derive(Default)]
struct Store {
    schedules: HashMap<Uuid, ScheduledJob>,
    executions: HashMap<Uuid, Vec<ExecutionRecord>>,
}

/// In-memory implementation. Not a stub: it honors every invariant the
/// port promises (atomic upsert, idempotent delete, most-recent-first
/// listing), it's simply volatile across restarts.
pub struct InMemoryPersistence {
    store: RwLock<Store>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(Store::default()),
        }
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistencePort for InMemoryPersistence {
    async fn save_schedule(&self, schedule: ScheduledJob) -> Result<(), PersistenceError> {
        let mut store = self.store.write().expect("persistence lock poisoned");
        store.schedules.insert(schedule.id, schedule);
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduledJob>, PersistenceError> {
        let store = self.store.read().expect("persistence lock poisoned");
        Ok(store.schedules.get(&id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduledJob>, PersistenceError> {
        let store = self.store.read().expect("persistence lock poisoned");
        Ok(store.schedules.values().cloned().collect())
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<(), PersistenceError> {
        let mut store = self.store.write().expect("persistence lock poisoned");
        store.schedules.remove(&id);
        Ok(())
    }

    async fn append_execution(&self, record: ExecutionRecord) -> Result<(), PersistenceError> {
        let mut store = self.store.write().expect("persistence lock poisoned");
        store.executions.entry(record.schedule_id).or_default().push(record);
        Ok(())
    }

    async fn list_executions(&self, schedule_id: Uuid, limit: usize) -> Result<Vec<ExecutionRecord>, PersistenceError> {
        let store = self.store.read().expect("persistence lock poisoned");
        let mut records = store.executions.get(&schedule_id).cloned().unwrap_or_default();
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ScheduledJob;
    use crate::jobs::JobDefinition;

    fn sample_schedule() -> ScheduledJob {
        ScheduledJob::new(
            "nightly-backup",
            "*/5 * * * *",
            JobDefinition::new("vm-a", "nightly", "/out"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = InMemoryPersistence::new();
        let schedule = sample_schedule();
        store.save_schedule(schedule.clone()).await.unwrap();
        let fetched = store.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, schedule.id);
        assert_eq!(fetched.cron_expression, schedule.cron_expression);
    }

    #[tokio::test]
    async fn save_with_same_id_overwrites() {
        let store = InMemoryPersistence::new();
        let mut schedule = sample_schedule();
        store.save_schedule(schedule.clone()).await.unwrap();
        schedule.name = "renamed".into();
        store.save_schedule(schedule.clone()).await.unwrap();

        let fetched = store.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "renamed");
        assert_eq!(store.list_schedules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryPersistence::new();
        let schedule = sample_schedule();
        store.save_schedule(schedule.clone()).await.unwrap();
        store.delete_schedule(schedule.id).await.unwrap();
        store.delete_schedule(schedule.id).await.unwrap();
        assert!(store.get_schedule(schedule.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_executions_is_most_recent_first() {
        let store = InMemoryPersistence::new();
        let schedule_id = Uuid::new_v4();
        for i in 0..3 {
            store
                .append_execution(ExecutionRecord {
                    schedule_id,
                    job_id: None,
                    executed_at: Utc::now(),
                    status: ExecutionStatus::Completed,
                    duration_seconds: Some(i as f64),
                    error: None,
                })
                .await
                .unwrap();
        }
        let records = store.list_executions(schedule_id, 10).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].duration_seconds, Some(2.0));
        assert_eq!(records[2].duration_seconds, Some(0.0));
    }
}
