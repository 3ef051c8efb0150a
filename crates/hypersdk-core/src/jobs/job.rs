//! Job data model: the immutable JobDefinition submitted by a caller and
//! the mutable Job record the manager owns for its lifetime.

use crate::capability::ExportMethod;
use crate::exporter::{ExportResult, Progress};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Stable identifier for a Job, unique for the lifetime of the daemon.
/// A freely-submitted job gets a UUID; a scheduler-materialized job gets
/// `<schedule-id>-<unix-timestamp>` instead, so either form must fit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Builds the id a scheduled fire assigns to its materialized job.
    pub fn for_schedule(schedule_id: &str, fired_at: DateTime<Utc>) -> Self {
        Self(format!("{schedule_id}-{}", fired_at.timestamp()))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

/// Opaque provider credentials, passed through to the Exporter untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials(pub HashMap<String, String>);

/// Export-time tuning knobs (parallelism, compression level, etc.). Kept
/// as a free-form map since the core never interprets these values
/// itself; only the Exporter does.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions(pub HashMap<String, Value>);

/// Immutable description of a requested export. Once stored by the
/// manager it is never mutated; `id` is unique for the lifetime of the
/// daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: Option<JobId>,
    pub name: String,
    pub source_vm_id: String,
    pub destination_dir: String,
    pub format_hint: Option<String>,
    pub method: Option<ExportMethod>,
    pub credentials: Credentials,
    pub options: JobOptions,
}

impl JobDefinition {
    /// Builds a definition with an unassigned id; the manager assigns one
    /// on submit if `id` is still `None`.
    pub fn new(
        source_vm_id: impl Into<String>,
        name: impl Into<String>,
        destination_dir: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            source_vm_id: source_vm_id.into(),
            destination_dir: destination_dir.into(),
            format_hint: None,
            method: None,
            credentials: Credentials::default(),
            options: JobOptions::default(),
        }
    }

    /// Returns a clone with the `<schedule-id>-<unix-timestamp>` id and a
    /// "(scheduled)" suffix on the name, as produced when the Cron
    /// Scheduler materializes a template.
    pub fn materialize_for_schedule(&self, schedule_id: &str, fired_at: DateTime<Utc>) -> Self {
        let mut clone = self.clone();
        clone.id = Some(JobId::for_schedule(schedule_id, fired_at));
        clone.name = format!("{} (scheduled)", self.name);
        clone
    }
}

/// Lifecycle status. Transitions are final; see the state machine owned
/// by the Job Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobTimestamps {
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// The mutable runtime record. Owned exclusively by the Job Manager;
/// every external read is a deep copy (`Job::snapshot`).
#[derive(Debug, Clone)]
pub struct Job {
    pub definition: JobDefinition,
    pub status: JobStatus,
    pub progress: Progress,
    pub result: Option<ExportResult>,
    pub error: Option<String>,
    pub timestamps: JobTimestamps,
    /// Only present while running; not cloned into snapshots since a
    /// cancellation token is not meaningfully "copyable" data for a
    /// caller to observe.
    pub cancel_token: Option<CancellationToken>,
    /// Set when this Job originated from a ScheduledJob fire, so the
    /// manager knows to write an ExecutionRecord on terminal transition.
    pub schedule_id: Option<String>,
    /// Append-only line buffer backing `JobManager::logs`. Not part of
    /// `JobSnapshot`; fetched separately since it can grow unbounded
    /// over a long-running export.
    pub logs: Vec<String>,
}

impl Job {
    pub fn new_pending(definition: JobDefinition, schedule_id: Option<String>) -> Self {
        let method = definition.method.unwrap_or(ExportMethod::Web);
        Self {
            definition,
            status: JobStatus::Pending,
            progress: Progress {
                phase: "pending".to_string(),
                percent_complete: 0,
                current_step: String::new(),
                bytes_transferred: 0,
                files_downloaded: 0,
                eta_seconds: None,
                method,
            },
            result: None,
            error: None,
            timestamps: JobTimestamps {
                submitted_at: Some(Utc::now()),
                ..Default::default()
            },
            cancel_token: None,
            schedule_id,
            logs: Vec::new(),
        }
    }

    /// A deep copy suitable for returning from Get/Query; the
    /// cancellation handle is never exposed.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.definition.id.clone(),
            definition: self.definition.clone(),
            status: self.status,
            progress: self.progress.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            timestamps: self.timestamps.clone(),
            schedule_id: self.schedule_id.clone(),
        }
    }

    /// Appends a timestamped line to this job's log buffer.
    pub fn push_log(&mut self, line: impl AsRef<str>) {
        self.logs.push(format!("{} {}", Utc::now().to_rfc3339(), line.as_ref()));
    }
}

/// What callers of `Get`/`Query` actually receive: no cancellation
/// handle, fully owned data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Option<JobId>,
    pub definition: JobDefinition,
    pub status: JobStatus,
    pub progress: Progress,
    pub result: Option<ExportResult>,
    pub error: Option<String>,
    pub timestamps: JobTimestamps,
    pub schedule_id: Option<String>,
}
