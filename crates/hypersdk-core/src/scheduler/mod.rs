//! Cron Scheduler: translates persisted recurrence rules into
//! `JobManager::submit` calls, gated by the Time-Window Manager.
//!
//! The timer table is single-owner: every external operation is a
//! command sent over a channel to the actor task, avoiding lock-order
//! coupling with the Job Manager.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::jobs::{JobDefinition, JobId, JobManager};
use crate::persistence::{ExecutionRecord, ExecutionStatus, PersistencePort};
use crate::time_window::{in_window, TimeWindow};

/// A persisted recurrence rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub enabled: bool,
    pub template: JobDefinition,
    pub tags: Vec<String>,
    pub time_windows: Vec<TimeWindow>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
    pub next_run: Option<chrono::DateTime<Utc>>,
    pub last_run: Option<chrono::DateTime<Utc>>,
    pub run_count: u64,
}

impl ScheduledJob {
    pub fn new(name: impl Into<String>, cron_expression: impl Into<String>, template: JobDefinition) -> Result<Self, SchedulerError> {
        let cron_expression = cron_expression.into();
        parse_five_field_cron(&cron_expression)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            cron_expression,
            enabled: true,
            template,
            tags: Vec::new(),
            time_windows: Vec::new(),
            created_at: now,
            updated_at: now,
            next_run: None,
            last_run: None,
            run_count: 0,
        })
    }
}

/// Parses a standard 5-field cron expression (minute hour day-of-month
/// month day-of-week) by prepending a constant seconds field, since the
/// `cron` crate's grammar is 6-field.
fn parse_five_field_cron(expr: &str) -> Result<CronSchedule, SchedulerError> {
    let with_seconds = format!("0 {expr}");
    CronSchedule::from_str(&with_seconds).map_err(|e| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

enum Command {
    Add(ScheduledJob, oneshot::Sender<Result<Uuid, SchedulerError>>),
    Remove(Uuid, oneshot::Sender<Result<(), SchedulerError>>),
    Update(Uuid, ScheduledJob, oneshot::Sender<Result<(), SchedulerError>>),
    Enable(Uuid, oneshot::Sender<Result<(), SchedulerError>>),
    Disable(Uuid, oneshot::Sender<Result<(), SchedulerError>>),
    TriggerNow(Uuid, oneshot::Sender<Result<(), SchedulerError>>),
    List(oneshot::Sender<Vec<ScheduledJob>>),
    LoadFromStore(oneshot::Sender<Result<(), SchedulerError>>),
    Stop,
}

struct TimerEntry {
    schedule: ScheduledJob,
    cron: CronSchedule,
}

/// Handle to the running scheduler actor.
pub struct CronScheduler {
    commands: mpsc::Sender<Command>,
}

impl CronScheduler {
    /// Spawns the actor task and returns a handle.
    pub fn start<S: Send + Sync + 'static>(
        job_manager: Arc<JobManager<S>>,
        persistence: Arc<dyn PersistencePort>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_actor(rx, job_manager, persistence));
        Self { commands: tx }
    }

    pub async fn add(&self, schedule: ScheduledJob) -> Result<Uuid, SchedulerError> {
        self.call(|reply| Command::Add(schedule, reply)).await
    }

    pub async fn remove(&self, id: Uuid) -> Result<(), SchedulerError> {
        self.call(|reply| Command::Remove(id, reply)).await
    }

    pub async fn update(&self, id: Uuid, schedule: ScheduledJob) -> Result<(), SchedulerError> {
        self.call(|reply| Command::Update(id, schedule, reply)).await
    }

    pub async fn enable(&self, id: Uuid) -> Result<(), SchedulerError> {
        self.call(|reply| Command::Enable(id, reply)).await
    }

    pub async fn disable(&self, id: Uuid) -> Result<(), SchedulerError> {
        self.call(|reply| Command::Disable(id, reply)).await
    }

    pub async fn trigger_now(&self, id: Uuid) -> Result<(), SchedulerError> {
        self.call(|reply| Command::TriggerNow(id, reply)).await
    }

    pub async fn list(&self) -> Vec<ScheduledJob> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::List(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn load_from_store(&self) -> Result<(), SchedulerError> {
        self.call(|reply| Command::LoadFromStore(reply)).await
    }

    /// Stops the actor; in-flight fires are allowed to drain since the
    /// actor only processes one command/fire at a time.
    pub async fn stop(&self) {
        let _ = self.commands.send(Command::Stop).await;
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T, SchedulerError>>) -> Command) -> Result<T, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SchedulerError::NotFound(Uuid::nil()))?;
        rx.await.map_err(|_| SchedulerError::NotFound(Uuid::nil()))?
    }
}

async fn run_actor<S: Send + Sync + 'static>(
    mut commands: mpsc::Receiver<Command>,
    job_manager: Arc<JobManager<S>>,
    persistence: Arc<dyn PersistencePort>,
) {
    let mut timers: HashMap<Uuid, TimerEntry> = HashMap::new();
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                if handle_command(cmd, &mut timers, &persistence).await {
                    break;
                }
            }
            _ = tick.tick() => {
                fire_due_entries(&mut timers, &job_manager, &persistence).await;
            }
        }
    }
}

/// Returns true if the actor should stop.
async fn handle_command(cmd: Command, timers: &mut HashMap<Uuid, TimerEntry>, persistence: &Arc<dyn PersistencePort>) -> bool {
    match cmd {
        Command::Add(schedule, reply) => {
            let _ = reply.send(add_entry(schedule, timers, persistence).await);
        }
        Command::Remove(id, reply) => {
            timers.remove(&id);
            let result = persistence.delete_schedule(id).await.map_err(SchedulerError::from);
            let _ = reply.send(result);
        }
        Command::Update(id, mut schedule, reply) => {
            schedule.id = id;
            timers.remove(&id);
            let result = add_entry(schedule, timers, persistence).await.map(|_| ());
            let _ = reply.send(result);
        }
        Command::Enable(id, reply) => {
            let result = set_enabled(id, true, timers, persistence).await;
            let _ = reply.send(result);
        }
        Command::Disable(id, reply) => {
            let result = set_enabled(id, false, timers, persistence).await;
            let _ = reply.send(result);
        }
        Command::TriggerNow(id, reply) => {
            let result = if timers.contains_key(&id) { Ok(()) } else { Err(SchedulerError::NotFound(id)) };
            if let Some(entry) = timers.get_mut(&id) {
                entry.schedule.next_run = Some(Utc::now());
            }
            let _ = reply.send(result);
        }
        Command::List(reply) => {
            let list = persistence.list_schedules().await.unwrap_or_default();
            let _ = reply.send(list);
        }
        Command::LoadFromStore(reply) => {
            let result = load_from_store(timers, persistence).await;
            let _ = reply.send(result);
        }
        Command::Stop => return true,
    }
    false
}

async fn add_entry(mut schedule: ScheduledJob, timers: &mut HashMap<Uuid, TimerEntry>, persistence: &Arc<dyn PersistencePort>) -> Result<Uuid, SchedulerError> {
    let cron = parse_five_field_cron(&schedule.cron_expression)?;
    for window in &schedule.time_windows {
        window.validate().map_err(SchedulerError::InvalidTimeWindow)?;
    }
    schedule.next_run = cron.after(&Utc::now()).next();
    let id = schedule.id;
    persistence.save_schedule(schedule.clone()).await?;
    if schedule.enabled {
        timers.insert(id, TimerEntry { schedule, cron });
    } else {
        timers.remove(&id);
    }
    Ok(id)
}

async fn set_enabled(id: Uuid, enabled: bool, timers: &mut HashMap<Uuid, TimerEntry>, persistence: &Arc<dyn PersistencePort>) -> Result<(), SchedulerError> {
    let mut schedule = match persistence.get_schedule(id).await? {
        Some(s) => s,
        None => return Err(SchedulerError::NotFound(id)),
    };
    schedule.enabled = enabled;
    schedule.updated_at = Utc::now();
    let cron = parse_five_field_cron(&schedule.cron_expression)?;
    if enabled {
        schedule.next_run = cron.after(&Utc::now()).next();
    }
    persistence.save_schedule(schedule.clone()).await?;
    if enabled {
        timers.insert(id, TimerEntry { schedule, cron });
    } else {
        timers.remove(&id);
    }
    Ok(())
}

async fn load_from_store(timers: &mut HashMap<Uuid, TimerEntry>, persistence: &Arc<dyn PersistencePort>) -> Result<(), SchedulerError> {
    timers.clear();
    let schedules = persistence.list_schedules().await?;
    for mut schedule in schedules {
        if !schedule.enabled {
            continue;
        }
        match parse_five_field_cron(&schedule.cron_expression) {
            Ok(cron) => {
                schedule.next_run = cron.after(&Utc::now()).next();
                timers.insert(schedule.id, TimerEntry { schedule, cron });
            }
            Err(e) => warn!(schedule_id = %schedule.id, error = %e, "dropping schedule with unparsable cron on load"),
        }
    }
    info!(count = timers.len(), "loaded schedules from persistence");
    Ok(())
}

async fn fire_due_entries<S: Send + Sync + 'static>(
    timers: &mut HashMap<Uuid, TimerEntry>,
    job_manager: &Arc<JobManager<S>>,
    persistence: &Arc<dyn PersistencePort>,
) {
    let now = Utc::now();
    let due: Vec<Uuid> = timers
        .iter()
        .filter(|(_, entry)| entry.schedule.next_run.map(|next_run| next_run <= now).unwrap_or(false))
        .map(|(id, _)| *id)
        .collect();

    for id in due {
        fire_one(id, timers, job_manager, persistence).await;
    }
}

async fn fire_one<S: Send + Sync + 'static>(
    id: Uuid,
    timers: &mut HashMap<Uuid, TimerEntry>,
    job_manager: &Arc<JobManager<S>>,
    persistence: &Arc<dyn PersistencePort>,
) {
    let Some(entry) = timers.get_mut(&id) else { return };
    let now = Utc::now();
    entry.schedule.next_run = entry.cron.after(&now).next();

    let (active, reason) = in_window(&entry.schedule.time_windows, now);
    if !active {
        info!(schedule_id = %id, reason, "scheduled fire skipped");
        let _ = persistence
            .append_execution(ExecutionRecord {
                schedule_id: id,
                job_id: None,
                executed_at: now,
                status: ExecutionStatus::Skipped,
                duration_seconds: None,
                error: None,
            })
            .await;
        return;
    }

    let materialized = entry.schedule.template.materialize_for_schedule(&id.to_string(), now);
    match job_manager.submit_scheduled(materialized, id.to_string()) {
        Ok(job_id) => {
            entry.schedule.run_count += 1;
            entry.schedule.last_run = Some(now);
            entry.schedule.updated_at = now;
            let _ = persistence.save_schedule(entry.schedule.clone()).await;
            spawn_terminal_record_writer(id, job_id, now, job_manager.clone(), persistence.clone());
        }
        Err(e) => {
            error!(schedule_id = %id, error = %e, "scheduled submit failed");
            let _ = persistence
                .append_execution(ExecutionRecord {
                    schedule_id: id,
                    job_id: None,
                    executed_at: now,
                    status: ExecutionStatus::SubmitFailed,
                    duration_seconds: None,
                    error: Some(e.to_string()),
                })
                .await;
        }
    }
}

/// One-shot lifecycle subscriber (per §4.6 item 3): waits for the
/// materialized job's terminal event, then appends the execution record
/// with the outcome and duration. Runs detached from the actor loop so a
/// slow-finishing job never blocks the next tick.
fn spawn_terminal_record_writer<S: Send + Sync + 'static>(
    schedule_id: Uuid,
    job_id: JobId,
    fired_at: chrono::DateTime<Utc>,
    job_manager: Arc<JobManager<S>>,
    persistence: Arc<dyn PersistencePort>,
) {
    tokio::spawn(async move {
        let mut events = job_manager.subscribe();
        loop {
            match events.recv().await {
                Ok(event) if event.job_id == job_id => {
                    let status = match event.event_type {
                        crate::webhook::EventType::JobCompleted => ExecutionStatus::Completed,
                        crate::webhook::EventType::JobFailed => ExecutionStatus::Failed,
                        crate::webhook::EventType::JobCancelled => ExecutionStatus::Cancelled,
                        _ => continue,
                    };
                    let snapshot = job_manager.get(job_id.clone()).ok();
                    let error = snapshot.as_ref().and_then(|s| s.error.clone());
                    let duration_seconds = snapshot.as_ref().and_then(|s| {
                        let completed = s.timestamps.completed_at?;
                        Some((completed - fired_at).num_milliseconds() as f64 / 1000.0)
                    });
                    let _ = persistence
                        .append_execution(ExecutionRecord {
                            schedule_id,
                            job_id: Some(job_id.0),
                            executed_at: Utc::now(),
                            status,
                            duration_seconds,
                            error,
                        })
                        .await;
                    return;
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}
