//! The Job Manager: accepts job definitions, runs them through a bounded
//! worker pool, publishes progress, and handles cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::JobManagerError;
use crate::exporter::{ExporterFactory, Progress, ProgressSink};
use crate::jobs::job::{Job, JobDefinition, JobId, JobSnapshot, JobStatus};
use crate::pool::ConnectionPool;
use crate::webhook::{Event, EventType, WebhookNotifier};

/// A lifecycle or progress event observed by a subscriber. Carries the
/// same semantic envelope the Webhook Notifier publishes, so both ports
/// agree on vocabulary.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub job_id: JobId,
    pub event_type: EventType,
    pub progress: Option<Progress>,
}

#[derive(Debug, Default, Clone)]
pub struct JobQuery {
    pub ids: Option<Vec<JobId>>,
    pub statuses: Option<Vec<JobStatus>>,
    pub limit: Option<usize>,
    /// When true, `limit` is ignored and every matching job is returned.
    /// Exists so a caller can explicitly ask for the unbounded view
    /// rather than relying on an absent `limit` to mean the same thing.
    pub all: bool,
}

pub struct SubmitBatchResult {
    pub accepted: Vec<JobId>,
    pub rejected: Vec<(Option<JobId>, JobManagerError)>,
}

struct DebounceState {
    last_emit: Option<Instant>,
    last_phase: Option<String>,
}

struct JobEntry {
    job: Job,
    debounce: DebounceState,
}

/// The core state machine. Generic over the pooled session type so it
/// can be wired to whatever hypervisor client a collaborator supplies;
/// tests instantiate it with `()`» when no pooling is needed.
pub struct JobManager<S: Send + Sync + 'static = ()> {
    jobs: Arc<DashMap<JobId, JobEntry>>,
    pending_tx: mpsc::Sender<JobId>,
    queue_capacity: usize,
    exporter_factory: Arc<ExporterFactory>,
    pool: Option<Arc<ConnectionPool<S>>>,
    webhook: Option<Arc<WebhookNotifier>>,
    events_tx: broadcast::Sender<LifecycleEvent>,
    debounce_interval: Duration,
    cancel_deadline: Duration,
    lifetime_token: CancellationToken,
    recent_order: Arc<std::sync::Mutex<std::collections::VecDeque<JobId>>>,
    recent_capacity: usize,
    queued_count: Arc<AtomicUsize>,
}

impl<S: Send + Sync + 'static> JobManager<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_count: usize,
        queue_capacity: usize,
        debounce_interval: Duration,
        cancel_deadline: Duration,
        recent_capacity: usize,
        exporter_factory: Arc<ExporterFactory>,
        pool: Option<Arc<ConnectionPool<S>>>,
        webhook: Option<Arc<WebhookNotifier>>,
    ) -> Arc<Self> {
        let (pending_tx, pending_rx) = mpsc::channel(queue_capacity);
        let (events_tx, _events_rx) = broadcast::channel(1024);

        let manager = Arc::new(Self {
            jobs: Arc::new(DashMap::new()),
            pending_tx,
            queue_capacity,
            exporter_factory,
            pool,
            webhook,
            events_tx,
            debounce_interval,
            cancel_deadline,
            lifetime_token: CancellationToken::new(),
            recent_order: Arc::new(std::sync::Mutex::new(std::collections::VecDeque::new())),
            recent_capacity,
            queued_count: Arc::new(AtomicUsize::new(0)),
        });

        manager.clone().spawn_workers(worker_count, pending_rx);
        manager
    }

    /// Each worker loop is a long-lived task that must survive a single
    /// job panicking. The actual export runs on its own spawned task so a
    /// panic surfaces as a `JoinError` here instead of unwinding the loop
    /// itself; the job is marked Fatal and the worker goes right back to
    /// `recv()` for the next one.
    fn spawn_workers(self: Arc<Self>, worker_count: usize, pending_rx: mpsc::Receiver<JobId>) {
        let pending_rx = Arc::new(tokio::sync::Mutex::new(pending_rx));
        for worker_id in 0..worker_count {
            let manager = self.clone();
            let pending_rx = pending_rx.clone();
            tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = pending_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job_id) = next else {
                        debug!(worker_id, "pending queue closed, worker exiting");
                        break;
                    };
                    manager.queued_count.fetch_sub(1, Ordering::SeqCst);

                    let task_manager = manager.clone();
                    let task_job_id = job_id.clone();
                    let handle = tokio::spawn(async move { task_manager.run_job(task_job_id).await });
                    if let Err(join_err) = handle.await {
                        if join_err.is_panic() {
                            let payload = join_err.into_panic();
                            let message = panic_payload_message(payload);
                            error!(worker_id, job_id = %job_id, panic = %message, "worker job panicked, recovering worker");
                            manager.finish_failed(job_id, format!("panic: {message}")).await;
                        } else {
                            debug!(worker_id, job_id = %job_id, "job task was cancelled");
                        }
                    }
                }
            });
        }
    }

    /// Assigns an id if absent, validates, stores the Job pending, and
    /// enqueues it for execution. The duplicate-id check and the insert
    /// itself happen as a single atomic `DashMap::entry` operation so two
    /// concurrent callers racing on the same caller-supplied id can never
    /// both win: the loser always observes `Duplicate`, never a silent
    /// overwrite of the winner's `Job`.
    pub fn submit(&self, mut def: JobDefinition) -> Result<JobId, JobManagerError> {
        let id = def.id.clone().unwrap_or_else(JobId::new);
        def.id = Some(id.clone());

        if self.jobs.contains_key(&id) {
            return Err(JobManagerError::Duplicate(id));
        }
        if def.source_vm_id.trim().is_empty() {
            return Err(JobManagerError::Validation("source VM id is empty".into()));
        }
        if def.destination_dir.trim().is_empty() {
            return Err(JobManagerError::Validation("destination directory is empty".into()));
        }
        let method = def.method.unwrap_or_else(|| self.exporter_factory.best_method());
        let exporter = self.exporter_factory.create(method)?;
        exporter.validate(&def)?;

        if self.queued_count.load(Ordering::SeqCst) >= self.queue_capacity {
            return Err(JobManagerError::QueueFull {
                capacity: self.queue_capacity,
            });
        }

        let mut job = Job::new_pending(def, None);
        job.push_log("job submitted");
        let entry = JobEntry {
            job,
            debounce: DebounceState {
                last_emit: None,
                last_phase: None,
            },
        };
        match self.jobs.entry(id.clone()) {
            Entry::Occupied(_) => return Err(JobManagerError::Duplicate(id)),
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
        self.track_recent(id.clone());

        self.queued_count.fetch_add(1, Ordering::SeqCst);
        if self.pending_tx.try_send(id.clone()).is_err() {
            self.queued_count.fetch_sub(1, Ordering::SeqCst);
            self.jobs.remove(&id);
            return Err(JobManagerError::QueueFull {
                capacity: self.queue_capacity,
            });
        }

        self.publish(id.clone(), EventType::JobCreated, None);
        Ok(id)
    }

    /// Submits a job that originated from a ScheduledJob fire, tagging it
    /// so terminal transitions are known to warrant an ExecutionRecord.
    pub fn submit_scheduled(&self, def: JobDefinition, schedule_id: String) -> Result<JobId, JobManagerError> {
        let id = self.submit(def)?;
        if let Some(mut entry) = self.jobs.get_mut(&id) {
            entry.job.schedule_id = Some(schedule_id);
        }
        Ok(id)
    }

    pub fn submit_batch(&self, defs: Vec<JobDefinition>) -> SubmitBatchResult {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for def in defs {
            let id = def.id.clone();
            match self.submit(def) {
                Ok(job_id) => accepted.push(job_id),
                Err(e) => rejected.push((id, e)),
            }
        }
        SubmitBatchResult { accepted, rejected }
    }

    pub fn get(&self, id: JobId) -> Result<JobSnapshot, JobManagerError> {
        self.jobs
            .get(&id)
            .map(|entry| entry.job.snapshot())
            .ok_or_else(|| JobManagerError::NotFound(id))
    }

    /// Returns the accumulated log buffer for a job as newline-joined text.
    pub fn logs(&self, id: JobId) -> Result<String, JobManagerError> {
        self.jobs
            .get(&id)
            .map(|entry| entry.job.logs.join("\n"))
            .ok_or_else(|| JobManagerError::NotFound(id))
    }

    pub fn query(&self, query: &JobQuery) -> Vec<JobSnapshot> {
        let mut results: Vec<JobSnapshot> = self
            .jobs
            .iter()
            .filter(|entry| {
                if let Some(ids) = &query.ids {
                    if !ids.contains(entry.key()) {
                        return false;
                    }
                }
                if let Some(statuses) = &query.statuses {
                    if !statuses.contains(&entry.job.status) {
                        return false;
                    }
                }
                true
            })
            .map(|entry| entry.job.snapshot())
            .collect();

        results.sort_by(|a, b| {
            b.timestamps
                .updated_at
                .unwrap_or(b.timestamps.submitted_at.unwrap_or_default())
                .cmp(&a.timestamps.updated_at.unwrap_or(a.timestamps.submitted_at.unwrap_or_default()))
        });
        if !query.all {
            if let Some(limit) = query.limit {
                results.truncate(limit);
            }
        }
        results
    }

    /// If running, signals cancellation and waits (bounded) for the
    /// worker to acknowledge; if pending, transitions directly to
    /// cancelled.
    pub async fn cancel(&self, id: JobId) -> Result<(), JobManagerError> {
        let (token, status) = {
            let entry = self.jobs.get(&id).ok_or_else(|| JobManagerError::NotFound(id.clone()))?;
            (entry.job.cancel_token.clone(), entry.job.status)
        };

        if status.is_terminal() {
            return Err(JobManagerError::AlreadyTerminal(id));
        }

        if status == JobStatus::Pending {
            if let Some(mut entry) = self.jobs.get_mut(&id) {
                entry.job.status = JobStatus::Cancelled;
                entry.job.timestamps.completed_at = Some(Utc::now());
                entry.job.timestamps.updated_at = Some(Utc::now());
                entry.job.push_log("cancelled while pending");
            }
            self.publish(id, EventType::JobCancelled, None);
            return Ok(());
        }

        if let Some(token) = token {
            token.cancel();
        }

        let deadline = self.cancel_deadline;
        let jobs = self.jobs.clone();
        let _ = tokio::time::timeout(deadline, async move {
            loop {
                if let Some(entry) = jobs.get(&id) {
                    if entry.job.status.is_terminal() {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;

        Ok(())
    }

    pub fn progress(&self, id: JobId) -> Result<Progress, JobManagerError> {
        self.jobs
            .get(&id)
            .map(|entry| entry.job.progress.clone())
            .ok_or(JobManagerError::NotFound(id))
    }

    pub fn eta(&self, id: JobId) -> Result<Option<u64>, JobManagerError> {
        self.jobs
            .get(&id)
            .map(|entry| entry.job.progress.eta_seconds)
            .ok_or(JobManagerError::NotFound(id))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events_tx.subscribe()
    }

    /// Signals the lifetime token, which every running Exporter observes
    /// at its next I/O boundary.
    pub fn shutdown(&self) {
        self.lifetime_token.cancel();
    }

    fn track_recent(&self, id: JobId) {
        let mut recent = self.recent_order.lock().expect("recent-order lock poisoned");
        recent.push_back(id);
        while recent.len() > self.recent_capacity {
            recent.pop_front();
        }
    }

    fn publish(&self, job_id: JobId, event_type: EventType, progress: Option<Progress>) {
        let _ = self.events_tx.send(LifecycleEvent {
            job_id: job_id.clone(),
            event_type,
            progress: progress.clone(),
        });
        if let Some(webhook) = &self.webhook {
            let job_id_str = job_id.0;
            webhook.publish(Event {
                event_type,
                job_id: job_id_str.clone(),
                timestamp: Utc::now(),
                payload: serde_json::json!({ "job_id": job_id_str }),
            });
        }
    }

    async fn run_job(self: Arc<Self>, id: JobId) {
        let (def, token) = {
            let Some(mut entry) = self.jobs.get_mut(&id) else { return };
            if entry.job.status != JobStatus::Pending {
                return;
            }
            let token = self.lifetime_token.child_token();
            entry.job.status = JobStatus::Running;
            entry.job.timestamps.started_at = Some(Utc::now());
            entry.job.timestamps.updated_at = Some(Utc::now());
            entry.job.cancel_token = Some(token.clone());
            entry.job.push_log("job started");
            (entry.job.definition.clone(), token)
        };
        self.publish(id.clone(), EventType::JobStarted, None);

        let method = def.method.unwrap_or_else(|| self.exporter_factory.best_method());
        let exporter = match self.exporter_factory.create(method) {
            Ok(exporter) => exporter,
            Err(e) => {
                self.finish_failed(id, e.to_string()).await;
                return;
            }
        };

        let pool_entry = if let Some(pool) = &self.pool {
            match pool.acquire(token.clone()).await {
                Ok(entry) => Some(entry),
                Err(e) => {
                    self.finish_failed(id, e.to_string()).await;
                    return;
                }
            }
        } else {
            None
        };

        let progress_sink: ProgressSink = {
            let manager = self.clone();
            let sink_id = id.clone();
            std::sync::Arc::new(move |p: Progress| manager.on_progress(sink_id.clone(), p))
        };

        let result = exporter.export(token.clone(), &def, progress_sink).await;

        if let Some(pool) = &self.pool {
            if let Some(entry) = pool_entry {
                pool.release(entry, result.is_ok()).await;
            }
        }

        match result {
            Ok(export_result) => self.finish_completed(id, export_result).await,
            Err(_) if token.is_cancelled() => self.finish_cancelled(id).await,
            Err(message) => self.finish_failed(id, message).await,
        }
    }

    fn on_progress(&self, id: JobId, p: Progress) {
        let Some(mut entry) = self.jobs.get_mut(&id) else { return };
        entry.job.progress = p.clone();
        entry.job.timestamps.updated_at = Some(Utc::now());

        let phase_changed = entry.debounce.last_phase.as_deref() != Some(p.phase.as_str());
        let elapsed_ok = entry
            .debounce
            .last_emit
            .map(|t| t.elapsed() >= self.debounce_interval)
            .unwrap_or(true);

        if phase_changed || elapsed_ok {
            entry.debounce.last_emit = Some(Instant::now());
            entry.debounce.last_phase = Some(p.phase.clone());
            drop(entry);
            self.publish(id, EventType::JobProgress, Some(p));
        }
    }

    async fn finish_completed(&self, id: JobId, result: crate::exporter::ExportResult) {
        {
            let Some(mut entry) = self.jobs.get_mut(&id) else { return };
            entry.job.status = JobStatus::Completed;
            entry.job.result = Some(result);
            entry.job.cancel_token = None;
            let now = Utc::now();
            entry.job.timestamps.completed_at = Some(now);
            entry.job.timestamps.updated_at = Some(now);
            entry.job.push_log("job completed");
        }
        info!(job_id = %id, "job completed");
        self.publish(id, EventType::JobCompleted, None);
    }

    async fn finish_failed(&self, id: JobId, message: String) {
        let Some(mut entry) = self.jobs.get_mut(&id) else { return };
        entry.job.status = JobStatus::Failed;
        entry.job.error = Some(message.clone());
        entry.job.cancel_token = None;
        let now = Utc::now();
        entry.job.timestamps.completed_at = Some(now);
        entry.job.timestamps.updated_at = Some(now);
        entry.job.push_log(format!("job failed: {message}"));
        drop(entry);
        warn!(job_id = %id, error = %message, "job failed");
        self.publish(id, EventType::JobFailed, None);
    }

    async fn finish_cancelled(&self, id: JobId) {
        let Some(mut entry) = self.jobs.get_mut(&id) else { return };
        entry.job.status = JobStatus::Cancelled;
        entry.job.cancel_token = None;
        let now = Utc::now();
        entry.job.timestamps.completed_at = Some(now);
        entry.job.timestamps.updated_at = Some(now);
        entry.job.push_log("job cancelled");
        drop(entry);
        self.publish(id, EventType::JobCancelled, None);
    }
}

/// Best-effort extraction of a panic's message from the `Box<dyn Any>`
/// payload `JoinError::into_panic` hands back. Panics via `panic!("{}", x)`
/// or a bare string literal cover the overwhelming majority of cases.
fn panic_payload_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityDetector;

    fn factory() -> Arc<ExporterFactory> {
        let detector = Arc::new(CapabilityDetector::new());
        Arc::new(ExporterFactory::new(detector))
    }

    /// An exporter that blocks until cancelled or until `export` has run
    /// for a long time, used to exercise cancellation through the real
    /// submit/cancel path instead of racing against `WebExporter`'s
    /// handful of zero-duration steps.
    struct SlowExporter;

    #[async_trait::async_trait]
    impl crate::exporter::Exporter for SlowExporter {
        fn method(&self) -> crate::capability::ExportMethod {
            crate::capability::ExportMethod::Web
        }

        fn validate(&self, _def: &JobDefinition) -> Result<(), JobManagerError> {
            Ok(())
        }

        async fn export(
            &self,
            cancel: CancellationToken,
            _def: &JobDefinition,
            progress: crate::exporter::ProgressSink,
        ) -> Result<crate::exporter::ExportResult, String> {
            progress(Progress {
                phase: "transfer".into(),
                percent_complete: 10,
                current_step: "copying".into(),
                bytes_transferred: 0,
                files_downloaded: 0,
                eta_seconds: Some(30),
                method: crate::capability::ExportMethod::Web,
            });
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(crate::exporter::ExportResult {
                    files: vec!["full.ovf".into()],
                    total_size: 4096,
                }),
                _ = cancel.cancelled() => Err("cancelled".to_string()),
            }
        }
    }

    fn factory_with_slow_exporter() -> Arc<ExporterFactory> {
        let detector = Arc::new(CapabilityDetector::new());
        Arc::new(ExporterFactory::with_override(
            detector,
            crate::capability::ExportMethod::Web,
            Arc::new(SlowExporter),
        ))
    }

    #[tokio::test]
    async fn submit_rejects_empty_vm_id() {
        let manager: Arc<JobManager> = JobManager::new(
            2,
            8,
            Duration::from_millis(250),
            Duration::from_secs(30),
            32,
            factory(),
            None,
            None,
        );
        let def = JobDefinition::new("", "bad", "/out");
        let result = manager.submit(def);
        assert!(matches!(result, Err(JobManagerError::Validation(_))));
    }

    #[tokio::test]
    async fn happy_path_completes_with_four_progress_events() {
        let manager: Arc<JobManager> = JobManager::new(
            2,
            8,
            Duration::from_millis(0),
            Duration::from_secs(30),
            32,
            factory(),
            None,
            None,
        );
        let mut rx = manager.subscribe();
        let id = manager.submit(JobDefinition::new("vm-a", "nightly", "/out")).unwrap();

        let mut progress_count = 0;
        let mut completed = false;
        for _ in 0..20 {
            if let Ok(event) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                let event = event.unwrap();
                if event.job_id != id {
                    continue;
                }
                match event.event_type {
                    EventType::JobProgress => progress_count += 1,
                    EventType::JobCompleted => {
                        completed = true;
                        break;
                    }
                    _ => {}
                }
            } else {
                break;
            }
        }

        assert!(completed);
        assert_eq!(progress_count, 4);
        let snapshot = manager.get(id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.result.unwrap().total_size, 1024);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let manager: Arc<JobManager> = JobManager::new(
            2,
            8,
            Duration::from_millis(250),
            Duration::from_secs(30),
            32,
            factory(),
            None,
            None,
        );
        let mut def = JobDefinition::new("vm-a", "nightly", "/out");
        def.id = Some(JobId::new());
        manager.submit(def.clone()).unwrap();
        assert!(matches!(manager.submit(def), Err(JobManagerError::Duplicate(_))));
    }

    #[tokio::test]
    async fn queue_full_is_reported() {
        let manager: Arc<JobManager> = JobManager::new(
            0,
            1,
            Duration::from_millis(250),
            Duration::from_secs(30),
            32,
            factory(),
            None,
            None,
        );
        manager.submit(JobDefinition::new("vm-a", "a", "/out")).unwrap();
        let result = manager.submit(JobDefinition::new("vm-b", "b", "/out"));
        assert!(matches!(result, Err(JobManagerError::QueueFull { .. })));
    }

    #[tokio::test]
    async fn cancel_of_a_running_job_resolves_within_30s_with_cancelled_last() {
        let manager: Arc<JobManager> = JobManager::new(
            2,
            8,
            Duration::from_millis(0),
            Duration::from_secs(30),
            32,
            factory_with_slow_exporter(),
            None,
            None,
        );
        let mut rx = manager.subscribe();
        let id = manager.submit(JobDefinition::new("vm-a", "nightly", "/out")).unwrap();

        // Wait for the job to actually start running before cancelling,
        // so this exercises the running-job cancel path, not the
        // pending-job fast path.
        loop {
            if manager.get(id.clone()).unwrap().status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let cancelled = tokio::time::timeout(Duration::from_secs(30), manager.cancel(id.clone())).await;
        assert!(cancelled.is_ok(), "cancel did not resolve within 30s");
        cancelled.unwrap().unwrap();

        assert_eq!(manager.get(id.clone()).unwrap().status, JobStatus::Cancelled);

        let mut last_event_for_job = None;
        let mut saw_completed = false;
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
            if event.job_id != id {
                continue;
            }
            if event.event_type == EventType::JobCompleted {
                saw_completed = true;
            }
            last_event_for_job = Some(event.event_type);
        }

        assert!(!saw_completed, "a cancelled job must never emit job.completed");
        assert_eq!(last_event_for_job, Some(EventType::JobCancelled));
    }
}
