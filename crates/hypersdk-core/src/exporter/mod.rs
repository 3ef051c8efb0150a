//! Exporter Factory: given a method and the current capability snapshot,
//! produces a stateless Exporter value bound to a discovered binary (or
//! the internal Web client). Concrete per-provider exporters are out of
//! scope; this module defines the narrow port and ships the always-on
//! Web exporter used by tests and as the universal fallback.

use crate::capability::{CapabilityDetector, ExportCapability, ExportMethod};
use crate::error::JobManagerError;
use crate::jobs::job::JobDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Result of a completed export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResult {
    pub files: Vec<String>,
    pub total_size: u64,
}

/// A Progress snapshot, as described in §3 of the data model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub phase: String,
    pub percent_complete: u8,
    pub current_step: String,
    pub bytes_transferred: u64,
    pub files_downloaded: u64,
    pub eta_seconds: Option<u64>,
    pub method: ExportMethod,
}

/// Callback an Exporter invokes with progress snapshots. Must not block;
/// implementations append to a small ring buffer and return immediately.
pub type ProgressSink = std::sync::Arc<dyn Fn(Progress) + Send + Sync>;

/// The narrow interface every concrete export backend implements. No
/// inheritance hierarchy — the Factory freely reinstantiates stateless
/// values that satisfy this trait.
#[async_trait]
pub trait Exporter: Send + Sync {
    fn method(&self) -> ExportMethod;

    fn validate(&self, def: &JobDefinition) -> Result<(), JobManagerError>;

    async fn export(
        &self,
        cancel: CancellationToken,
        def: &JobDefinition,
        progress: ProgressSink,
    ) -> Result<ExportResult, String>;
}

/// The always-available internal exporter. Per-provider backends (CTL,
/// Govc, Ovftool) are implemented by collaborators that bind external
/// binaries; this crate ships only the Web fallback so the Job Manager
/// and its tests have something to run end-to-end.
pub struct WebExporter;

#[async_trait]
impl Exporter for WebExporter {
    fn method(&self) -> ExportMethod {
        ExportMethod::Web
    }

    fn validate(&self, def: &JobDefinition) -> Result<(), JobManagerError> {
        if def.source_vm_id.trim().is_empty() {
            return Err(JobManagerError::Validation("source VM id is empty".into()));
        }
        if def.destination_dir.trim().is_empty() {
            return Err(JobManagerError::Validation(
                "destination directory is empty".into(),
            ));
        }
        Ok(())
    }

    async fn export(
        &self,
        cancel: CancellationToken,
        def: &JobDefinition,
        progress: ProgressSink,
    ) -> Result<ExportResult, String> {
        let steps = [25u8, 50, 75, 100];
        for pct in steps {
            if cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }
            progress(Progress {
                phase: "transfer".to_string(),
                percent_complete: pct,
                current_step: format!("{}.ovf", def.source_vm_id),
                bytes_transferred: (pct as u64) * 10,
                files_downloaded: if pct == 100 { 1 } else { 0 },
                eta_seconds: if pct == 100 { Some(0) } else { Some((100 - pct) as u64) },
                method: ExportMethod::Web,
            });
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(0)) => {}
                _ = cancel.cancelled() => return Err("cancelled".to_string()),
            }
        }
        Ok(ExportResult {
            files: vec![format!("{}.ovf", def.source_vm_id)],
            total_size: 1024,
        })
    }
}

/// Produces Exporter values for a chosen method, honoring the current
/// capability snapshot. Fails with `MethodUnavailable` if the requested
/// method is not available.
pub struct ExporterFactory {
    detector: std::sync::Arc<CapabilityDetector>,
    /// Forces `create` to hand back this exporter for this one method,
    /// bypassing capability detection. Lets a caller run a fixed backend
    /// end-to-end (e.g. a slow or failing double) without requiring the
    /// corresponding binary on PATH.
    override_exporter: Option<(ExportMethod, std::sync::Arc<dyn Exporter>)>,
}

impl ExporterFactory {
    pub fn new(detector: std::sync::Arc<CapabilityDetector>) -> Self {
        Self {
            detector,
            override_exporter: None,
        }
    }

    pub fn with_override(
        detector: std::sync::Arc<CapabilityDetector>,
        method: ExportMethod,
        exporter: std::sync::Arc<dyn Exporter>,
    ) -> Self {
        Self {
            detector,
            override_exporter: Some((method, exporter)),
        }
    }

    pub fn create(&self, method: ExportMethod) -> Result<std::sync::Arc<dyn Exporter>, JobManagerError> {
        if let Some((override_method, exporter)) = &self.override_exporter {
            if *override_method == method {
                return Ok(exporter.clone());
            }
        }
        if !self.detector.is_available(method) {
            return Err(JobManagerError::MethodUnavailable(method));
        }
        match method {
            ExportMethod::Web => Ok(std::sync::Arc::new(WebExporter)),
            // CTL/Govc/Ovftool are collaborator-provided per §1; this
            // factory only vouches for availability, binding the actual
            // process invocation is out of scope for the core.
            other => Err(JobManagerError::MethodUnavailable(other)),
        }
    }

    /// Convenience that uses `CapabilityDetector::best_method`.
    pub fn default_exporter(&self) -> Result<std::sync::Arc<dyn Exporter>, JobManagerError> {
        self.create(self.detector.best_method())
    }

    pub fn snapshot(&self) -> Vec<ExportCapability> {
        self.detector.snapshot()
    }

    pub fn best_method(&self) -> ExportMethod {
        self.detector.best_method()
    }
}
