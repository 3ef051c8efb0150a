//! Capability Detector: discovers which export backends this host can run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::RwLock;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Export backend tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExportMethod {
    Ctl,
    Govc,
    Ovftool,
    Web,
}

impl ExportMethod {
    pub const ALL: [ExportMethod; 4] = [
        ExportMethod::Ctl,
        ExportMethod::Govc,
        ExportMethod::Ovftool,
        ExportMethod::Web,
    ];

    /// The binary name looked up on PATH for this method, or `None` for
    /// methods that are internal (no external process).
    fn binary_name(self) -> Option<&'static str> {
        match self {
            ExportMethod::Ctl => Some("vmctl"),
            ExportMethod::Govc => Some("govc"),
            ExportMethod::Ovftool => Some("ovftool"),
            ExportMethod::Web => None,
        }
    }

    /// Smaller is preferred.
    fn priority(self) -> u8 {
        match self {
            ExportMethod::Ctl => 1,
            ExportMethod::Govc => 2,
            ExportMethod::Ovftool => 3,
            ExportMethod::Web => 4,
        }
    }
}

/// A runtime-discovered fact about one export method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportCapability {
    pub method: ExportMethod,
    pub available: bool,
    pub version: String,
    pub binary_path: String,
    pub priority: u8,
    pub last_checked: DateTime<Utc>,
}

/// Discovers and caches which export backends are usable on this host.
pub struct CapabilityDetector {
    snapshot: RwLock<HashMap<ExportMethod, ExportCapability>>,
}

impl Default for CapabilityDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityDetector {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(HashMap::new()),
        }
    }

    /// Concurrently probes each backend with `deadline` per probe, then
    /// atomically replaces the internal map. Idempotent: re-detection
    /// updates `last_checked` and overwrites prior results.
    pub async fn detect(&self, deadline: Duration) {
        let probes = ExportMethod::ALL.map(|method| probe(method, deadline));
        let results = futures::future::join_all(probes).await;

        let mut map = HashMap::new();
        for cap in results {
            map.insert(cap.method, cap);
        }
        *self.snapshot.write().expect("capability lock poisoned") = map;
        debug!("capability detection complete");
    }

    /// Returns a copy so callers cannot mutate the live map.
    pub fn snapshot(&self) -> Vec<ExportCapability> {
        self.snapshot
            .read()
            .expect("capability lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn is_available(&self, method: ExportMethod) -> bool {
        if method == ExportMethod::Web {
            return true;
        }
        self.snapshot
            .read()
            .expect("capability lock poisoned")
            .get(&method)
            .map(|c| c.available)
            .unwrap_or(false)
    }

    /// The available method with the smallest priority number, or `Web`
    /// if none are available.
    pub fn best_method(&self) -> ExportMethod {
        let guard = self.snapshot.read().expect("capability lock poisoned");
        guard
            .values()
            .filter(|c| c.available)
            .min_by_key(|c| c.priority)
            .map(|c| c.method)
            .unwrap_or(ExportMethod::Web)
    }
}

async fn probe(method: ExportMethod, deadline: Duration) -> ExportCapability {
    let now = Utc::now();
    if method == ExportMethod::Web {
        return ExportCapability {
            method,
            available: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
            binary_path: "internal".to_string(),
            priority: method.priority(),
            last_checked: now,
        };
    }

    let Some(binary) = method.binary_name() else {
        return ExportCapability {
            method,
            available: false,
            version: String::new(),
            binary_path: String::new(),
            priority: method.priority(),
            last_checked: now,
        };
    };

    let Ok(path) = which::which(binary) else {
        return ExportCapability {
            method,
            available: false,
            version: String::new(),
            binary_path: String::new(),
            priority: method.priority(),
            last_checked: now,
        };
    };

    let path_str = path.display().to_string();
    let version = match timeout(
        deadline,
        Command::new(&path)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output(),
    )
    .await
    {
        Ok(Ok(output)) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        Ok(Ok(_)) | Ok(Err(_)) => {
            warn!(binary = binary, "version probe failed, binary exists");
            "unknown".to_string()
        }
        Err(_) => {
            warn!(binary = binary, "version probe timed out");
            "unknown".to_string()
        }
    };

    ExportCapability {
        method,
        available: true,
        version,
        binary_path: path_str,
        priority: method.priority(),
        last_checked: now,
    }
}
