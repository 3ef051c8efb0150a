//! hypersdk-core: the job orchestration core for VM export, conversion,
//! and backup jobs. Owns the Job Manager, Cron Scheduler, Capability
//! Detector, Exporter Factory, Connection Pool, Webhook Notifier, and
//! the persistence and time-window ports they depend on.
//!
//! Everything outside this crate — the per-provider export tooling, the
//! HTTP/CLI shell, the row store backing the Persistence Port — is a
//! collaborator's concern. This crate exposes functional ports, not
//! wire formats.

pub mod capability;
pub mod config;
pub mod error;
pub mod exporter;
pub mod jobs;
pub mod persistence;
pub mod pool;
pub mod scheduler;
pub mod time_window;
pub mod webhook;

pub use error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_available() {
        assert!(!VERSION.is_empty());
    }
}
