//! Shared vocabulary for machine and provider lifecycle status.
//!
//! Two distinct computations live here and must stay separate: the
//! per-machine status derived from one record's raw flags, and the
//! aggregate provider status summarizing a whole snapshot. Unifying them
//! would be a functional change, not a cleanup — a machine that is both
//! `running` and `starting` is per-machine `starting` yet contributes
//! nothing to the aggregate `ready` arm.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::inventory::MachineRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    Unknown,
    Installed,
    Configuring,
    Configured,
    Starting,
    Started,
    Ready,
    Stopped,
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleStatus::Unknown => "unknown",
            LifecycleStatus::Installed => "installed",
            LifecycleStatus::Configuring => "configuring",
            LifecycleStatus::Configured => "configured",
            LifecycleStatus::Starting => "starting",
            LifecycleStatus::Started => "started",
            LifecycleStatus::Ready => "ready",
            LifecycleStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Per-machine status from the record's raw flags. `starting` wins over
/// everything, then `running`. Total over all boolean pairs.
pub fn machine_status(running: bool, starting: bool) -> LifecycleStatus {
    if starting {
        LifecycleStatus::Starting
    } else if running {
        LifecycleStatus::Started
    } else {
        LifecycleStatus::Stopped
    }
}

/// Aggregate provider status over a whole snapshot.
pub fn aggregate_status(records: &[MachineRecord]) -> LifecycleStatus {
    if records.iter().any(|r| r.running && !r.starting) {
        LifecycleStatus::Ready
    } else if records.iter().any(|r| r.starting) {
        LifecycleStatus::Starting
    } else if !records.is_empty() {
        LifecycleStatus::Configured
    } else {
        LifecycleStatus::Installed
    }
}

// ── Provider ─────────────────────────────────────────────

/// Provider-wide status cell shared between the reconciler, lifecycle
/// operations, and anything watching the aggregate.
#[derive(Clone)]
pub struct Provider {
    status: Arc<Mutex<LifecycleStatus>>,
    aggregate_enabled: bool,
}

impl Provider {
    pub fn new(aggregate_enabled: bool) -> Self {
        Self {
            status: Arc::new(Mutex::new(LifecycleStatus::Unknown)),
            aggregate_enabled,
        }
    }

    /// Aggregate recomputation only runs where machines are mandatory
    /// infrastructure. On Linux the tool's machines are optional, so the
    /// snapshot says nothing about provider health there.
    pub fn platform_default() -> Self {
        Self::new(cfg!(any(target_os = "macos", target_os = "windows")))
    }

    pub fn status(&self) -> LifecycleStatus {
        *self.status.lock().unwrap()
    }

    /// Explicit status set by an operation or an external actor.
    pub fn set_status(&self, status: LifecycleStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Recompute the aggregate from a snapshot. Skipped entirely when the
    /// platform excludes aggregate computation, and never downgrades an
    /// explicit `configuring`.
    pub fn apply_aggregate(&self, records: &[MachineRecord]) {
        if !self.aggregate_enabled {
            return;
        }
        let mut status = self.status.lock().unwrap();
        if *status == LifecycleStatus::Configuring {
            return;
        }
        *status = aggregate_status(records);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(identity: &str, running: bool, starting: bool) -> MachineRecord {
        MachineRecord {
            identity: identity.into(),
            cpus: 2,
            memory_bytes: 0,
            disk_bytes: 0,
            port: 22,
            remote_username: "core".into(),
            identity_path: "/tmp/key".into(),
            running,
            starting,
        }
    }

    #[test]
    fn machine_status_is_total() {
        assert_eq!(machine_status(false, false), LifecycleStatus::Stopped);
        assert_eq!(machine_status(true, false), LifecycleStatus::Started);
        assert_eq!(machine_status(false, true), LifecycleStatus::Starting);
        // starting wins even when the tool also reports running
        assert_eq!(machine_status(true, true), LifecycleStatus::Starting);
    }

    #[test]
    fn aggregate_ready_requires_running_not_starting() {
        let snapshot = [record("a", true, false), record("b", false, true)];
        assert_eq!(aggregate_status(&snapshot), LifecycleStatus::Ready);

        // running && starting does not satisfy the ready arm
        let snapshot = [record("a", true, true)];
        assert_eq!(aggregate_status(&snapshot), LifecycleStatus::Starting);
    }

    #[test]
    fn aggregate_fallthrough() {
        assert_eq!(
            aggregate_status(&[record("a", false, false)]),
            LifecycleStatus::Configured
        );
        assert_eq!(aggregate_status(&[]), LifecycleStatus::Installed);
    }

    #[test]
    fn provider_gate_skips_aggregate() {
        let provider = Provider::new(false);
        provider.set_status(LifecycleStatus::Started);
        provider.apply_aggregate(&[]);
        assert_eq!(provider.status(), LifecycleStatus::Started);
    }

    #[test]
    fn provider_applies_aggregate_when_enabled() {
        let provider = Provider::new(true);
        provider.apply_aggregate(&[record("a", true, false)]);
        assert_eq!(provider.status(), LifecycleStatus::Ready);
        provider.apply_aggregate(&[]);
        assert_eq!(provider.status(), LifecycleStatus::Installed);
    }

    #[test]
    fn explicit_configuring_is_preserved() {
        let provider = Provider::new(true);
        provider.set_status(LifecycleStatus::Configuring);
        provider.apply_aggregate(&[record("a", true, false)]);
        assert_eq!(provider.status(), LifecycleStatus::Configuring);
    }
}
