//! Machine inventory: `list` invocation and parsing.
//!
//! The reader never raises. A failed invocation or an unparseable payload
//! degrades to an empty snapshot plus a soft-error string, so a single bad
//! poll can never abort the reconciliation loop around it.

use std::path::PathBuf;
use std::sync::Arc;

use crate::runner::{CommandRunner, RunOptions};

/// One observed machine, keyed by `identity` across all registry maps.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineRecord {
    pub identity: String,
    pub cpus: u64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub port: u16,
    pub remote_username: String,
    pub identity_path: PathBuf,
    /// Raw flags from the tool. Not mutually exclusive: a machine mid-boot
    /// reports both `running` and `starting`.
    pub running: bool,
    pub starting: bool,
}

// ── Wire format ──────────────────────────────────────────

/// One entry of the tool's `list` JSON array.
#[derive(Debug, Default, facet::Facet)]
#[facet(default)]
struct ListEntry {
    #[facet(default)]
    name: String,
    #[facet(default)]
    cpus: u64,
    #[facet(default)]
    memory: u64,
    #[facet(default)]
    disk_size: u64,
    #[facet(default)]
    port: u16,
    #[facet(default)]
    remote_username: String,
    #[facet(default)]
    identity_path: String,
    #[facet(default)]
    running: bool,
    #[facet(default)]
    starting: bool,
}

impl From<ListEntry> for MachineRecord {
    fn from(entry: ListEntry) -> Self {
        Self {
            identity: entry.name,
            cpus: entry.cpus,
            memory_bytes: entry.memory,
            disk_bytes: entry.disk_size,
            port: entry.port,
            remote_username: entry.remote_username,
            identity_path: PathBuf::from(entry.identity_path),
            running: entry.running,
            starting: entry.starting,
        }
    }
}

// ── Reader ───────────────────────────────────────────────

pub struct InventoryReader<R: CommandRunner> {
    runner: Arc<R>,
}

impl<R: CommandRunner> InventoryReader<R> {
    pub fn new(runner: Arc<R>) -> Self {
        Self { runner }
    }

    /// Poll the tool for the current machine set.
    ///
    /// Returns the parsed records and, when anything went wrong, a
    /// soft-error string carrying the stringified cause. The two are
    /// mutually exclusive in practice but both halves are always valid:
    /// callers use whatever records came back.
    pub async fn read(&self) -> (Vec<MachineRecord>, Option<String>) {
        let output = match self
            .runner
            .execute(&["list".into()], RunOptions::default())
            .await
        {
            Ok(output) => output,
            Err(e) => return (Vec::new(), Some(e.to_string())),
        };

        match facet_json::from_str::<Vec<ListEntry>>(&output.stdout) {
            Ok(entries) => (entries.into_iter().map(MachineRecord::from).collect(), None),
            Err(e) => (
                Vec::new(),
                Some(format!("failed to parse machine list: {e}")),
            ),
        }
    }
}
