//! Machine lifecycle operations: init, start, stop, rm.
//!
//! Each operation is a self-contained async call into the machine tool,
//! forwarding the caller's [`RunOptions`] (cancellation token and output
//! sink). Start, stop, and create raise the normalized form of a tool
//! failure; rm propagates the raw runner error.

use crate::config::CreateDefaults;
use crate::error::{CorralError, RunError};
use crate::runner::{CommandRunner, RunOptions};
use crate::status::{LifecycleStatus, Provider};
use crate::util;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

// ── Error normalization ──────────────────────────────────

/// Fold a runner failure into a single human-readable string: whichever of
/// name, message, and stderr are present, each on its own line, in that
/// order. A failure carrying none of them is passed through unchanged.
pub fn normalize(err: RunError) -> CorralError {
    let mut details = String::new();
    for part in [&err.name, &err.message, &err.stderr] {
        if let Some(part) = part {
            details.push_str(part);
            details.push('\n');
        }
    }
    if details.is_empty() {
        CorralError::Run(err)
    } else {
        CorralError::Machine { details }
    }
}

// ── Create ───────────────────────────────────────────────

/// Inputs for `init`. Absent fields emit no flag at all — the tool's own
/// defaults apply, never a placeholder value.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub name: Option<String>,
    pub cpus: Option<u64>,
    /// Requested memory in bytes.
    pub memory_bytes: Option<u64>,
    /// Requested disk size in bytes.
    pub disk_bytes: Option<u64>,
}

/// Memory flag value: MiB, rounded up to the nearest even MiB. The
/// virtualization backend only accepts even-MiB increments.
fn memory_mib(bytes: u64) -> u64 {
    let mib = bytes.div_ceil(MIB);
    mib + (mib & 1)
}

/// Disk flag value: whole GiB, rounded up.
fn disk_gib(bytes: u64) -> u64 {
    bytes.div_ceil(GIB)
}

/// Fill the gaps in the user's `init` inputs from the configured defaults.
/// Every field falls back independently, the name included, and size
/// strings are parsed after merging so a bad configured default is caught
/// even when the flag was omitted.
pub fn resolve_create_options(
    defaults: &CreateDefaults,
    name: Option<String>,
    cpus: Option<u64>,
    memory: Option<String>,
    disk_size: Option<String>,
) -> Result<CreateOptions, CorralError> {
    let memory = memory.or_else(|| defaults.memory.clone());
    let disk_size = disk_size.or_else(|| defaults.disk_size.clone());

    Ok(CreateOptions {
        name: name.or_else(|| defaults.name.clone()),
        cpus: cpus.or(defaults.cpus),
        memory_bytes: memory.as_deref().map(util::parse_size).transpose()?,
        disk_bytes: disk_size.as_deref().map(util::parse_size).transpose()?,
    })
}

pub fn build_init_args(opts: &CreateOptions) -> Vec<String> {
    let mut args = vec!["init".to_string()];
    if let Some(cpus) = opts.cpus {
        args.push("--cpus".into());
        args.push(cpus.to_string());
    }
    if let Some(bytes) = opts.memory_bytes {
        args.push("--memory".into());
        args.push(memory_mib(bytes).to_string());
    }
    if let Some(bytes) = opts.disk_bytes {
        args.push("--disk-size".into());
        args.push(disk_gib(bytes).to_string());
    }
    if let Some(name) = &opts.name {
        args.push(name.clone());
    }
    args
}

/// Create a new machine. The connection appears on the next poll; this
/// call only drives the tool.
pub async fn create_machine<R: CommandRunner>(
    runner: &R,
    opts: &CreateOptions,
    run: RunOptions,
) -> Result<(), CorralError> {
    let args = build_init_args(opts);
    runner.execute(&args, run).await.map_err(normalize)?;
    tracing::info!(name = opts.name.as_deref().unwrap_or_default(), "machine created");
    Ok(())
}

// ── Start / stop / rm ────────────────────────────────────

pub async fn start_machine<R: CommandRunner>(
    runner: &R,
    name: &str,
    provider: &Provider,
    run: RunOptions,
) -> Result<(), CorralError> {
    runner
        .execute(&["start".into(), name.into()], run)
        .await
        .map_err(normalize)?;
    provider.set_status(LifecycleStatus::Started);
    tracing::info!(name, "machine started");
    Ok(())
}

pub async fn stop_machine<R: CommandRunner>(
    runner: &R,
    name: &str,
    provider: &Provider,
    run: RunOptions,
) -> Result<(), CorralError> {
    runner
        .execute(&["stop".into(), name.into()], run)
        .await
        .map_err(normalize)?;
    provider.set_status(LifecycleStatus::Stopped);
    tracing::info!(name, "machine stopped");
    Ok(())
}

/// Remove the machine. The caller is responsible for disposing the
/// registry entry (the next reconciliation pass does it when the identity
/// vanishes from the snapshot). Raw error, not normalized.
pub async fn delete_machine<R: CommandRunner>(
    runner: &R,
    name: &str,
    run: RunOptions,
) -> Result<(), CorralError> {
    runner.execute(&["rm".into(), name.into()], run).await?;
    tracing::info!(name, "machine removed");
    Ok(())
}
