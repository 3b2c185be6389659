//! Connection descriptors and the host-side registration seam.
//!
//! A descriptor is what the reconciler hands to the host application for a
//! newly observed machine: a status accessor backed by the registry view,
//! the shell-access settings from the machine record, and lifecycle hooks
//! that drive the machine tool. The host returns a disposable handle the
//! registry keeps until the machine vanishes from a snapshot.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::CorralError;
use crate::inventory::MachineRecord;
use crate::lifecycle;
use crate::registry::{Disposable, StatusView};
use crate::runner::{CommandRunner, RunOptions};
use crate::status::{LifecycleStatus, Provider};

// ── Descriptor ───────────────────────────────────────────

/// Everything needed to open shell access to the machine.
#[derive(Debug, Clone)]
pub struct ShellSettings {
    pub port: u16,
    pub username: String,
    pub identity_path: PathBuf,
}

/// Status accessor bound to one identity, delegating to the registry.
#[derive(Clone)]
pub struct StatusAccessor {
    view: StatusView,
    identity: String,
}

impl StatusAccessor {
    pub fn new(view: StatusView, identity: impl Into<String>) -> Self {
        Self {
            view,
            identity: identity.into(),
        }
    }

    pub fn get(&self) -> LifecycleStatus {
        self.view.status_of(&self.identity)
    }
}

type LifecycleOp = Box<
    dyn Fn(CancellationToken) -> Pin<Box<dyn Future<Output = Result<(), CorralError>> + Send>>
        + Send
        + Sync,
>;

/// Start/stop/delete hooks the host can invoke on behalf of the user.
pub struct ConnectionLifecycle {
    pub start: LifecycleOp,
    pub stop: LifecycleOp,
    pub delete: LifecycleOp,
}

pub struct ConnectionDescriptor {
    pub identity: String,
    pub shell: ShellSettings,
    pub status: StatusAccessor,
    pub lifecycle: ConnectionLifecycle,
}

impl ConnectionDescriptor {
    /// Build a descriptor for a machine record, wiring the lifecycle hooks
    /// to the given runner and provider.
    pub fn for_record<R: CommandRunner + 'static>(
        record: &MachineRecord,
        view: StatusView,
        runner: Arc<R>,
        provider: Provider,
    ) -> Self {
        let identity = record.identity.clone();

        let start: LifecycleOp = {
            let runner = runner.clone();
            let provider = provider.clone();
            let name = identity.clone();
            Box::new(move |cancel| {
                let runner = runner.clone();
                let provider = provider.clone();
                let name = name.clone();
                Box::pin(async move {
                    let run = RunOptions::cancellable(cancel);
                    lifecycle::start_machine(runner.as_ref(), &name, &provider, run).await
                })
            })
        };

        let stop: LifecycleOp = {
            let runner = runner.clone();
            let provider = provider.clone();
            let name = identity.clone();
            Box::new(move |cancel| {
                let runner = runner.clone();
                let provider = provider.clone();
                let name = name.clone();
                Box::pin(async move {
                    let run = RunOptions::cancellable(cancel);
                    lifecycle::stop_machine(runner.as_ref(), &name, &provider, run).await
                })
            })
        };

        let delete: LifecycleOp = {
            let runner = runner.clone();
            let name = identity.clone();
            Box::new(move |cancel| {
                let runner = runner.clone();
                let name = name.clone();
                Box::pin(async move {
                    let run = RunOptions::cancellable(cancel);
                    lifecycle::delete_machine(runner.as_ref(), &name, run).await
                })
            })
        };

        Self {
            identity: identity.clone(),
            shell: ShellSettings {
                port: record.port,
                username: record.remote_username.clone(),
                identity_path: record.identity_path.clone(),
            },
            status: StatusAccessor::new(view, identity),
            lifecycle: ConnectionLifecycle {
                start,
                stop,
                delete,
            },
        }
    }
}

// ── Host seam ────────────────────────────────────────────

/// Configuration keys applied to a registered connection's store.
pub const CONFIG_CPUS: &str = "machine.cpus";
pub const CONFIG_MEMORY: &str = "machine.memory";
pub const CONFIG_DISK_SIZE: &str = "machine.diskSize";

/// The host application that tracks connections. Registration hands over a
/// descriptor and yields a disposable handle; each registered connection
/// has a key/value configuration store.
pub trait ConnectionHost: Send + Sync {
    fn register(
        &self,
        descriptor: ConnectionDescriptor,
    ) -> Result<Box<dyn Disposable>, CorralError>;

    fn update_config(
        &self,
        identity: &str,
        key: &str,
        value: u64,
    ) -> impl Future<Output = Result<(), CorralError>> + Send;
}

// ── TracingHost ──────────────────────────────────────────

/// Host that only logs. Backs `corral watch` when no real host application
/// is embedding the reconciler.
#[derive(Debug, Clone, Default)]
pub struct TracingHost;

struct TracingHandle {
    identity: String,
    disposed: bool,
}

impl Disposable for TracingHandle {
    fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            tracing::info!(identity = %self.identity, "connection disposed");
        }
    }
}

impl ConnectionHost for TracingHost {
    fn register(
        &self,
        descriptor: ConnectionDescriptor,
    ) -> Result<Box<dyn Disposable>, CorralError> {
        tracing::info!(
            identity = %descriptor.identity,
            port = descriptor.shell.port,
            username = %descriptor.shell.username,
            "connection registered"
        );
        Ok(Box::new(TracingHandle {
            identity: descriptor.identity,
            disposed: false,
        }))
    }

    async fn update_config(
        &self,
        identity: &str,
        key: &str,
        value: u64,
    ) -> Result<(), CorralError> {
        tracing::debug!(identity, key, value, "connection config updated");
        Ok(())
    }
}
