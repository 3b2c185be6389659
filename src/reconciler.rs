//! The reconciliation loop.
//!
//! One pass polls the machine tool's inventory, derives per-machine
//! statuses (notifying listeners before each commit), diffs the snapshot
//! against the registry to create and tear down connections, and finally
//! recomputes the aggregate provider status. Passes are strictly
//! serialized: the next tick is scheduled only after the previous pass,
//! including all of its concurrent connection creations, has settled.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;

use crate::connection::{
    CONFIG_CPUS, CONFIG_DISK_SIZE, CONFIG_MEMORY, ConnectionDescriptor, ConnectionHost,
};
use crate::error::CorralError;
use crate::inventory::{InventoryReader, MachineRecord};
use crate::listeners::{ListenerSet, Subscription};
use crate::registry::{Registry, StatusView};
use crate::runner::CommandRunner;
use crate::status::{LifecycleStatus, Provider, machine_status};

pub struct Reconciler<R: CommandRunner, H: ConnectionHost> {
    runner: Arc<R>,
    host: Arc<H>,
    inventory: InventoryReader<R>,
    registry: Registry,
    listeners: ListenerSet,
    provider: Provider,
    interval: Duration,
}

impl<R: CommandRunner + 'static, H: ConnectionHost> Reconciler<R, H> {
    pub fn new(runner: Arc<R>, host: Arc<H>, provider: Provider, interval: Duration) -> Self {
        Self {
            inventory: InventoryReader::new(runner.clone()),
            runner,
            host,
            registry: Registry::new(),
            listeners: ListenerSet::new(),
            provider,
            interval,
        }
    }

    /// Register a status-change listener. Fired synchronously, before the
    /// new status is committed, for every already-tracked machine whose
    /// derived status changed. First sight of an identity never fires.
    pub fn subscribe(
        &self,
        handler: impl Fn(&str, LifecycleStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.subscribe(handler)
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn status_view(&self) -> StatusView {
        self.registry.view()
    }

    /// Run passes on the fixed period until `stop` is cancelled.
    pub async fn run(&self, stop: CancellationToken) {
        loop {
            self.reconcile_pass().await;
            tokio::select! {
                _ = stop.cancelled() => {
                    tracing::info!("reconciler stopped");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// One poll-diff-apply cycle. Never raises: anything escaping the pass
    /// is logged at this boundary so the loop stays alive.
    pub async fn reconcile_pass(&self) {
        if let Err(e) = self.try_pass().await {
            tracing::warn!(error = %e, "reconciliation pass failed");
        }
    }

    async fn try_pass(&self) -> Result<(), CorralError> {
        let (records, soft_error) = self.inventory.read().await;
        if let Some(cause) = soft_error {
            // A failed poll is not an empty inventory: keep every map entry
            // as-is and try again on the next tick.
            tracing::warn!(%cause, "inventory read degraded, keeping previous state");
            if records.is_empty() {
                return Ok(());
            }
        }

        // Derive and commit per-machine statuses. Listeners fire before the
        // commit so they observe the transition, not the settled state.
        for record in &records {
            let status = machine_status(record.running, record.starting);
            if let Some(previous) = self.registry.status_of(&record.identity)
                && previous != status
            {
                tracing::debug!(
                    identity = %record.identity,
                    from = %previous,
                    to = %status,
                    "machine status changed"
                );
                self.listeners.notify(&record.identity, status);
            }
            self.registry.commit(record.clone(), status);
        }

        // Identities that vanished from the snapshot.
        let live: BTreeSet<&str> = records.iter().map(|r| r.identity.as_str()).collect();
        let removed: Vec<String> = self
            .registry
            .tracked_identities()
            .into_iter()
            .filter(|identity| !live.contains(identity.as_str()))
            .collect();

        // Create connections for machines that have none yet. Creations run
        // concurrently; one failure never blocks the others.
        let mut creations: FuturesUnordered<_> = records
            .iter()
            .filter(|r| !self.registry.has_connection(&r.identity))
            .map(|r| self.create_connection(r.clone()))
            .collect();
        while let Some(outcome) = creations.next().await {
            if let Err((identity, e)) = outcome {
                tracing::warn!(identity, error = %e, "connection registration failed");
            }
        }

        for identity in &removed {
            tracing::info!(identity, "machine gone, tearing down connection");
            self.registry.remove(identity);
        }

        let before = self.provider.status();
        self.provider.apply_aggregate(&records);
        let after = self.provider.status();
        if before != after {
            tracing::info!(from = %before, to = %after, "provider status changed");
        }
        Ok(())
    }

    /// Register one machine with the host. Applies the machine's resource
    /// attributes to the connection's configuration store (failures there
    /// are logged, never rolled back) and marks the machine `ready`.
    async fn create_connection(&self, record: MachineRecord) -> Result<(), (String, CorralError)> {
        let identity = record.identity.clone();
        let descriptor = ConnectionDescriptor::for_record(
            &record,
            self.registry.view(),
            self.runner.clone(),
            self.provider.clone(),
        );

        let handle = self
            .host
            .register(descriptor)
            .map_err(|e| (identity.clone(), e))?;
        self.registry.insert_connection(&identity, handle);

        for (key, value) in [
            (CONFIG_CPUS, record.cpus),
            (CONFIG_MEMORY, record.memory_bytes),
            (CONFIG_DISK_SIZE, record.disk_bytes),
        ] {
            if let Err(e) = self.host.update_config(&identity, key, value).await {
                tracing::warn!(identity, key, error = %e, "failed to apply connection config");
            }
        }

        // Registration succeeding is itself a status signal.
        self.registry.set_status(&identity, LifecycleStatus::Ready);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunError;
    use crate::registry::Disposable;
    use crate::runner::{RunOptions, RunOutput};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runner that replays a queue of `list` responses. Replays the last
    /// response forever once the queue is drained.
    struct ScriptedRunner {
        responses: Mutex<VecDeque<Result<String, RunError>>>,
        last: Mutex<Option<String>>,
    }

    impl ScriptedRunner {
        fn new(responses: Vec<Result<&str, &str>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|r| r.map(String::from).map_err(RunError::message))
                        .collect(),
                ),
                last: Mutex::new(None),
            })
        }
    }

    impl CommandRunner for ScriptedRunner {
        async fn execute(&self, args: &[String], _opts: RunOptions) -> Result<RunOutput, RunError> {
            assert_eq!(args, ["list"]);
            let next = self.responses.lock().unwrap().pop_front();
            let stdout = match next {
                Some(Ok(stdout)) => {
                    *self.last.lock().unwrap() = Some(stdout.clone());
                    stdout
                }
                Some(Err(e)) => return Err(e),
                None => self.last.lock().unwrap().clone().unwrap_or_default(),
            };
            Ok(RunOutput {
                stdout,
                stderr: String::new(),
            })
        }
    }

    struct CountingHandle {
        disposals: Arc<AtomicUsize>,
    }

    impl Disposable for CountingHandle {
        fn dispose(&mut self) {
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Host that records registrations and can be primed to reject one
    /// identity.
    #[derive(Default)]
    struct RecordingHost {
        registered: Mutex<Vec<String>>,
        config_writes: Mutex<Vec<(String, String, u64)>>,
        reject: Option<String>,
        disposals: Arc<AtomicUsize>,
    }

    impl ConnectionHost for RecordingHost {
        fn register(
            &self,
            descriptor: ConnectionDescriptor,
        ) -> Result<Box<dyn Disposable>, CorralError> {
            if self.reject.as_deref() == Some(descriptor.identity.as_str()) {
                return Err(CorralError::Host {
                    message: format!("rejected {}", descriptor.identity),
                });
            }
            self.registered.lock().unwrap().push(descriptor.identity);
            Ok(Box::new(CountingHandle {
                disposals: self.disposals.clone(),
            }))
        }

        async fn update_config(
            &self,
            identity: &str,
            key: &str,
            value: u64,
        ) -> Result<(), CorralError> {
            self.config_writes
                .lock()
                .unwrap()
                .push((identity.into(), key.into(), value));
            Ok(())
        }
    }

    fn json(machines: &[(&str, bool, bool)]) -> String {
        let entries: Vec<String> = machines
            .iter()
            .map(|(name, running, starting)| {
                format!(
                    r#"{{"name":"{name}","cpus":2,"memory":2147483648,"disk_size":10737418240,"port":50022,"remote_username":"core","identity_path":"/tmp/{name}","running":{running},"starting":{starting}}}"#
                )
            })
            .collect();
        format!("[{}]", entries.join(","))
    }

    fn reconciler(
        runner: Arc<ScriptedRunner>,
        host: Arc<RecordingHost>,
    ) -> Reconciler<ScriptedRunner, RecordingHost> {
        Reconciler::new(runner, host, Provider::new(true), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn first_sight_registers_without_notification() {
        let runner = ScriptedRunner::new(vec![Ok(&json(&[("a", false, true)]))]);
        let host = Arc::new(RecordingHost::default());
        let r = reconciler(runner, host.clone());

        let notifications = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let notifications = notifications.clone();
            r.subscribe(move |id, status| {
                notifications.lock().unwrap().push((id.to_string(), status))
            })
        };

        r.reconcile_pass().await;

        assert!(notifications.lock().unwrap().is_empty());
        assert_eq!(*host.registered.lock().unwrap(), ["a"]);
        // registration success promoted the machine to ready
        assert_eq!(r.registry().status_of("a"), Some(LifecycleStatus::Ready));
        assert!(r.registry().invariants_hold());
        // resource attributes flowed into the connection config store
        let writes = host.config_writes.lock().unwrap();
        assert!(writes.contains(&("a".into(), CONFIG_CPUS.into(), 2)));
        assert!(writes.contains(&("a".into(), CONFIG_MEMORY.into(), 2147483648)));
    }

    #[tokio::test]
    async fn status_change_notifies_exactly_once() {
        let runner = ScriptedRunner::new(vec![
            Ok(&json(&[("a", false, true)])),
            Ok(&json(&[("a", true, false)])),
        ]);
        let host = Arc::new(RecordingHost::default());
        let r = reconciler(runner, host);

        let notifications = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let notifications = notifications.clone();
            r.subscribe(move |id, status| {
                notifications.lock().unwrap().push((id.to_string(), status))
            })
        };

        r.reconcile_pass().await; // starting, first sight: silent (then ready on registration)
        r.reconcile_pass().await; // started: one notification

        assert_eq!(
            *notifications.lock().unwrap(),
            [("a".to_string(), LifecycleStatus::Started)]
        );
        assert_eq!(r.registry().status_of("a"), Some(LifecycleStatus::Started));
    }

    #[tokio::test]
    async fn removed_machine_disposed_once_and_dropped_from_all_maps() {
        let runner = ScriptedRunner::new(vec![Ok(&json(&[("b", true, false)])), Ok("[]")]);
        let host = Arc::new(RecordingHost::default());
        let r = reconciler(runner, host.clone());

        r.reconcile_pass().await;
        assert!(r.registry().has_connection("b"));

        r.reconcile_pass().await;
        assert!(r.registry().is_empty());
        assert_eq!(host.disposals.load(Ordering::SeqCst), 1);
        assert!(r.registry().invariants_hold());
        assert_eq!(r.provider().status(), LifecycleStatus::Installed);
    }

    #[tokio::test]
    async fn aggregate_skipped_when_platform_excludes_it() {
        let runner = ScriptedRunner::new(vec![Ok(&json(&[("b", true, false)])), Ok("[]")]);
        let host = Arc::new(RecordingHost::default());
        let r = Reconciler::new(runner, host, Provider::new(false), Duration::from_millis(10));

        r.reconcile_pass().await;
        r.reconcile_pass().await;
        assert_eq!(r.provider().status(), LifecycleStatus::Unknown);
    }

    #[tokio::test]
    async fn soft_error_leaves_existing_entries_unchanged() {
        let runner = ScriptedRunner::new(vec![
            Ok(&json(&[("a", true, false)])),
            Err("tool temporarily unavailable"),
        ]);
        let host = Arc::new(RecordingHost::default());
        let r = reconciler(runner, host.clone());

        r.reconcile_pass().await;
        let status_before = r.registry().status_of("a");

        // The failed poll yields an empty snapshot, which would normally
        // mean "machine a was removed" — but a soft error must not be
        // interpreted as removal.
        r.reconcile_pass().await;

        assert_eq!(r.registry().status_of("a"), status_before);
        assert!(r.registry().has_connection("a"));
        assert_eq!(host.disposals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn creation_failure_is_isolated() {
        let runner = ScriptedRunner::new(vec![Ok(&json(&[
            ("bad", false, false),
            ("good", true, false),
        ]))]);
        let host = Arc::new(RecordingHost {
            reject: Some("bad".into()),
            ..RecordingHost::default()
        });
        let r = reconciler(runner, host.clone());

        r.reconcile_pass().await;

        assert_eq!(*host.registered.lock().unwrap(), ["good"]);
        assert!(r.registry().has_connection("good"));
        assert!(!r.registry().has_connection("bad"));
        // both machines stay tracked; only the connection is missing
        assert_eq!(r.registry().status_of("bad"), Some(LifecycleStatus::Stopped));
        assert_eq!(r.registry().status_of("good"), Some(LifecycleStatus::Ready));
    }

    #[tokio::test]
    async fn failed_creation_is_retried_next_pass() {
        let runner = ScriptedRunner::new(vec![Ok(&json(&[("a", true, false)]))]);
        let host = Arc::new(RecordingHost {
            reject: Some("a".into()),
            ..RecordingHost::default()
        });
        let r = reconciler(runner, host.clone());

        r.reconcile_pass().await;
        assert!(!r.registry().has_connection("a"));

        // second pass sees the same snapshot; the identity still has no
        // connection, but the host keeps rejecting
        r.reconcile_pass().await;
        assert!(!r.registry().has_connection("a"));
        assert!(r.registry().invariants_hold());
    }

    /// Layer that flattens every event's fields into one line, so tests
    /// can assert on emitted diagnostics.
    struct CaptureLayer {
        lines: Arc<Mutex<Vec<String>>>,
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CaptureLayer {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            struct Flatten<'a>(&'a mut String);

            impl tracing::field::Visit for Flatten<'_> {
                fn record_debug(
                    &mut self,
                    field: &tracing::field::Field,
                    value: &dyn std::fmt::Debug,
                ) {
                    use std::fmt::Write;
                    let _ = write!(self.0, "{}={:?} ", field.name(), value);
                }
            }

            let mut line = String::new();
            event.record(&mut Flatten(&mut line));
            self.lines.lock().unwrap().push(line);
        }
    }

    #[tokio::test]
    async fn aggregate_transitions_are_logged() {
        use tracing_subscriber::layer::SubscriberExt;

        let lines = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(CaptureLayer {
            lines: lines.clone(),
        });
        let _guard = tracing::subscriber::set_default(subscriber);

        let runner = ScriptedRunner::new(vec![Ok(&json(&[("a", true, false)])), Ok("[]")]);
        let host = Arc::new(RecordingHost::default());
        let r = reconciler(runner, host);

        r.reconcile_pass().await; // unknown -> ready
        r.reconcile_pass().await; // ready -> installed
        r.reconcile_pass().await; // installed -> installed: silent

        let lines = lines.lock().unwrap();
        let transitions: Vec<&String> = lines
            .iter()
            .filter(|l| l.contains("provider status changed"))
            .collect();
        assert_eq!(transitions.len(), 2);
        assert!(transitions[0].contains("from=unknown") && transitions[0].contains("to=ready"));
        assert!(
            transitions[1].contains("from=ready") && transitions[1].contains("to=installed")
        );
    }

    #[tokio::test]
    async fn run_loop_stops_on_cancel() {
        let runner = ScriptedRunner::new(vec![Ok("[]")]);
        let host = Arc::new(RecordingHost::default());
        let r = reconciler(runner, host);

        let stop = CancellationToken::new();
        let stopper = stop.clone();
        let driver = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            stopper.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), r.run(stop))
            .await
            .expect("run loop must exit after cancellation");
        driver.await.unwrap();
    }
}
