//! Engine - owns every long-lived component of the device manager
//!
//! One `Engine` per process: the registry, worker pool, process tracker,
//! discovery loop, log streamer and device operations are created here and
//! shared by reference. Frontends (the `devmgr` binary, tests) talk to the
//! engine and receive results through listener traits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use futures_util::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use devmgr_core::prelude::*;
use devmgr_core::{Device, DiscoveryEvent, TaskResult};
use devmgr_daemon::{DeviceTransport, ProcessRunner, ProcessTracker, ShellExecutor};

use crate::config::Settings;
use crate::details::DetailFetcher;
use crate::discovery::{reconcile, DiscoveryLoop, DiscoveryState};
use crate::dispatcher::TaskDispatcher;
use crate::listener::{DeviceListener, LogListener};
use crate::log_streamer::LogStreamer;
use crate::operations::Operations;
use crate::registry::DeviceRegistry;

/// How long shutdown waits for killed processes to be reaped
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct Engine<T> {
    transport: Arc<T>,
    settings: Settings,
    registry: Arc<DeviceRegistry>,
    dispatcher: TaskDispatcher,
    tracker: Arc<ProcessTracker>,
    details: DetailFetcher<T>,
    discovery: Arc<DiscoveryLoop<T>>,
    logs: LogStreamer<T>,
    operations: Operations<T>,
    discovery_task: Mutex<Option<JoinHandle<()>>>,

    /// Set once shutdown starts
    shutdown_tx: watch::Sender<bool>,
}

impl<T: DeviceTransport + Send + Sync + 'static> Engine<T> {
    /// Wire up every component around `transport`.
    ///
    /// Must be called inside a tokio runtime; nothing is spawned until
    /// discovery or an operation is started.
    pub fn new(transport: Arc<T>, settings: Settings) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let dispatcher = TaskDispatcher::new(settings.engine.pool_size);
        let tracker = Arc::new(ProcessTracker::new());
        let runner = ProcessRunner::new(Arc::clone(&tracker));
        let shell = ShellExecutor::new(Arc::clone(&transport));

        let details = DetailFetcher::new(shell.clone(), Arc::clone(&registry), dispatcher.clone());
        let discovery = Arc::new(DiscoveryLoop::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            details.clone(),
        ));
        let logs = LogStreamer::new(shell.clone(), settings.logging.clone());
        let operations = Operations::new(
            shell,
            runner,
            Arc::clone(&registry),
            dispatcher.clone(),
            details.clone(),
            settings.scripts.resolved_dir(),
            settings.engine.script_timeout(),
        );

        let missing = operations.missing_scripts();
        if !missing.is_empty() {
            warn!(
                "Helper scripts missing from {}: {}",
                settings.scripts.resolved_dir().display(),
                missing.join(", ")
            );
        }

        let (shutdown_tx, _) = watch::channel(false);

        info!(
            "Engine ready (pool size {}, script timeout {:?})",
            dispatcher.pool_size(),
            settings.engine.script_timeout()
        );

        Self {
            transport,
            settings,
            registry,
            dispatcher,
            tracker,
            details,
            discovery,
            logs,
            operations,
            discovery_task: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn operations(&self) -> &Operations<T> {
        &self.operations
    }

    pub fn logs(&self) -> &LogStreamer<T> {
        &self.logs
    }

    /// Ordered snapshot of every known device
    pub fn devices(&self) -> Vec<Device> {
        self.registry.all()
    }

    pub fn device(&self, serial: &str) -> Option<Device> {
        self.registry.get(serial)
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery.state()
    }

    pub fn watch_discovery_state(&self) -> watch::Receiver<DiscoveryState> {
        self.discovery.watch_state()
    }

    /// Discovery events as they are reconciled
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.discovery.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Spawn the discovery loop. Returns false if it is already running.
    pub fn start_discovery(&self, listener: Arc<dyn DeviceListener>) -> bool {
        let mut task = self
            .discovery_task
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("Discovery already running");
            return false;
        }

        let discovery = Arc::clone(&self.discovery);
        *task = Some(tokio::spawn(async move {
            discovery.run(listener).await;
        }));
        true
    }

    /// One-shot device scan: reconcile the current device list and wait for
    /// any detail fetches it triggers
    pub async fn scan(&self, listener: Arc<dyn DeviceListener>) -> Result<Vec<Device>> {
        let snapshot = self.transport.list_devices().await?;
        let outcome = reconcile(&self.registry, &snapshot);

        if outcome.has_changes() {
            listener.devices_updated(&self.registry.all());
        }
        let fetches: Vec<JoinHandle<()>> = outcome
            .to_fetch
            .iter()
            .filter_map(|serial| self.details.submit(serial, Arc::clone(&listener)))
            .collect();

        for result in join_all(fetches).await {
            if let Err(e) = result {
                warn!("Detail fetch task failed: {}", e);
            }
        }
        Ok(self.registry.all())
    }

    /// Start (or restart) the log stream for `serial`
    pub async fn start_logs(
        &self,
        serial: &str,
        since: Option<NaiveDateTime>,
        listener: Arc<dyn LogListener>,
    ) {
        self.logs.start(serial, since, listener).await;
    }

    pub fn stop_logs(&self, serial: &str) -> bool {
        self.logs.stop(serial)
    }

    /// Run a helper script by name as `<script> <serial> <args…>`, holding a
    /// pool permit while it runs
    pub async fn run_script(
        &self,
        serial: &str,
        name: &str,
        args: &[String],
        long_running: bool,
    ) -> TaskResult {
        match self
            .operations
            .submit_script(serial, name, args, long_running)
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("{} for {} dropped: engine is shutting down", name, serial);
                TaskResult::failure(format!("{} not run: engine is shutting down", name))
            }
        }
    }

    /// Stop log streams and discovery, refuse new work and kill every
    /// tracked process. Returns the number of processes that had to be
    /// killed. Calling it again is harmless.
    pub async fn shutdown(&self) -> usize {
        if self.shutdown_tx.send_replace(true) {
            debug!("Shutdown already in progress");
        }
        info!("Shutting down engine");

        self.logs.stop_all().await;

        let task = self
            .discovery_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }

        self.dispatcher.close();

        let killed = self.tracker.shutdown(SHUTDOWN_GRACE).await;
        if killed > 0 {
            info!("Killed {} tracked process(es)", killed);
        }
        killed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ChannelListener;
    use crate::EngineEvent;
    use devmgr_daemon::test_utils::{ready, MockTransport};

    fn engine_with(mock: MockTransport, scripts: &std::path::Path) -> Engine<MockTransport> {
        let mut settings = Settings::default();
        settings.scripts.dir = Some(scripts.to_path_buf());
        Engine::new(Arc::new(mock), settings)
    }

    #[tokio::test]
    async fn test_scan_fetches_details() {
        let mock = MockTransport::new();
        mock.push_snapshot(vec![ready("S1")]);
        mock.set_properties("S1", &[(devmgr_core::props::MODEL, "Pixel 7")]);
        let scripts = tempfile::tempdir().unwrap();
        let engine = engine_with(mock, scripts.path());
        let (listener, _rx) = ChannelListener::channel();

        let devices = engine.scan(Arc::new(listener)).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].has_fetched_details);
        assert_eq!(devices[0].display_name(), "Pixel 7 - S1");
    }

    #[tokio::test]
    async fn test_discovery_runs_once() {
        let mock = MockTransport::new();
        mock.push_snapshot(vec![ready("S1")]);
        let scripts = tempfile::tempdir().unwrap();
        let engine = engine_with(mock, scripts.path());
        let (listener, mut rx) = ChannelListener::channel();
        let listener: Arc<dyn DeviceListener> = Arc::new(listener);

        assert!(engine.start_discovery(Arc::clone(&listener)));
        assert!(!engine.start_discovery(listener));

        let mut fetched = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(2), rx.recv()).await
        {
            if let EngineEvent::DeviceUpdated { device } = event {
                if device.has_fetched_details {
                    fetched = true;
                    break;
                }
            }
        }
        assert!(fetched);
        assert_eq!(engine.discovery_state(), DiscoveryState::Watching);

        engine.shutdown().await;
        assert!(engine.is_shutting_down());
        assert!(engine.dispatcher().is_closed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_kills_long_running_scripts() {
        use std::os::unix::fs::PermissionsExt;

        let scripts = tempfile::tempdir().unwrap();
        let path = scripts.path().join("mirror.sh");
        std::fs::write(&path, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engine = Arc::new(engine_with(MockTransport::new(), scripts.path()));
        let running = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run_script("S1", "mirror.sh", &[], true).await })
        };

        // Wait for the child to be registered
        for _ in 0..50 {
            if !engine.tracker.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(engine.shutdown().await, 1);
        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(!result.success);
        assert!(engine.tracker.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_script_holds_a_pool_permit() {
        use std::os::unix::fs::PermissionsExt;

        let scripts = tempfile::tempdir().unwrap();
        let path = scripts.path().join("screenshot.sh");
        std::fs::write(&path, "#!/bin/sh\nsleep 1\necho \"$1\"\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut settings = Settings::default();
        settings.scripts.dir = Some(scripts.path().to_path_buf());
        settings.engine.pool_size = 1;
        let engine = Arc::new(Engine::new(Arc::new(MockTransport::new()), settings));

        let running = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run_script("S1", "screenshot.sh", &[], false).await })
        };
        for _ in 0..50 {
            if !engine.tracker.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(engine.dispatcher().available(), 0);

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.success, "{:?}", result);
        assert_eq!(result.stdout, vec!["S1"]);

        // The permit is released just after the result is sent
        tokio::time::timeout(Duration::from_secs(1), async {
            while engine.dispatcher().available() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("permit never returned");
    }

    #[tokio::test]
    async fn test_run_script_after_shutdown_is_refused() {
        let scripts = tempfile::tempdir().unwrap();
        let engine = engine_with(MockTransport::new(), scripts.path());
        engine.shutdown().await;

        let result = engine.run_script("S1", "screenshot.sh", &[], false).await;
        assert!(!result.success);
        assert!(result.stderr[0].contains("shutting down"));
    }

    #[tokio::test]
    async fn test_run_script_missing() {
        let scripts = tempfile::tempdir().unwrap();
        let engine = engine_with(MockTransport::new(), scripts.path());
        let result = engine.run_script("S1", "nope.sh", &[], false).await;
        assert!(!result.success);
        assert!(result.stderr[0].contains("Script not found"));
    }
}
