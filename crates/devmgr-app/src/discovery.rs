//! DiscoveryLoop - reconciles transport device-list snapshots with the registry
//!
//! The loop owns the only long-lived `watch` call on the transport. Each
//! snapshot is diffed against the registry, and the resulting events are
//! delivered to the listener as one batch before the next snapshot is read.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};

use devmgr_core::prelude::*;
use devmgr_core::{Device, DiscoveryEvent};
use devmgr_daemon::{DeviceTransport, TransportDevice};

use crate::details::{DetailFetcher, FETCHING_STATUS};
use crate::listener::DeviceListener;
use crate::registry::DeviceRegistry;

/// Snapshots buffered between the transport and the reconciler
const SNAPSHOT_BUFFER: usize = 16;

/// Capacity of the discovery event broadcast
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryState {
    #[default]
    Disconnected,
    Connecting,
    Watching,
    Failed,
}

/// Outcome of diffing one snapshot against the registry
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub events: Vec<DiscoveryEvent>,

    /// Ready devices that need a detail fetch
    pub to_fetch: Vec<String>,
}

impl Reconciliation {
    /// Anything the listener should hear about
    pub fn has_changes(&self) -> bool {
        !self.events.is_empty()
    }
}

/// Apply one snapshot to the registry.
///
/// - A device that is new, or known but never detail-fetched, is (re)added.
///   In the ready state it gets the fetching status and is queued for a fetch
///   unless one is already pending; otherwise its transport state becomes the
///   status.
/// - A fetched device that comes back online, or changes transport state, is
///   reported as updated. Its detail cache is untouched.
/// - An online device missing from the snapshot is marked offline.
pub fn reconcile(registry: &DeviceRegistry, snapshot: &[TransportDevice]) -> Reconciliation {
    let mut outcome = Reconciliation::default();
    let mut seen = HashSet::with_capacity(snapshot.len());

    for reported in snapshot {
        if !seen.insert(reported.serial.as_str()) {
            continue;
        }

        let (handle, created) = registry.upsert(&reported.serial);
        let before = handle.snapshot();

        if created || !before.has_fetched_details {
            if before.detail_fetch_pending && before.connection_state == reported.state {
                continue;
            }
            let state_changed = before.connection_state != reported.state;
            if !created && before.is_online && !state_changed && !reported.state.is_ready() {
                continue;
            }

            let fetch = reported.state.is_ready() && !before.detail_fetch_pending;
            let device = handle.update(|d| {
                d.connection_state = reported.state;
                d.is_online = true;
                d.touch();
                d.status = Some(if reported.state.is_ready() {
                    FETCHING_STATUS.to_string()
                } else {
                    reported.state.as_str().to_string()
                });
            });

            trace!("Discovery: added {} ({})", reported.serial, reported.state);
            if fetch {
                outcome.to_fetch.push(reported.serial.clone());
            }
            outcome.events.push(DiscoveryEvent::Added(device));
        } else if !before.is_online || before.connection_state != reported.state {
            let device = handle.update(|d| {
                let previous_state = d.connection_state.as_str();
                if d.status.as_deref() == Some(previous_state) {
                    d.status = None;
                }
                if !reported.state.is_ready() {
                    d.status = Some(reported.state.as_str().to_string());
                }
                d.connection_state = reported.state;
                d.is_online = true;
                d.touch();
            });

            trace!("Discovery: {} back as {}", reported.serial, reported.state);
            outcome.events.push(DiscoveryEvent::Updated(device));
        }
    }

    for device in registry.all() {
        if device.is_online && !seen.contains(device.serial()) {
            if let Some(device) = registry.mark_offline(device.serial()) {
                trace!("Discovery: removed {}", device.serial());
                outcome.events.push(DiscoveryEvent::Removed(device));
            }
        }
    }

    outcome
}

/// Continuous device watcher
pub struct DiscoveryLoop<T> {
    transport: Arc<T>,
    registry: Arc<DeviceRegistry>,
    details: DetailFetcher<T>,
    state_tx: watch::Sender<DiscoveryState>,
    event_tx: broadcast::Sender<DiscoveryEvent>,
}

impl<T: DeviceTransport + Send + Sync + 'static> DiscoveryLoop<T> {
    pub fn new(transport: Arc<T>, registry: Arc<DeviceRegistry>, details: DetailFetcher<T>) -> Self {
        let (state_tx, _) = watch::channel(DiscoveryState::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            transport,
            registry,
            details,
            state_tx,
            event_tx,
        }
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state_tx.borrow()
    }

    /// Follow state transitions
    pub fn watch_state(&self) -> watch::Receiver<DiscoveryState> {
        self.state_tx.subscribe()
    }

    /// Every discovery event, including watch failures
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }

    fn set_state(&self, state: DiscoveryState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Discovery: {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }

    /// Watch until the transport fails.
    ///
    /// A failure is reported through `listener.error` and ends the loop;
    /// restarting is up to the caller.
    pub async fn run(&self, listener: Arc<dyn DeviceListener>) {
        self.set_state(DiscoveryState::Connecting);

        let (tx, mut rx) = mpsc::channel::<Vec<TransportDevice>>(SNAPSHOT_BUFFER);
        let watch = self.transport.watch(tx);
        tokio::pin!(watch);

        let result = loop {
            tokio::select! {
                biased;
                Some(snapshot) = rx.recv() => {
                    self.set_state(DiscoveryState::Watching);
                    self.apply(&snapshot, &listener);
                }
                result = &mut watch => break result,
            }
        };

        // Snapshots sent just before the watch ended
        while let Ok(snapshot) = rx.try_recv() {
            self.apply(&snapshot, &listener);
        }

        match result {
            Ok(()) => {
                info!("Device watch ended");
                self.set_state(DiscoveryState::Disconnected);
            }
            Err(e) => {
                error!("Device watch failed: {}", e);
                self.set_state(DiscoveryState::Failed);
                let _ = self.event_tx.send(DiscoveryEvent::Error(e.to_string()));
                listener.error(&e);
            }
        }
    }

    /// Reconcile one snapshot and deliver its events as a single batch
    pub fn apply(&self, snapshot: &[TransportDevice], listener: &Arc<dyn DeviceListener>) {
        let outcome = reconcile(&self.registry, snapshot);
        if !outcome.has_changes() {
            trace!("Discovery: snapshot without changes");
            return;
        }

        let devices: Vec<Device> = self.registry.all();
        listener.devices_updated(&devices);

        for event in &outcome.events {
            match event {
                DiscoveryEvent::Added(device) | DiscoveryEvent::Updated(device) => {
                    listener.device_updated(device)
                }
                DiscoveryEvent::Removed(device) => listener.device_removed(device),
                DiscoveryEvent::Error(_) => {}
            }
            let _ = self.event_tx.send(event.clone());
        }

        for serial in &outcome.to_fetch {
            self.details.submit(serial, Arc::clone(listener));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmgr_core::ConnectionState;
    use devmgr_daemon::test_utils::{in_state, ready};

    fn fetched(registry: &DeviceRegistry, serial: &str) {
        registry.update(serial, |d| {
            d.has_fetched_details = true;
            d.detail_fetch_pending = false;
            d.status = None;
        });
    }

    #[test]
    fn test_new_ready_device_is_added_and_queued() {
        let registry = DeviceRegistry::new();
        let outcome = reconcile(&registry, &[ready("ABC123")]);

        assert_eq!(outcome.events.len(), 1);
        assert!(outcome.events[0].is_added());
        assert_eq!(outcome.to_fetch, vec!["ABC123"]);

        let device = registry.get("ABC123").unwrap();
        assert!(device.is_online);
        assert_eq!(device.status.as_deref(), Some(FETCHING_STATUS));
    }

    #[test]
    fn test_transitional_state_becomes_status() {
        let registry = DeviceRegistry::new();
        let outcome = reconcile(&registry, &[in_state("S1", ConnectionState::Unauthorized)]);

        assert!(outcome.to_fetch.is_empty());
        assert_eq!(
            registry.get("S1").unwrap().status.as_deref(),
            Some("unauthorized")
        );

        // Same state again: nothing to report
        assert!(!reconcile(&registry, &[in_state("S1", ConnectionState::Unauthorized)]).has_changes());

        // Authorized: now fetched
        let outcome = reconcile(&registry, &[ready("S1")]);
        assert_eq!(outcome.to_fetch, vec!["S1"]);
    }

    #[test]
    fn test_pending_fetch_is_not_queued_twice() {
        let registry = DeviceRegistry::new();
        reconcile(&registry, &[ready("S1")]);
        registry.update("S1", |d| d.detail_fetch_pending = true);

        let outcome = reconcile(&registry, &[ready("S1"), ready("S2")]);
        assert_eq!(outcome.to_fetch, vec!["S2"]);
    }

    #[test]
    fn test_disconnect_and_reconnect_keeps_cache() {
        let registry = DeviceRegistry::new();
        reconcile(&registry, &[ready("S1")]);
        fetched(&registry, "S1");
        registry.update("S1", |d| d.imei = Some("359876".to_string()));

        let outcome = reconcile(&registry, &[]);
        assert!(outcome.events[0].is_removed());
        assert_eq!(registry.len(), 1);
        assert!(!registry.get("S1").unwrap().is_online);

        let outcome = reconcile(&registry, &[ready("S1")]);
        assert!(matches!(outcome.events[0], DiscoveryEvent::Updated(_)));
        assert!(outcome.to_fetch.is_empty());

        let device = registry.get("S1").unwrap();
        assert!(device.is_online);
        assert!(device.has_fetched_details);
        assert_eq!(device.imei.as_deref(), Some("359876"));
    }

    #[test]
    fn test_unchanged_snapshot_has_no_events() {
        let registry = DeviceRegistry::new();
        reconcile(&registry, &[ready("S1")]);
        fetched(&registry, "S1");

        assert!(!reconcile(&registry, &[ready("S1")]).has_changes());
    }

    #[test]
    fn test_offline_device_is_only_removed_once() {
        let registry = DeviceRegistry::new();
        reconcile(&registry, &[ready("S1")]);
        fetched(&registry, "S1");

        assert!(reconcile(&registry, &[]).has_changes());
        assert!(!reconcile(&registry, &[]).has_changes());
    }
}
