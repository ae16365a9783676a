//! One-time detail fetch for a device
//!
//! Every step is best-effort: a failing command is logged and the remaining
//! steps still run. The fetch ends by marking the device fetched, online and
//! idle, then notifies the device listener.

use std::sync::Arc;

use tokio::task::JoinHandle;

use devmgr_core::prelude::*;
use devmgr_core::{parse_custom_properties, parse_free_space, parse_service_call, Device};
use devmgr_daemon::{DeviceTransport, ShellExecutor};

use crate::dispatcher::TaskDispatcher;
use crate::listener::DeviceListener;
use crate::registry::{DeviceHandle, DeviceRegistry};

pub const PHONE_COMMAND: &str = "service call iphonesubinfo 15 s16 com.android.shell";
pub const PHONE_FALLBACK_COMMAND: &str = "service call iphonesubinfo 12 s16 com.android.shell";
pub const IMEI_COMMAND: &str = "service call iphonesubinfo 1 s16 com.android.shell";
pub const FREE_SPACE_COMMAND: &str = "df";

/// Key=value file the device keeps its custom properties in
pub const CUSTOM_PROPERTIES_FILE: &str = "/sdcard/android_device_manager.properties";

/// Status shown while a fetch is queued or running
pub const FETCHING_STATUS: &str = "fetching details..";

pub struct DetailFetcher<T> {
    shell: ShellExecutor<T>,
    registry: Arc<DeviceRegistry>,
    dispatcher: TaskDispatcher,
}

impl<T> Clone for DetailFetcher<T> {
    fn clone(&self) -> Self {
        Self {
            shell: self.shell.clone(),
            registry: Arc::clone(&self.registry),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

/// Clears `detail_fetch_pending` if the fetch task dies before finishing
struct PendingFetch {
    handle: DeviceHandle,
    finished: bool,
}

impl Drop for PendingFetch {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Detail fetch for {} did not complete", self.handle.serial());
            self.handle.update(|d| d.detail_fetch_pending = false);
        }
    }
}

impl<T: DeviceTransport + Send + Sync + 'static> DetailFetcher<T> {
    pub fn new(
        shell: ShellExecutor<T>,
        registry: Arc<DeviceRegistry>,
        dispatcher: TaskDispatcher,
    ) -> Self {
        Self {
            shell,
            registry,
            dispatcher,
        }
    }

    /// Queue a fetch for `serial` on the dispatcher.
    ///
    /// Returns `None` for an unknown serial or when a fetch for this device
    /// is already pending.
    pub fn submit(
        &self,
        serial: &str,
        listener: Arc<dyn DeviceListener>,
    ) -> Option<JoinHandle<()>> {
        let handle = self.registry.find(serial)?;

        let mut already_pending = false;
        handle.update(|d| {
            already_pending = d.detail_fetch_pending;
            d.detail_fetch_pending = true;
        });
        if already_pending {
            debug!("Detail fetch for {} already pending", serial);
            return None;
        }

        let fetcher = self.clone();
        Some(
            self.dispatcher
                .submit(format!("fetch-details {serial}"), async move {
                    let mut pending = PendingFetch {
                        handle: handle.clone(),
                        finished: false,
                    };
                    fetcher.fetch(&handle, listener.as_ref()).await;
                    pending.finished = true;
                    Ok(())
                }),
        )
    }

    /// Run every fetch step for one device and publish the result
    pub async fn fetch(&self, handle: &DeviceHandle, listener: &dyn DeviceListener) -> Device {
        let serial = handle.serial().to_string();
        debug!("Fetching details for {}", serial);

        let mut phone = self.service_call(&serial, PHONE_COMMAND).await;
        if phone.as_deref().map_or(true, str::is_empty) {
            phone = self.service_call(&serial, PHONE_FALLBACK_COMMAND).await;
        }
        let imei = self.service_call(&serial, IMEI_COMMAND).await;

        let free_space = parse_free_space(&self.shell.run_lines(&serial, FREE_SPACE_COMMAND).await);
        if free_space.is_none() {
            trace!("No free space figure for {}", serial);
        }

        let properties = match self.shell.transport().get_properties(&serial).await {
            Ok(properties) => Some(properties),
            Err(e) => {
                error!("Failed to read properties of {}: {}", serial, e);
                None
            }
        };

        // The file only exists once a custom property has been set
        let custom_properties = match self
            .shell
            .transport()
            .pull_file(&serial, CUSTOM_PROPERTIES_FILE)
            .await
        {
            Ok(bytes) => Some(parse_custom_properties(&String::from_utf8_lossy(&bytes))),
            Err(e) => {
                trace!("No custom properties on {}: {}", serial, e);
                None
            }
        };

        let device = handle.update(|d| {
            if phone.is_some() {
                d.phone = phone;
            }
            if imei.is_some() {
                d.imei = imei;
            }
            if free_space.is_some() {
                d.free_space_bytes = free_space;
            }
            if let Some(properties) = properties {
                d.properties = properties;
            }
            if let Some(custom) = custom_properties {
                d.custom_properties.extend(custom);
            }
            d.has_fetched_details = true;
            d.detail_fetch_pending = false;
            d.status = None;
            d.is_online = true;
        });

        trace!("Fetched details for {}: {:?}", serial, device);
        listener.device_updated(&device);
        device
    }

    async fn service_call(&self, serial: &str, command: &str) -> Option<String> {
        parse_service_call(&self.shell.run_lines(serial, command).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ChannelListener;
    use crate::EngineEvent;
    use devmgr_core::props;
    use devmgr_daemon::test_utils::MockTransport;

    fn setup(mock: MockTransport) -> (DetailFetcher<MockTransport>, Arc<DeviceRegistry>) {
        let registry = Arc::new(DeviceRegistry::new());
        let fetcher = DetailFetcher::new(
            ShellExecutor::new(Arc::new(mock)),
            Arc::clone(&registry),
            TaskDispatcher::new(2),
        );
        (fetcher, registry)
    }

    fn scripted_device() -> MockTransport {
        let mock = MockTransport::new();
        mock.set_shell_output(
            PHONE_COMMAND,
            "Result: Parcel(\n0x00000000: 00000000 0000000b 00350031 '........5.5.5.1.'\n)\n",
        );
        mock.set_shell_output(
            IMEI_COMMAND,
            "Result: Parcel(\n0x00000000: 00000000 0000000f 00350033 '....3.5.9.8.7.6.'\n)\n",
        );
        mock.set_shell_output(
            FREE_SPACE_COMMAND,
            "Filesystem 1K-blocks Used Available Use% Mounted on\n/dev/fuse 115249236 14681484 100436680 13% /storage/emulated\n",
        );
        mock.set_properties("S1", &[(props::MODEL, "Pixel 7")]);
        mock.set_file("S1", CUSTOM_PROPERTIES_FILE, b"owner=qa\nrack=3\n");
        mock
    }

    #[tokio::test]
    async fn test_fetch_populates_device() {
        let (fetcher, registry) = setup(scripted_device());
        let (handle, _) = registry.upsert("S1");
        let (listener, mut rx) = ChannelListener::channel();

        let device = fetcher.fetch(&handle, &listener).await;

        assert_eq!(device.phone.as_deref(), Some("5551"));
        assert_eq!(device.imei.as_deref(), Some("359876"));
        assert_eq!(device.free_space_bytes, Some(100_436_680_000));
        assert_eq!(device.property(props::MODEL), Some("Pixel 7"));
        assert_eq!(device.custom_property("rack"), Some("3"));
        assert!(device.has_fetched_details && device.is_online);
        assert!(device.status.is_none());
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::DeviceUpdated { .. })));
    }

    #[tokio::test]
    async fn test_phone_falls_back_to_second_command() {
        let mock = MockTransport::new();
        mock.set_shell_output(
            PHONE_FALLBACK_COMMAND,
            "Result: Parcel(\n0x00000000: 00000000 0000000b 00350031 '....4.2.'\n)\n",
        );
        let (fetcher, registry) = setup(mock);
        let (handle, _) = registry.upsert("S1");
        let (listener, _rx) = ChannelListener::channel();

        let device = fetcher.fetch(&handle, &listener).await;
        assert_eq!(device.phone.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_every_step_failing_still_completes() {
        let mock = MockTransport::new();
        mock.fail_calls("shell S1");
        mock.fail_calls("getprop S1");
        let (fetcher, registry) = setup(mock);
        let (handle, _) = registry.upsert("S1");
        let (listener, _rx) = ChannelListener::channel();

        let device = fetcher.fetch(&handle, &listener).await;
        assert!(device.has_fetched_details);
        assert!(device.phone.is_none());
        assert!(device.free_space_bytes.is_none());
        assert!(device.custom_properties.is_empty());
    }

    #[tokio::test]
    async fn test_submit_skips_pending_device() {
        let (fetcher, registry) = setup(scripted_device());
        registry.upsert("S1");
        let (listener, _rx) = ChannelListener::channel();
        let listener: Arc<dyn DeviceListener> = Arc::new(listener);

        let first = fetcher.submit("S1", Arc::clone(&listener));
        let second = fetcher.submit("S1", Arc::clone(&listener));
        assert!(first.is_some());
        assert!(second.is_none());

        first.unwrap().await.unwrap();
        let device = registry.get("S1").unwrap();
        assert!(device.has_fetched_details);
        assert!(!device.detail_fetch_pending);

        assert!(fetcher.submit("unknown", listener).is_none());
    }
}
