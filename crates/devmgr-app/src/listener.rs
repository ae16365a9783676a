//! Outward listener interfaces
//!
//! Callbacks run on engine tasks, so implementations must be cheap and must
//! not block. [`ChannelListener`] implements all of them by forwarding an
//! [`EngineEvent`] into an unbounded channel.

use tokio::sync::mpsc;

use devmgr_core::{Device, Error, LogEntry, ProcessIdMap};
use devmgr_daemon::RemoteFile;

use crate::engine_event::EngineEvent;

/// Device list and per-device changes
pub trait DeviceListener: Send + Sync {
    fn devices_updated(&self, devices: &[Device]);
    fn device_updated(&self, device: &Device);
    fn device_removed(&self, device: &Device);
    fn error(&self, error: &Error);
}

/// Log stream output for one device
pub trait LogListener: Send + Sync {
    fn log_entries(&self, serial: &str, entries: &[LogEntry]);
    fn process_map(&self, serial: &str, processes: &ProcessIdMap);
}

/// Generic completion of a fire-and-forget operation
pub trait TaskListener: Send + Sync {
    fn task_complete(&self, success: bool, message: Option<&str>);
}

/// Result of a remote directory listing
pub trait FileListener: Send + Sync {
    fn files_listed(&self, serial: &str, path: &str, files: Option<&[RemoteFile]>);
}

/// Forwards every callback as an [`EngineEvent`]
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Listener plus the receiving end of its events
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn send(&self, event: EngineEvent) {
        // Receiver gone means nobody is interested any more
        let _ = self.tx.send(event);
    }
}

impl DeviceListener for ChannelListener {
    fn devices_updated(&self, devices: &[Device]) {
        self.send(EngineEvent::DevicesUpdated {
            devices: devices.to_vec(),
        });
    }

    fn device_updated(&self, device: &Device) {
        self.send(EngineEvent::DeviceUpdated {
            device: device.clone(),
        });
    }

    fn device_removed(&self, device: &Device) {
        self.send(EngineEvent::DeviceRemoved {
            device: device.clone(),
        });
    }

    fn error(&self, error: &Error) {
        self.send(EngineEvent::Error {
            message: error.to_string(),
        });
    }
}

impl LogListener for ChannelListener {
    fn log_entries(&self, serial: &str, entries: &[LogEntry]) {
        self.send(EngineEvent::LogEntries {
            serial: serial.to_string(),
            entries: entries.to_vec(),
        });
    }

    fn process_map(&self, serial: &str, processes: &ProcessIdMap) {
        self.send(EngineEvent::ProcessMap {
            serial: serial.to_string(),
            processes: processes.clone(),
        });
    }
}

impl TaskListener for ChannelListener {
    fn task_complete(&self, success: bool, message: Option<&str>) {
        self.send(EngineEvent::TaskComplete {
            success,
            message: message.map(str::to_string),
        });
    }
}

impl FileListener for ChannelListener {
    fn files_listed(&self, serial: &str, path: &str, files: Option<&[RemoteFile]>) {
        self.send(EngineEvent::FilesListed {
            serial: serial.to_string(),
            path: path.to_string(),
            files: files.map(<[RemoteFile]>::to_vec),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_listener_forwards_events() {
        let (listener, mut rx) = ChannelListener::channel();

        listener.device_updated(&Device::new("S1"));
        listener.task_complete(false, Some("boom"));
        listener.files_listed("S1", "/sdcard/", None);

        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::DeviceUpdated { device } if device.serial() == "S1"
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::TaskComplete { success: false, message: Some(m) } if m == "boom"
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::FilesListed { files: None, .. }
        ));
    }

    #[test]
    fn test_send_after_receiver_dropped_is_silent() {
        let (listener, rx) = ChannelListener::channel();
        drop(rx);
        listener.error(&Error::discovery("gone"));
    }
}
