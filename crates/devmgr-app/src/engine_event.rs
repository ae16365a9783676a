//! Domain events emitted by the engine for external consumers
//!
//! Every listener callback has an `EngineEvent` counterpart. The headless
//! binary prints them as NDJSON; tests collect them through
//! [`crate::listener::ChannelListener`].

use devmgr_core::{Device, LogEntry, ProcessIdMap};
use devmgr_daemon::RemoteFile;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    // ─────────────────────────────────────────────────────────
    // Devices
    // ─────────────────────────────────────────────────────────
    /// Full device list after a discovery change
    DevicesUpdated { devices: Vec<Device> },

    /// One device's fields changed
    DeviceUpdated { device: Device },

    /// A device left the transport's list (it stays known, offline)
    DeviceRemoved { device: Device },

    /// Discovery or engine failure
    Error { message: String },

    // ─────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────
    LogEntries {
        serial: String,
        entries: Vec<LogEntry>,
    },

    ProcessMap {
        serial: String,
        processes: ProcessIdMap,
    },

    // ─────────────────────────────────────────────────────────
    // Tasks
    // ─────────────────────────────────────────────────────────
    TaskComplete {
        success: bool,
        message: Option<String>,
    },

    /// Directory listing; `files` is `None` when listing failed
    FilesListed {
        serial: String,
        path: String,
        files: Option<Vec<RemoteFile>>,
    },
}

impl EngineEvent {
    /// Short name for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::DevicesUpdated { .. } => "devices_updated",
            EngineEvent::DeviceUpdated { .. } => "device_updated",
            EngineEvent::DeviceRemoved { .. } => "device_removed",
            EngineEvent::Error { .. } => "error",
            EngineEvent::LogEntries { .. } => "log_entries",
            EngineEvent::ProcessMap { .. } => "process_map",
            EngineEvent::TaskComplete { .. } => "task_complete",
            EngineEvent::FilesListed { .. } => "files_listed",
        }
    }

    /// Device serial the event is about, if any
    pub fn serial(&self) -> Option<&str> {
        match self {
            EngineEvent::DeviceUpdated { device } | EngineEvent::DeviceRemoved { device } => {
                Some(device.serial())
            }
            EngineEvent::LogEntries { serial, .. }
            | EngineEvent::ProcessMap { serial, .. }
            | EngineEvent::FilesListed { serial, .. } => Some(serial),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_with_event_tag() {
        let event = EngineEvent::TaskComplete {
            success: true,
            message: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "task_complete");
        assert_eq!(json["success"], true);
        assert_eq!(event.event_type(), "task_complete");
    }

    #[test]
    fn test_device_event_serial() {
        let event = EngineEvent::DeviceRemoved {
            device: Device::new("10.0.0.2:5555"),
        };
        assert_eq!(event.serial(), Some("10.0.0.2:5555"));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["device"]["serial"], "10.0.0.2:5555");
    }
}
