//! Headless mode - NDJSON event output
//!
//! Every engine event is written to stdout as one JSON object per line, with a
//! millisecond `timestamp` added. The `event` field names the event type.
//!
//! # Example Output
//!
//! ```json
//! {"event":"device_updated","device":{"serial":"emulator-5554",...},"timestamp":1704700001000}
//! {"event":"log_entries","serial":"emulator-5554","entries":[...],"timestamp":1704700002000}
//! {"event":"script_finished","serial":"emulator-5554","script":"screenshot.sh","success":true,...}
//! ```

pub mod runner;

use std::io::{self, Write};

use chrono::Utc;
use serde::Serialize;
use tracing::error;

use devmgr_app::EngineEvent;

/// Events that only the command-line frontend produces
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// A `script` command finished
    ScriptFinished {
        serial: String,
        script: String,
        success: bool,
        stdout: Vec<String>,
        stderr: Vec<String>,
        timestamp: i64,
    },

    /// The engine shut down
    Shutdown { killed: usize, timestamp: i64 },
}

impl HeadlessEvent {
    /// Emit this event to stdout as JSON
    pub fn emit(&self) {
        write_line(self);
    }

    /// Get current timestamp in milliseconds
    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub fn script_finished(serial: &str, script: &str, result: devmgr_core::TaskResult) -> Self {
        Self::ScriptFinished {
            serial: serial.to_string(),
            script: script.to_string(),
            success: result.success,
            stdout: result.stdout,
            stderr: result.stderr,
            timestamp: Self::now(),
        }
    }

    pub fn shutdown(killed: usize) -> Self {
        Self::Shutdown {
            killed,
            timestamp: Self::now(),
        }
    }
}

/// Engine event with the emission time
#[derive(Serialize)]
struct Stamped<'a> {
    #[serde(flatten)]
    event: &'a EngineEvent,
    timestamp: i64,
}

/// Emit an engine event to stdout as JSON
pub fn emit_engine_event(event: &EngineEvent) {
    write_line(&Stamped {
        event,
        timestamp: HeadlessEvent::now(),
    });
}

fn write_line(value: &impl Serialize) {
    let json = match serde_json::to_string(value) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize headless event: {}", e);
            return;
        }
    };

    // NDJSON: one object per line, flushed immediately
    let mut stdout = io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{}", json) {
        error!("Failed to write headless event to stdout: {}", e);
        return;
    }
    if let Err(e) = stdout.flush() {
        error!("Failed to flush headless stdout: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_finished_serialization() {
        let result = devmgr_core::TaskResult::success(vec!["saved".to_string()]);
        let event = HeadlessEvent::script_finished("S1", "screenshot.sh", result);
        let json = serde_json::to_string(&event).expect("serialization failed");

        let value: serde_json::Value = serde_json::from_str(&json).expect("invalid JSON");
        assert_eq!(value["event"], "script_finished");
        assert_eq!(value["serial"], "S1");
        assert_eq!(value["success"], true);
        assert_eq!(value["stdout"][0], "saved");
        assert!(value["timestamp"].is_number());
    }

    #[test]
    fn test_stamped_engine_event_keeps_tag() {
        let event = EngineEvent::TaskComplete {
            success: false,
            message: Some("failed".to_string()),
        };
        let json = serde_json::to_string(&Stamped {
            event: &event,
            timestamp: 42,
        })
        .expect("serialization failed");

        let value: serde_json::Value = serde_json::from_str(&json).expect("invalid JSON");
        assert_eq!(value["event"], "task_complete");
        assert_eq!(value["success"], false);
        assert_eq!(value["timestamp"], 42);
    }

    #[test]
    fn test_shutdown_serialization() {
        let json = serde_json::to_string(&HeadlessEvent::shutdown(2)).expect("serialization failed");
        let value: serde_json::Value = serde_json::from_str(&json).expect("invalid JSON");
        assert_eq!(value["event"], "shutdown");
        assert_eq!(value["killed"], 2);
    }
}
