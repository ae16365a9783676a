//! # devmgr-daemon - Device Transport and Process Management
//!
//! Talks to devices through the `adb` executable and runs local helper
//! scripts. Everything above this crate sees devices only through the
//! [`DeviceTransport`] capability trait.
//!
//! Depends on [`devmgr_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Transport
//! - [`DeviceTransport`] - Capability trait (list, watch, shell, pull, push, install, input)
//! - [`AdbTransport`] - Implementation over the `adb` client binary
//! - [`TransportDevice`] - One entry of a device-list snapshot
//! - [`RemoteFile`] - Directory listing entry
//!
//! ### Shell
//! - [`ShellExecutor`] - Run a remote command line and collect its output lines
//!
//! ### Local Processes
//! - [`ProcessRunner`] - Spawn scripts with output capture and a timeout
//! - [`ProcessTracker`] - Registry of live children for the shutdown sweep

pub mod adb;
pub mod process;
pub mod shell;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod transport;

pub use adb::{parse_device_list, parse_ls_line, AdbTransport};
pub use process::{ProcessRunner, ProcessTracker, DEFAULT_SCRIPT_TIMEOUT};
pub use shell::{split_command, ShellExecutor};
pub use transport::{
    split_network_serial, DeviceTransport, LocalDeviceTransport, RemoteFile, ShellStream,
    TransportDevice,
};
