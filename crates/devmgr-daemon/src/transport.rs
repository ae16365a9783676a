//! Narrow capability interface over the device transport
//!
//! The engine never speaks the wire protocol itself. Everything it needs from
//! a device goes through [`DeviceTransport`]; [`crate::AdbTransport`] drives
//! the `adb` executable and the `test-helpers` feature provides an in-memory
//! mock.

use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use devmgr_core::prelude::*;
use devmgr_core::ConnectionState;

/// Raw output of a remote shell command. Dropping it ends the command.
pub type ShellStream = Box<dyn AsyncRead + Send + Unpin>;

/// One entry of a device-list snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDevice {
    pub serial: String,
    pub state: ConnectionState,
}

impl TransportDevice {
    pub fn new(serial: impl Into<String>, state: ConnectionState) -> Self {
        Self {
            serial: serial.into(),
            state,
        }
    }

    /// Shorthand for a device in the ready state
    pub fn ready(serial: impl Into<String>) -> Self {
        Self::new(serial, ConnectionState::Device)
    }
}

/// A file or directory on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    /// Absolute path on the device
    pub path: String,
    pub name: String,
    pub is_directory: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub modified_time: Option<NaiveDateTime>,
}

impl RemoteFile {
    /// Build an entry for `name` inside the remote directory `dir`
    pub fn in_dir(dir: &str, name: impl Into<String>) -> Self {
        let name = name.into();
        let path = if dir.ends_with('/') {
            format!("{dir}{name}")
        } else {
            format!("{dir}/{name}")
        };
        Self {
            path,
            name,
            is_directory: false,
            is_symlink: false,
            size: 0,
            modified_time: None,
        }
    }

    /// Directories and symlinks are walked rather than pulled
    pub fn is_container(&self) -> bool {
        self.is_directory || self.is_symlink
    }
}

/// Device transport capabilities consumed by the engine.
///
/// `watch` blocks until the transport fails: every device-list change is sent
/// as a full snapshot on `snapshots`. It returns `Ok(())` only when the
/// receiving side has gone away.
#[trait_variant::make(DeviceTransport: Send)]
pub trait LocalDeviceTransport {
    /// Current device list
    async fn list_devices(&self) -> Result<Vec<TransportDevice>>;

    /// Stream device-list snapshots until failure
    async fn watch(&self, snapshots: mpsc::Sender<Vec<TransportDevice>>) -> Result<()>;

    /// Start `command args..` in a remote shell and return its stdout
    async fn execute_shell(&self, serial: &str, command: &str, args: &[String])
        -> Result<ShellStream>;

    /// Full read-only property table
    async fn get_properties(&self, serial: &str) -> Result<HashMap<String, String>>;

    /// Contents of a single remote file
    async fn pull_file(&self, serial: &str, remote_path: &str) -> Result<Vec<u8>>;

    /// Copy a remote file or tree to a local destination
    async fn pull_tree(&self, serial: &str, remote_path: &str, local: &Path) -> Result<()>;

    /// Entries of a remote directory
    async fn list_directory(&self, serial: &str, path: &str) -> Result<Vec<RemoteFile>>;

    async fn install_package(&self, serial: &str, apk: &Path) -> Result<()>;

    async fn push_file(&self, serial: &str, local: &Path, remote_path: &str) -> Result<()>;

    async fn send_text(&self, serial: &str, text: &str) -> Result<()>;

    async fn send_key_event(&self, serial: &str, code: u32) -> Result<()>;

    async fn connect_network(&self, host: &str, port: u16) -> Result<()>;

    async fn disconnect_network(&self, host: &str, port: u16) -> Result<()>;
}

/// Split a `host:port` serial into its parts
pub fn split_network_serial(serial: &str) -> Result<(String, u16)> {
    let (host, port) = serial
        .rsplit_once(':')
        .ok_or_else(|| Error::invalid_address(serial))?;
    if host.is_empty() {
        return Err(Error::invalid_address(serial));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::invalid_address(serial))?;
    Ok((host.to_string(), port))
}
