//! Test utilities for transport consumers
//!
//! [`MockTransport`] is an in-memory [`DeviceTransport`] whose device-list
//! snapshots, shell output, properties and files are scripted by the test.
//! Every call is recorded so tests can assert on what the engine asked for.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use devmgr_core::prelude::*;
use devmgr_core::ConnectionState;

use crate::transport::{DeviceTransport, RemoteFile, ShellStream, TransportDevice};

/// Buffer size of scripted log streams
const LOG_PIPE_CAPACITY: usize = 64 * 1024;

enum WatchStep {
    Snapshot(Vec<TransportDevice>),
    Fail(String),
}

#[derive(Default)]
struct MockState {
    devices: Vec<TransportDevice>,
    shell_output: HashMap<String, String>,
    properties: HashMap<String, HashMap<String, String>>,
    files: HashMap<String, Vec<u8>>,
    directories: HashMap<String, Vec<RemoteFile>>,
    log_streams: HashMap<String, Vec<DuplexStream>>,
    failing: HashSet<String>,
    calls: Vec<String>,
    shell_delay: Option<Duration>,
}

/// In-memory transport for tests
pub struct MockTransport {
    state: Mutex<MockState>,
    watch_tx: mpsc::UnboundedSender<WatchStep>,
    watch_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WatchStep>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(MockState::default()),
            watch_tx,
            watch_rx: tokio::sync::Mutex::new(watch_rx),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }

    fn check(&self, call: &str) -> Result<()> {
        let state = self.lock();
        if state.failing.iter().any(|prefix| call.starts_with(prefix)) {
            return Err(Error::transport(format!("mock failure: {call}")));
        }
        Ok(())
    }

    /// Deliver a snapshot to the active `watch`
    pub fn push_snapshot(&self, devices: Vec<TransportDevice>) {
        self.lock().devices = devices.clone();
        let _ = self.watch_tx.send(WatchStep::Snapshot(devices));
    }

    /// Make the active `watch` return an error
    pub fn fail_watch(&self, message: &str) {
        let _ = self.watch_tx.send(WatchStep::Fail(message.to_string()));
    }

    /// Canned stdout for a shell command line (e.g. `"df"`)
    pub fn set_shell_output(&self, command_line: &str, output: &str) {
        self.lock()
            .shell_output
            .insert(command_line.to_string(), output.to_string());
    }

    pub fn set_properties(&self, serial: &str, props: &[(&str, &str)]) {
        let map = props
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.lock().properties.insert(serial.to_string(), map);
    }

    pub fn set_file(&self, serial: &str, remote_path: &str, content: &[u8]) {
        self.lock()
            .files
            .insert(file_key(serial, remote_path), content.to_vec());
    }

    pub fn set_directory(&self, remote_path: &str, entries: Vec<RemoteFile>) {
        self.lock()
            .directories
            .insert(remote_path.to_string(), entries);
    }

    /// Every recorded call starting with `prefix` fails from now on
    pub fn fail_calls(&self, prefix: &str) {
        self.lock().failing.insert(prefix.to_string());
    }

    /// Delay every shell command by `delay`
    pub fn set_shell_delay(&self, delay: Duration) {
        self.lock().shell_delay = Some(delay);
    }

    /// Writer end of the next `logcat` stream opened for `serial`
    pub fn log_stream(&self, serial: &str) -> DuplexStream {
        let (reader, writer) = tokio::io::duplex(LOG_PIPE_CAPACITY);
        self.lock()
            .log_streams
            .entry(serial.to_string())
            .or_default()
            .push(reader);
        writer
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

fn file_key(serial: &str, path: &str) -> String {
    format!("{serial}:{path}")
}

impl DeviceTransport for MockTransport {
    async fn list_devices(&self) -> Result<Vec<TransportDevice>> {
        self.record("list".to_string());
        Ok(self.lock().devices.clone())
    }

    async fn watch(&self, snapshots: mpsc::Sender<Vec<TransportDevice>>) -> Result<()> {
        self.record("watch".to_string());
        let mut rx = self.watch_rx.lock().await;
        while let Some(step) = rx.recv().await {
            match step {
                WatchStep::Snapshot(devices) => {
                    if snapshots.send(devices).await.is_err() {
                        return Ok(());
                    }
                }
                WatchStep::Fail(message) => return Err(Error::discovery(message)),
            }
        }
        Ok(())
    }

    async fn execute_shell(
        &self,
        serial: &str,
        command: &str,
        args: &[String],
    ) -> Result<ShellStream> {
        let command_line = std::iter::once(command.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        let call = format!("shell {serial} {command_line}");
        self.record(call.clone());
        self.check(&call)?;

        let delay = self.lock().shell_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if command == "logcat" {
            let stream = self
                .lock()
                .log_streams
                .get_mut(serial)
                .and_then(|streams| (!streams.is_empty()).then(|| streams.remove(0)));
            if let Some(stream) = stream {
                return Ok(Box::new(stream));
            }
        }

        let output = self
            .lock()
            .shell_output
            .get(&command_line)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(std::io::Cursor::new(output.into_bytes())))
    }

    async fn get_properties(&self, serial: &str) -> Result<HashMap<String, String>> {
        let call = format!("getprop {serial}");
        self.record(call.clone());
        self.check(&call)?;
        Ok(self
            .lock()
            .properties
            .get(serial)
            .cloned()
            .unwrap_or_default())
    }

    async fn pull_file(&self, serial: &str, remote_path: &str) -> Result<Vec<u8>> {
        let call = format!("pull {serial} {remote_path}");
        self.record(call.clone());
        self.check(&call)?;
        self.lock()
            .files
            .get(&file_key(serial, remote_path))
            .cloned()
            .ok_or_else(|| Error::transport(format!("{remote_path} not found")))
    }

    async fn pull_tree(&self, serial: &str, remote_path: &str, local: &Path) -> Result<()> {
        let call = format!("pull_tree {serial} {remote_path}");
        self.record(call.clone());
        self.check(&call)?;
        let content = self
            .lock()
            .files
            .get(&file_key(serial, remote_path))
            .cloned()
            .ok_or_else(|| Error::transport(format!("{remote_path} not found")))?;
        std::fs::write(local, content)?;
        Ok(())
    }

    async fn list_directory(&self, serial: &str, path: &str) -> Result<Vec<RemoteFile>> {
        let call = format!("list {serial} {path}");
        self.record(call.clone());
        self.check(&call)?;
        self.lock()
            .directories
            .get(path)
            .cloned()
            .ok_or_else(|| Error::transport(format!("{path}: No such file or directory")))
    }

    async fn install_package(&self, serial: &str, apk: &Path) -> Result<()> {
        let call = format!("install {serial} {}", apk.display());
        self.record(call.clone());
        self.check(&call)
    }

    async fn push_file(&self, serial: &str, local: &Path, remote_path: &str) -> Result<()> {
        let call = format!("push {serial} {} {remote_path}", local.display());
        self.record(call.clone());
        self.check(&call)
    }

    async fn send_text(&self, serial: &str, text: &str) -> Result<()> {
        let call = format!("text {serial} {text}");
        self.record(call.clone());
        self.check(&call)
    }

    async fn send_key_event(&self, serial: &str, code: u32) -> Result<()> {
        let call = format!("key {serial} {code}");
        self.record(call.clone());
        self.check(&call)
    }

    async fn connect_network(&self, host: &str, port: u16) -> Result<()> {
        let call = format!("connect {host}:{port}");
        self.record(call.clone());
        self.check(&call)
    }

    async fn disconnect_network(&self, host: &str, port: u16) -> Result<()> {
        let call = format!("disconnect {host}:{port}");
        self.record(call.clone());
        self.check(&call)
    }
}

/// A ready device entry for a snapshot
pub fn ready(serial: &str) -> TransportDevice {
    TransportDevice::ready(serial)
}

/// A device entry in some other state
pub fn in_state(serial: &str, state: ConnectionState) -> TransportDevice {
    TransportDevice::new(serial, state)
}
