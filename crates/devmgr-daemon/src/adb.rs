//! [`DeviceTransport`] backed by the `adb` command-line client

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::LazyLock;
use std::task::{Context, Poll};

use chrono::NaiveDateTime;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;

use devmgr_core::prelude::*;
use devmgr_core::{parse_getprop, ConnectionState};

use crate::transport::{DeviceTransport, RemoteFile, ShellStream, TransportDevice};

/// `ls -la` row as printed by toybox
static LS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([\-dlcbps])[rwxsStT\-]{9}\S*\s+\d+\s+\S+\s+\S+\s+(\d+)\s+(\d{4}-\d{2}-\d{2} \d{2}:\d{2})\s+(.+)$",
    )
    .expect("Invalid ls line regex")
});

/// Drives the `adb` executable with `tokio::process`
#[derive(Debug, Clone)]
pub struct AdbTransport {
    adb: PathBuf,
}

impl AdbTransport {
    pub fn new(adb: impl Into<PathBuf>) -> Self {
        Self { adb: adb.into() }
    }

    /// Resolve a configured adb path; bare names are looked up on `PATH`
    pub fn locate(configured: &str) -> Result<Self> {
        let path = Path::new(configured);
        if path.components().count() > 1 || path.is_absolute() {
            if path.is_file() {
                return Ok(Self::new(path));
            }
            return Err(Error::AdbNotFound);
        }
        which::which(configured)
            .map(Self::new)
            .map_err(|_| Error::AdbNotFound)
    }

    pub fn path(&self) -> &Path {
        &self.adb
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.adb);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::AdbNotFound
        } else {
            Error::ProcessSpawn {
                reason: format!("{}: {}", self.adb.display(), e),
            }
        }
    }

    /// Run `adb args..` to completion and return raw stdout
    async fn output_bytes(&self, args: &[&str]) -> Result<Vec<u8>> {
        trace!("adb {}", args.join(" "));
        let output = self
            .command()
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::transport(format!(
                "adb {} failed ({:?}): {}",
                args.join(" "),
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn output(&self, args: &[&str]) -> Result<String> {
        let bytes = self.output_bytes(args).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn device_output(&self, serial: &str, args: &[&str]) -> Result<String> {
        let mut full = vec!["-s", serial];
        full.extend_from_slice(args);
        self.output(&full).await
    }
}

impl DeviceTransport for AdbTransport {
    async fn list_devices(&self) -> Result<Vec<TransportDevice>> {
        let stdout = self.output(&["devices"]).await?;
        Ok(parse_device_list(&stdout))
    }

    async fn watch(&self, snapshots: mpsc::Sender<Vec<TransportDevice>>) -> Result<()> {
        let version = self.output(&["version"]).await?;
        debug!(
            "adb host: {}",
            version.lines().next().unwrap_or_default().trim()
        );

        let mut child = self
            .command()
            .arg("track-devices")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::discovery("track-devices has no stdout"))?;

        info!("Watching for device changes (pid {:?})", child.id());

        loop {
            let frame = read_track_frame(&mut stdout).await?;
            let devices = parse_device_list(&frame);
            if snapshots.send(devices).await.is_err() {
                debug!("Snapshot receiver dropped, ending device watch");
                let _ = child.kill().await;
                return Ok(());
            }
        }
    }

    async fn execute_shell(
        &self,
        serial: &str,
        command: &str,
        args: &[String],
    ) -> Result<ShellStream> {
        let mut child = self
            .command()
            .args(["-s", serial, "shell", command])
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transport("adb shell has no stdout"))?;

        Ok(Box::new(ChildOutput {
            _child: child,
            stdout,
        }))
    }

    async fn get_properties(&self, serial: &str) -> Result<HashMap<String, String>> {
        let stdout = self.device_output(serial, &["shell", "getprop"]).await?;
        Ok(parse_getprop(&stdout))
    }

    async fn pull_file(&self, serial: &str, remote_path: &str) -> Result<Vec<u8>> {
        let bytes = self
            .output_bytes(&["-s", serial, "exec-out", "cat", remote_path])
            .await?;
        // toybox cat exits 0 with this on some builds
        if bytes.starts_with(b"cat: ") && bytes.ends_with(b"No such file or directory\n") {
            return Err(Error::transport(format!("{} not found", remote_path)));
        }
        Ok(bytes)
    }

    async fn pull_tree(&self, serial: &str, remote_path: &str, local: &Path) -> Result<()> {
        let local = local.to_string_lossy();
        self.device_output(serial, &["pull", remote_path, &*local])
            .await
            .map(|_| ())
    }

    async fn list_directory(&self, serial: &str, path: &str) -> Result<Vec<RemoteFile>> {
        let stdout = self
            .device_output(serial, &["shell", "ls", "-la", path])
            .await?;
        Ok(stdout
            .lines()
            .filter_map(|line| parse_ls_line(path, line))
            .collect())
    }

    async fn install_package(&self, serial: &str, apk: &Path) -> Result<()> {
        let apk = apk.to_string_lossy();
        let stdout = self.device_output(serial, &["install", "-r", &*apk]).await?;
        match stdout.lines().find(|l| l.starts_with("Failure")) {
            Some(failure) => Err(Error::transport(failure.to_string())),
            None => Ok(()),
        }
    }

    async fn push_file(&self, serial: &str, local: &Path, remote_path: &str) -> Result<()> {
        let local = local.to_string_lossy();
        self.device_output(serial, &["push", &*local, remote_path])
            .await
            .map(|_| ())
    }

    async fn send_text(&self, serial: &str, text: &str) -> Result<()> {
        let escaped = escape_input_text(text);
        self.device_output(serial, &["shell", "input", "text", escaped.as_str()])
            .await
            .map(|_| ())
    }

    async fn send_key_event(&self, serial: &str, code: u32) -> Result<()> {
        let code = code.to_string();
        self.device_output(serial, &["shell", "input", "keyevent", code.as_str()])
            .await
            .map(|_| ())
    }

    async fn connect_network(&self, host: &str, port: u16) -> Result<()> {
        let address = format!("{host}:{port}");
        let stdout = self.output(&["connect", address.as_str()]).await?;
        // adb connect exits 0 even when it could not connect
        if stdout.contains("connected to") {
            Ok(())
        } else {
            Err(Error::transport(stdout.trim().to_string()))
        }
    }

    async fn disconnect_network(&self, host: &str, port: u16) -> Result<()> {
        let address = format!("{host}:{port}");
        let stdout = self.output(&["disconnect", address.as_str()]).await?;
        if stdout.contains("error") {
            Err(Error::transport(stdout.trim().to_string()))
        } else {
            Ok(())
        }
    }
}

/// stdout of a running `adb shell`; dropping it kills the adb client
struct ChildOutput {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for ChildOutput {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

/// Read one `track-devices` frame: four hex digits of length, then payload
async fn read_track_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::discovery(format!("device watch ended: {}", e)))?;

    let len_str = std::str::from_utf8(&len_buf)
        .map_err(|_| Error::discovery("malformed track-devices frame length"))?;
    let len = usize::from_str_radix(len_str, 16)
        .map_err(|_| Error::discovery(format!("malformed track-devices length {len_str:?}")))?;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::discovery(format!("device watch ended: {}", e)))?;

    Ok(String::from_utf8_lossy(&payload).into_owned())
}

/// Parse `adb devices` output or a `track-devices` payload
pub fn parse_device_list(output: &str) -> Vec<TransportDevice> {
    output
        .lines()
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            Some(TransportDevice::new(serial, ConnectionState::from_adb(state)))
        })
        .collect()
}

/// Parse one `ls -la` row inside `dir`; `.`/`..` and unparsable rows are skipped
pub fn parse_ls_line(dir: &str, line: &str) -> Option<RemoteFile> {
    let caps = LS_LINE.captures(line.trim_end())?;
    let kind = &caps[1];
    let is_symlink = kind == "l";
    let mut name = caps[4].to_string();
    if is_symlink {
        if let Some((link, _target)) = name.split_once(" -> ") {
            name = link.to_string();
        }
    }
    if name == "." || name == ".." {
        return None;
    }

    let mut file = RemoteFile::in_dir(dir, name);
    file.is_directory = kind == "d";
    file.is_symlink = is_symlink;
    file.size = caps[2].parse().unwrap_or(0);
    file.modified_time = NaiveDateTime::parse_from_str(&caps[3], "%Y-%m-%d %H:%M").ok();
    Some(file)
}

/// `input text` treats spaces as argument separators; `%s` is its escape
fn escape_input_text(text: &str) -> String {
    text.replace(' ', "%s")
}
