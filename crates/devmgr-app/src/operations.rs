//! Device operations
//!
//! Every operation looks the device up first (an unknown serial is an
//! immediate error) and then runs on the [`TaskDispatcher`]. Progress is shown
//! through the device's `status`: set while running, then cleared or replaced
//! by the captured output. The returned `JoinHandle` may be awaited or dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use devmgr_core::prelude::*;
use devmgr_core::TaskResult;
use devmgr_daemon::{split_network_serial, DeviceTransport, ProcessRunner, RemoteFile, ShellExecutor};

use crate::details::DetailFetcher;
use crate::dispatcher::TaskDispatcher;
use crate::listener::{DeviceListener, FileListener, TaskListener};
use crate::registry::{DeviceHandle, DeviceRegistry};

pub const SCRIPT_TERMINAL: &str = "terminal.sh";
pub const SCRIPT_CUSTOM_COMMAND: &str = "custom-command.sh";
pub const SCRIPT_SET_PROPERTY: &str = "set-property.sh";
pub const SCRIPT_SCREENSHOT: &str = "screenshot.sh";
pub const SCRIPT_MIRROR: &str = "mirror.sh";

/// Helper scripts expected in the scripts directory
pub const KNOWN_SCRIPTS: [&str; 5] = [
    SCRIPT_TERMINAL,
    SCRIPT_CUSTOM_COMMAND,
    SCRIPT_SET_PROPERTY,
    SCRIPT_SCREENSHOT,
    SCRIPT_MIRROR,
];

pub const REBOOT_COMMAND: &str = "reboot";

/// Nesting limit for directory downloads (symlink loops)
const MAX_DOWNLOAD_DEPTH: usize = 32;

pub struct Operations<T> {
    shell: ShellExecutor<T>,
    runner: ProcessRunner,
    registry: Arc<DeviceRegistry>,
    dispatcher: TaskDispatcher,
    details: DetailFetcher<T>,
    scripts_dir: PathBuf,
    script_timeout: Duration,
    temp_dir: PathBuf,
}

impl<T> Clone for Operations<T> {
    fn clone(&self) -> Self {
        Self {
            shell: self.shell.clone(),
            runner: self.runner.clone(),
            registry: Arc::clone(&self.registry),
            dispatcher: self.dispatcher.clone(),
            details: self.details.clone(),
            scripts_dir: self.scripts_dir.clone(),
            script_timeout: self.script_timeout,
            temp_dir: self.temp_dir.clone(),
        }
    }
}

fn set_status(handle: &DeviceHandle, status: Option<String>, listener: &dyn DeviceListener) {
    let device = handle.update(|d| d.status = status);
    listener.device_updated(&device);
}

fn is_real_entry(file: &RemoteFile) -> bool {
    file.name != "." && file.name != ".."
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

impl<T: DeviceTransport + Send + Sync + 'static> Operations<T> {
    pub fn new(
        shell: ShellExecutor<T>,
        runner: ProcessRunner,
        registry: Arc<DeviceRegistry>,
        dispatcher: TaskDispatcher,
        details: DetailFetcher<T>,
        scripts_dir: PathBuf,
        script_timeout: Duration,
    ) -> Self {
        Self {
            shell,
            runner,
            registry,
            dispatcher,
            details,
            scripts_dir,
            script_timeout,
            temp_dir: std::env::temp_dir(),
        }
    }

    fn device(&self, serial: &str) -> Result<DeviceHandle> {
        self.registry
            .find(serial)
            .ok_or_else(|| Error::device_not_found(serial))
    }

    fn transport(&self) -> &Arc<T> {
        self.shell.transport()
    }

    /// Full path of a helper script
    pub fn script_path(&self, name: &str) -> PathBuf {
        self.scripts_dir.join(name)
    }

    /// Known helper scripts that are not present
    pub fn missing_scripts(&self) -> Vec<&'static str> {
        KNOWN_SCRIPTS
            .into_iter()
            .filter(|name| !self.script_path(name).is_file())
            .collect()
    }

    /// Run a script by name from the scripts directory
    pub async fn run_named_script(
        &self,
        name: &str,
        args: &[String],
        long_running: bool,
    ) -> TaskResult {
        self.runner
            .run_script(&self.script_path(name), args, long_running, self.script_timeout)
            .await
    }

    /// Queue `<script> <serial> <args..>` on the pool; the receiver yields
    /// its result.
    ///
    /// A known device shows the run in its `status`. An unknown serial is
    /// passed through as is. The receiver errors when the pool closed before
    /// the script started.
    pub fn submit_script(
        &self,
        serial: &str,
        name: &str,
        args: &[String],
        long_running: bool,
    ) -> oneshot::Receiver<TaskResult> {
        let (result_tx, result_rx) = oneshot::channel();
        let ops = self.clone();
        let handle = self.registry.find(serial);
        let script = name.to_string();
        let args: Vec<String> = std::iter::once(serial.to_string())
            .chain(args.iter().cloned())
            .collect();

        self.dispatcher.submit(format!("{} {}", name, serial), async move {
            if let Some(handle) = &handle {
                handle.update(|d| d.status = Some(format!("Running {}", script)));
            }
            let result = ops.run_named_script(&script, &args, long_running).await;
            if let Some(handle) = &handle {
                handle.update(|d| d.status = result.status_text(false));
            }
            let _ = result_tx.send(result);
            Ok(())
        });
        result_rx
    }

    /// Common shape of the script-backed operations
    #[allow(clippy::too_many_arguments)]
    fn script_operation(
        &self,
        serial: &str,
        status: &str,
        script: PathBuf,
        args: Vec<String>,
        long_running: bool,
        show_output: bool,
        listener: Arc<dyn DeviceListener>,
    ) -> Result<JoinHandle<()>> {
        let handle = self.device(serial)?;
        let ops = self.clone();
        let status = status.to_string();
        let name = format!(
            "{} {}",
            script.file_name().map_or_else(
                || script.display().to_string(),
                |n| n.to_string_lossy().into_owned()
            ),
            serial
        );

        Ok(self.dispatcher.submit(name, async move {
            set_status(&handle, Some(status), listener.as_ref());
            let result = ops
                .runner
                .run_script(&script, &args, long_running, ops.script_timeout)
                .await;
            set_status(&handle, result.status_text(show_output), listener.as_ref());
            Ok(())
        }))
    }

    /// Re-run the detail fetch for every online, ready device
    pub fn refresh_details(&self, listener: Arc<dyn DeviceListener>) -> Vec<JoinHandle<()>> {
        self.registry
            .all()
            .into_iter()
            .filter(|d| d.is_online && d.connection_state.is_ready())
            .filter_map(|d| self.details.submit(d.serial(), Arc::clone(&listener)))
            .collect()
    }

    /// Screen mirroring session; runs until the user closes it
    pub fn mirror(
        &self,
        serial: &str,
        listener: Arc<dyn DeviceListener>,
    ) -> Result<JoinHandle<()>> {
        let device = self.device(serial)?.snapshot();
        let title = match &device.phone {
            Some(phone) => format!("{serial}: {phone}"),
            None => serial.to_string(),
        };
        self.script_operation(
            serial,
            "mirroring...",
            self.script_path(SCRIPT_MIRROR),
            vec![serial.to_string(), title],
            true,
            false,
            listener,
        )
    }

    pub fn screenshot(
        &self,
        serial: &str,
        listener: Arc<dyn DeviceListener>,
    ) -> Result<JoinHandle<()>> {
        self.script_operation(
            serial,
            "screenshot...",
            self.script_path(SCRIPT_SCREENSHOT),
            vec![serial.to_string()],
            false,
            false,
            listener,
        )
    }

    /// Run an arbitrary local script as `<script> <serial> <temp_dir>`
    pub fn run_user_script(
        &self,
        serial: &str,
        script: &Path,
        listener: Arc<dyn DeviceListener>,
    ) -> Result<JoinHandle<()>> {
        self.script_operation(
            serial,
            "running script...",
            script.to_path_buf(),
            vec![serial.to_string(), self.temp_dir.display().to_string()],
            true,
            false,
            listener,
        )
    }

    /// Run a command through the custom-command helper and show its output
    pub fn run_custom_command(
        &self,
        serial: &str,
        command: &str,
        listener: Arc<dyn DeviceListener>,
    ) -> Result<JoinHandle<()>> {
        self.script_operation(
            serial,
            "running...",
            self.script_path(SCRIPT_CUSTOM_COMMAND),
            vec![serial.to_string(), command.to_string()],
            false,
            true,
            listener,
        )
    }

    pub fn open_terminal(
        &self,
        serial: &str,
        listener: Arc<dyn DeviceListener>,
    ) -> Result<JoinHandle<()>> {
        self.script_operation(
            serial,
            "terminal...",
            self.script_path(SCRIPT_TERMINAL),
            vec![serial.to_string()],
            true,
            false,
            listener,
        )
    }

    /// Persist a custom property on the device.
    ///
    /// Spaces travel to the helper as `~`; the cached value keeps them.
    pub fn set_property(
        &self,
        serial: &str,
        key: &str,
        value: &str,
        listener: Arc<dyn DeviceListener>,
    ) -> Result<JoinHandle<()>> {
        let handle = self.device(serial)?;
        let ops = self.clone();
        let key = key.to_string();
        let value = value.to_string();
        let args = vec![serial.to_string(), key.clone(), value.replace(' ', "~")];

        Ok(self
            .dispatcher
            .submit(format!("set-property {serial}"), async move {
                let result = ops.run_named_script(SCRIPT_SET_PROPERTY, &args, false).await;
                if result.success {
                    debug!("{}: set {}={}", handle.serial(), key, value);
                    let device = handle.update(|d| d.set_custom_property(key, value));
                    listener.device_updated(&device);
                } else {
                    set_status(&handle, result.status_text(false), listener.as_ref());
                }
                Ok(())
            }))
    }

    pub fn install_app(
        &self,
        serial: &str,
        apk: &Path,
        listener: Arc<dyn DeviceListener>,
    ) -> Result<JoinHandle<()>> {
        let handle = self.device(serial)?;
        let ops = self.clone();
        let apk = apk.to_path_buf();

        Ok(self
            .dispatcher
            .submit(format!("install {serial}"), async move {
                set_status(&handle, Some("installing...".to_string()), listener.as_ref());
                match ops.transport().install_package(handle.serial(), &apk).await {
                    Ok(()) => set_status(&handle, None, listener.as_ref()),
                    Err(e) => {
                        error!("Install of {} on {} failed: {}", apk.display(), handle.serial(), e);
                        set_status(&handle, Some(format!("failed: {e}")), listener.as_ref());
                    }
                }
                Ok(())
            }))
    }

    /// Push a local file to `dest` on the device
    pub fn copy_file(
        &self,
        serial: &str,
        local: &Path,
        dest: &str,
        listener: Arc<dyn DeviceListener>,
        done: Arc<dyn TaskListener>,
    ) -> Result<JoinHandle<()>> {
        let handle = self.device(serial)?;
        let ops = self.clone();
        let local = local.to_path_buf();
        let dest = dest.to_string();

        Ok(self
            .dispatcher
            .submit(format!("copy {serial}"), async move {
                set_status(&handle, Some("copying...".to_string()), listener.as_ref());
                match ops.transport().push_file(handle.serial(), &local, &dest).await {
                    Ok(()) => {
                        set_status(&handle, None, listener.as_ref());
                        done.task_complete(true, None);
                    }
                    Err(e) => {
                        let message = format!("failed: {e}");
                        set_status(&handle, Some(message.clone()), listener.as_ref());
                        done.task_complete(false, Some(&message));
                    }
                }
                Ok(())
            }))
    }

    pub fn restart(
        &self,
        serial: &str,
        listener: Arc<dyn DeviceListener>,
    ) -> Result<JoinHandle<()>> {
        let handle = self.device(serial)?;
        let ops = self.clone();

        Ok(self
            .dispatcher
            .submit(format!("restart {serial}"), async move {
                let result = ops.shell.run_task(handle.serial(), REBOOT_COMMAND).await;
                set_status(&handle, result.status_text(false), listener.as_ref());
                Ok(())
            }))
    }

    /// List a remote directory. `.` and `..` are filtered out; a failed
    /// listing is delivered as `None`.
    pub fn list_files(
        &self,
        serial: &str,
        path: &str,
        listener: Arc<dyn FileListener>,
    ) -> Result<JoinHandle<()>> {
        let handle = self.device(serial)?;
        let ops = self.clone();
        let path = with_trailing_slash(path);

        Ok(self
            .dispatcher
            .submit(format!("list {serial}"), async move {
                let serial = handle.serial();
                trace!("Listing {} on {}", path, serial);
                match ops.transport().list_directory(serial, &path).await {
                    Ok(files) => {
                        let files: Vec<RemoteFile> = files.into_iter().filter(is_real_entry).collect();
                        listener.files_listed(serial, &path, Some(&files));
                    }
                    Err(e) => {
                        error!("Listing {} on {} failed: {}", path, serial, e);
                        listener.files_listed(serial, &path, None);
                    }
                }
                Ok(())
            }))
    }

    /// Download a file or a whole directory tree to `local`.
    ///
    /// Completion reports success only when every entry was transferred.
    pub fn download(
        &self,
        serial: &str,
        entry: RemoteFile,
        local: &Path,
        done: Arc<dyn TaskListener>,
    ) -> Result<JoinHandle<()>> {
        let handle = self.device(serial)?;
        let ops = self.clone();
        let local = local.to_path_buf();

        Ok(self
            .dispatcher
            .submit(format!("download {serial}"), async move {
                debug!("Downloading {} -> {}", entry.path, local.display());
                let failures = ops.download_tree(handle.serial(), entry, local).await;
                if failures == 0 {
                    done.task_complete(true, None);
                } else {
                    let message = format!("{failures} item(s) failed to download");
                    done.task_complete(false, Some(&message));
                }
                Ok(())
            }))
    }

    /// Walk the remote tree with an explicit worklist; returns the number of
    /// entries that failed
    pub async fn download_tree(&self, serial: &str, root: RemoteFile, local: PathBuf) -> usize {
        let mut failures = 0;
        let mut worklist = vec![(root, local, 0usize)];

        while let Some((entry, dest, depth)) = worklist.pop() {
            if !entry.is_container() {
                trace!("Pulling {} -> {}", entry.path, dest.display());
                if let Err(e) = self.transport().pull_tree(serial, &entry.path, &dest).await {
                    error!("Download of {} failed: {}", entry.path, e);
                    failures += 1;
                }
                continue;
            }

            if depth >= MAX_DOWNLOAD_DEPTH {
                warn!("Not descending into {}: too deep", entry.path);
                failures += 1;
                continue;
            }
            if let Err(e) = tokio::fs::create_dir_all(&dest).await {
                error!("Cannot create {}: {}", dest.display(), e);
                failures += 1;
                continue;
            }

            match self
                .transport()
                .list_directory(serial, &with_trailing_slash(&entry.path))
                .await
            {
                Ok(children) => {
                    for child in children.into_iter().filter(is_real_entry) {
                        let child_dest = dest.join(&child.name);
                        worklist.push((child, child_dest, depth + 1));
                    }
                }
                Err(e) => {
                    error!("Listing {} failed: {}", entry.path, e);
                    failures += 1;
                }
            }
        }

        failures
    }

    /// `rm -rf` a remote path; any output counts as failure
    pub fn delete_file(
        &self,
        serial: &str,
        path: &str,
        done: Arc<dyn TaskListener>,
    ) -> Result<JoinHandle<()>> {
        let handle = self.device(serial)?;
        let ops = self.clone();
        let args = vec!["-rf".to_string(), path.to_string()];

        Ok(self
            .dispatcher
            .submit(format!("delete {serial}"), async move {
                match ops.shell.run_args(handle.serial(), "rm", &args).await {
                    Ok(output) if output.is_empty() => done.task_complete(true, None),
                    Ok(output) => {
                        warn!("Delete on {} reported: {:?}", handle.serial(), output);
                        done.task_complete(false, Some(&TaskResult::render(&output)));
                    }
                    Err(e) => done.task_complete(false, Some(&e.to_string())),
                }
                Ok(())
            }))
    }

    pub fn connect_device(&self, host: &str, port: u16, done: Arc<dyn TaskListener>) -> JoinHandle<()> {
        let ops = self.clone();
        let host = host.to_string();

        self.dispatcher
            .submit(format!("connect {host}:{port}"), async move {
                info!("Connecting to {}:{}", host, port);
                match ops
                    .transport()
                    .connect_network(&host, port)
                    .await
                    .with_context(|| format!("Connect to {}:{} failed", host, port))
                {
                    Ok(()) => done.task_complete(true, None),
                    Err(e) => done.task_complete(false, Some(&e.to_string())),
                }
                Ok(())
            })
    }

    /// Disconnect a `host:port` device; any other serial completes with failure
    pub fn disconnect_device(&self, serial: &str, done: Arc<dyn TaskListener>) -> JoinHandle<()> {
        let ops = self.clone();
        let serial = serial.to_string();

        self.dispatcher
            .submit(format!("disconnect {serial}"), async move {
                let (host, port) = match split_network_serial(&serial) {
                    Ok(address) => address,
                    Err(e) => {
                        error!("Cannot disconnect {}: {}", serial, e);
                        done.task_complete(false, Some(&e.to_string()));
                        return Ok(());
                    }
                };
                match ops
                    .transport()
                    .disconnect_network(&host, port)
                    .await
                    .with_context(|| format!("Disconnect of {} failed", serial))
                {
                    Ok(()) => done.task_complete(true, None),
                    Err(e) => done.task_complete(false, Some(&e.to_string())),
                }
                Ok(())
            })
    }

    pub fn send_text(
        &self,
        serial: &str,
        text: &str,
        done: Option<Arc<dyn TaskListener>>,
    ) -> Result<JoinHandle<()>> {
        let handle = self.device(serial)?;
        let ops = self.clone();
        let text = text.to_string();

        Ok(self
            .dispatcher
            .submit(format!("input-text {serial}"), async move {
                debug!("Sending text to {}", handle.serial());
                let result = ops.transport().send_text(handle.serial(), &text).await;
                report(result, done.as_deref());
                Ok(())
            }))
    }

    pub fn send_key_event(
        &self,
        serial: &str,
        code: u32,
        done: Option<Arc<dyn TaskListener>>,
    ) -> Result<JoinHandle<()>> {
        let handle = self.device(serial)?;
        let ops = self.clone();

        Ok(self
            .dispatcher
            .submit(format!("input-key {serial}"), async move {
                debug!("Sending key {} to {}", code, handle.serial());
                let result = ops.transport().send_key_event(handle.serial(), code).await;
                report(result, done.as_deref());
                Ok(())
            }))
    }
}

fn report(result: Result<()>, done: Option<&dyn TaskListener>) {
    let result = result.context("Input failed");
    if let Some(done) = done {
        match result {
            Ok(()) => done.task_complete(true, None),
            Err(e) => done.task_complete(false, Some(&e.to_string())),
        }
    }
}
