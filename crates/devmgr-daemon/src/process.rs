//! External helper process execution
//!
//! Every spawned child is handed to a dedicated wait task that owns it. The
//! wait task reports the exit status back to the caller and removes the child
//! from the [`ProcessTracker`] once it is gone. A caller that times out simply
//! stops waiting: the child keeps running, stays tracked, and is only killed
//! by [`ProcessTracker::kill_all`] during shutdown.
//!
//! On unix each child leads its own process group, so a kill reaches any
//! grandchildren a helper script started as well.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use devmgr_core::prelude::*;
use devmgr_core::TaskResult;

/// Default time a non-long-running helper is given to finish
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long output readers may keep draining after the child has exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A live child registered for the shutdown sweep
#[derive(Debug)]
struct TrackedProcess {
    name: String,
    pid: Option<u32>,
    /// Tells the wait task to kill the child
    kill_tx: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    live: HashMap<u64, TrackedProcess>,
    /// Signalled by `kill_all` but not reaped yet
    dying: HashSet<u64>,
}

/// Set of still-running child processes, guarded by its own lock.
#[derive(Debug, Default)]
pub struct ProcessTracker {
    inner: Mutex<TrackerInner>,
    next_id: AtomicU64,
    /// Notified whenever a process leaves the set
    changed: Notify,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, name: &str, pid: Option<u32>, kill_tx: oneshot::Sender<()>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().live.insert(
            id,
            TrackedProcess {
                name: name.to_string(),
                pid,
                kill_tx,
            },
        );
        id
    }

    fn unregister(&self, id: u64) {
        {
            let mut inner = self.lock();
            inner.live.remove(&id);
            inner.dying.remove(&id);
        }
        self.changed.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        // A panic while holding this lock cannot leave the map half-updated
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of tracked processes still alive
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force-terminate every tracked process. Returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        let drained: Vec<TrackedProcess> = {
            let mut inner = self.lock();
            let ids: Vec<u64> = inner.live.keys().copied().collect();
            inner.dying.extend(ids);
            inner.live.drain().map(|(_, p)| p).collect()
        };

        let count = drained.len();
        for process in drained {
            info!(
                "Killing tracked process {} (pid {:?})",
                process.name, process.pid
            );
            // The wait task may be exiting on its own; it unregisters either way
            let _ = process.kill_tx.send(());
        }
        count
    }

    /// Kill everything and wait up to `grace` for the wait tasks to reap them
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let killed = self.kill_all();
        if killed == 0 {
            return 0;
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.changed.notified();
            if self.lock().dying.is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!("Timed out waiting for killed processes to exit");
                break;
            }
        }
        killed
    }
}

/// Runs external helper programs and tracks them for shutdown
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    tracker: Arc<ProcessTracker>,
}

impl ProcessRunner {
    pub fn new(tracker: Arc<ProcessTracker>) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &Arc<ProcessTracker> {
        &self.tracker
    }

    /// Run `program args..`.
    ///
    /// `timeout: None` is the long-running mode: wait for natural completion
    /// however long it takes. With a timeout, exceeding it returns a failed
    /// result immediately; the child is not killed here.
    pub async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Option<Duration>,
        capture_output: bool,
    ) -> TaskResult {
        let started = Instant::now();
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());

        debug!("Running {} {:?}", program.display(), args);

        let mut command = Command::new(program);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command
            .args(args)
            .stdin(Stdio::null())
            .stdout(if capture_output {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true) // Safety net if the runtime goes away first
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn {}: {}", program.display(), e);
                return TaskResult::failure(format!("Exception: {}", e));
            }
        };

        let stdout_task = child.stdout.take().map(OutputReader::spawn);
        let stderr_task = child.stderr.take().map(OutputReader::spawn);

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel::<Option<ExitStatus>>();
        let id = self.tracker.register(&name, child.id(), kill_tx);

        tokio::spawn(wait_for_exit(
            child,
            name.clone(),
            kill_rx,
            exit_tx,
            Arc::clone(&self.tracker),
            id,
        ));

        let exit = match timeout {
            Some(limit) => match tokio::time::timeout(limit, exit_rx).await {
                Ok(exit) => exit,
                Err(_) => {
                    error!(
                        "{}: not finished after {:?} ({:?}), args: {:?}",
                        name,
                        limit,
                        started.elapsed(),
                        args
                    );
                    return TaskResult::failure(format!(
                        "{} timed out after {}s",
                        name,
                        limit.as_secs_f32()
                    ));
                }
            },
            None => exit_rx.await,
        };

        let status = exit.ok().flatten();

        // Background grandchildren can hold the pipes open past the exit
        let drain_deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_TIMEOUT;
        let stdout = join_lines(&name, stdout_task, drain_deadline).await;
        let stderr = join_lines(&name, stderr_task, drain_deadline).await;

        build_result(&name, status, stdout, stderr, started.elapsed())
    }

    /// Run a helper script with the default timeout, or unbounded when
    /// `long_running`
    pub async fn run_script(
        &self,
        script: &Path,
        args: &[String],
        long_running: bool,
        timeout: Duration,
    ) -> TaskResult {
        if !script.is_file() {
            error!("Script doesn't exist: {}", script.display());
            return TaskResult::failure(Error::script_not_found(script).to_string());
        }
        let timeout = (!long_running).then_some(timeout);
        self.run(script, args, timeout, true).await
    }
}

fn build_result(
    name: &str,
    status: Option<ExitStatus>,
    stdout: Vec<String>,
    mut stderr: Vec<String>,
    elapsed: Duration,
) -> TaskResult {
    let success = status.is_some_and(|s| s.success());

    if success {
        if !stdout.is_empty() {
            trace!("{}: {:?}, results: {:?}", name, elapsed, stdout);
        }
    } else {
        let code = status.and_then(|s| s.code());
        error!("{}: {:?}, rc: {:?}, stderr: {:?}", name, elapsed, code, stderr);
        if stderr.is_empty() {
            stderr.push(match code {
                Some(code) => format!("{} exited with code {}", name, code),
                None => format!("{} terminated abnormally", name),
            });
        }
    }

    TaskResult {
        success,
        stdout,
        stderr,
    }
}

/// Background task: owns `child`, reports how it ended and untracks it.
async fn wait_for_exit(
    mut child: Child,
    name: String,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<Option<ExitStatus>>,
    tracker: Arc<ProcessTracker>,
    id: u64,
) {
    let pid = child.id();
    let status = tokio::select! {
        result = child.wait() => match result {
            Ok(status) => Some(status),
            Err(e) => {
                error!("Error waiting for {}: {}", name, e);
                None
            }
        },
        Ok(()) = kill_rx => {
            info!("Kill signal received, force-killing {}", name);
            if let Some(pid) = pid {
                kill_process_group(pid, &name);
            }
            if let Err(e) = child.kill().await {
                error!("Failed to kill {}: {}", name, e);
            }
            child.wait().await.ok()
        }
    };

    tracker.unregister(id);
    // The caller may have stopped waiting after a timeout
    let _ = exit_tx.send(status);
}

/// SIGKILL the group led by `pid`
#[cfg(unix)]
fn kill_process_group(pid: u32, name: &str) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; a negative pid addresses the group
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        debug!(
            "Failed to kill process group of {}: {}",
            name,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32, _name: &str) {}

/// Lines collected from one output pipe by a background task
struct OutputReader {
    lines: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl OutputReader {
    fn spawn<R: AsyncRead + Unpin + Send + 'static>(reader: R) -> Self {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(read_lines(reader, Arc::clone(&lines)));
        Self { lines, task }
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

/// Collect non-empty lines until EOF
async fn read_lines<R: AsyncRead + Unpin>(reader: R, out: Arc<Mutex<Vec<String>>>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.is_empty() => continue,
            Ok(Some(line)) => out.lock().unwrap_or_else(|p| p.into_inner()).push(line),
            Ok(None) => break,
            Err(e) => {
                error!("Error reading process output: {}", e);
                break;
            }
        }
    }
}

/// Wait for a reader until `deadline`, then keep whatever it has read so far
async fn join_lines(
    name: &str,
    reader: Option<OutputReader>,
    deadline: tokio::time::Instant,
) -> Vec<String> {
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    if tokio::time::timeout_at(deadline, &mut reader.task)
        .await
        .is_err()
    {
        warn!("{}: output still open after exit, stopped reading", name);
        reader.task.abort();
    }
    reader.take()
}
