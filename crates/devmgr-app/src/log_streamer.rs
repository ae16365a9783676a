//! LogStreamer - per-device logcat tail with a process-name side channel
//!
//! Each active stream owns a [`CancelToken`] and two tasks:
//! - the tail, reading `logcat -v threadtime` and delivering timed batches
//! - the process refresh, rebuilding the pid → name table on start and then
//!   every `process_refresh` for as long as the token is live
//!
//! Starting a stream for a device that already has one cancels the old one
//! and waits for its tail to exit first, so a device never has two. A tail
//! that ends on its own cancels the token too and removes its entry, which
//! stops the refresh and releases the listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use devmgr_core::prelude::*;
use devmgr_core::{parse_process_map, LogEntry, ProcessIdMap};
use devmgr_daemon::{DeviceTransport, ShellExecutor};

use crate::config::LogSettings;
use crate::listener::LogListener;
use crate::log_batcher::LogBatcher;

pub const PROCESS_LIST_COMMAND: &str = "ps -A -o PID,ARGS";

const LOGCAT_COMMAND: &str = "logcat";
const LOGCAT_FORMAT: [&str; 2] = ["-v", "threadtime"];

/// How long `stop_all` waits for each tail to wind down
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Cooperative cancellation flag shared by a stream's tasks
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Whether both handles share one flag
    pub fn same(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Idle = 0,
    Starting = 1,
    Streaming = 2,
    Stopping = 3,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Streaming,
            3 => Self::Stopping,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Default)]
struct SharedState(AtomicU8);

impl SharedState {
    fn get(&self) -> StreamState {
        StreamState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: StreamState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

struct ActiveStream {
    token: CancelToken,
    state: Arc<SharedState>,
    tail: JoinHandle<()>,
    refresh: JoinHandle<()>,
}

impl ActiveStream {
    fn stop(&self) {
        if !self.tail.is_finished() {
            self.state.set(StreamState::Stopping);
        }
        self.token.cancel();
    }

    async fn stop_and_wait(self) {
        self.stop();
        if tokio::time::timeout(STOP_GRACE, self.tail).await.is_err() {
            warn!("Log tail did not stop within {:?}", STOP_GRACE);
        }
        // The refresh task only sleeps; it sees the token on wake-up
        drop(self.refresh);
    }
}

type StreamMap = Mutex<HashMap<String, ActiveStream>>;

fn lock_streams(streams: &StreamMap) -> MutexGuard<'_, HashMap<String, ActiveStream>> {
    streams.lock().unwrap_or_else(|p| p.into_inner())
}

/// Everything a stream's tasks need
struct StreamContext<T> {
    shell: ShellExecutor<T>,
    serial: String,
    since: Option<NaiveDateTime>,
    token: CancelToken,
    state: Arc<SharedState>,
    listener: Arc<dyn LogListener>,
    processes: Arc<RwLock<ProcessIdMap>>,
    settings: LogSettings,
    streams: Arc<StreamMap>,
}

pub struct LogStreamer<T> {
    shell: ShellExecutor<T>,
    settings: LogSettings,
    streams: Arc<StreamMap>,
}

impl<T: DeviceTransport + Send + Sync + 'static> LogStreamer<T> {
    pub fn new(shell: ShellExecutor<T>, settings: LogSettings) -> Self {
        Self {
            shell,
            settings,
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveStream>> {
        lock_streams(&self.streams)
    }

    /// Start streaming `serial`, replacing any stream it already has.
    ///
    /// Lines without a parsable timestamp are dropped, as are lines stamped
    /// before `since`.
    pub async fn start(
        &self,
        serial: &str,
        since: Option<NaiveDateTime>,
        listener: Arc<dyn LogListener>,
    ) {
        let previous = self.lock().remove(serial);
        if let Some(previous) = previous {
            debug!("Stopping previous log stream for {}", serial);
            previous.stop_and_wait().await;
        }

        debug!("Starting log stream for {} (since {:?})", serial, since);
        let token = CancelToken::new();
        let state = Arc::new(SharedState::default());
        state.set(StreamState::Starting);

        let ctx = Arc::new(StreamContext {
            shell: self.shell.clone(),
            serial: serial.to_string(),
            since,
            token: token.clone(),
            state: Arc::clone(&state),
            listener,
            processes: Arc::new(RwLock::new(ProcessIdMap::new())),
            settings: self.settings.clone(),
            streams: Arc::clone(&self.streams),
        });

        // Spawn under the lock so a tail that fails at once finds its entry
        let mut streams = self.lock();
        let active = ActiveStream {
            token,
            state,
            tail: tokio::spawn(tail_logs(Arc::clone(&ctx))),
            refresh: tokio::spawn(refresh_processes(ctx)),
        };
        if let Some(raced) = streams.insert(serial.to_string(), active) {
            raced.stop();
        }
    }

    /// Ask the stream for `serial` to end. Returns false when none was active.
    pub fn stop(&self, serial: &str) -> bool {
        match self.lock().remove(serial) {
            Some(active) => {
                debug!("Stopping log stream for {}", serial);
                active.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every stream and wait briefly for the tails to exit
    pub async fn stop_all(&self) {
        let active: Vec<(String, ActiveStream)> = self.lock().drain().collect();
        if !active.is_empty() {
            info!("Stopping {} log stream(s)", active.len());
        }
        for (_, stream) in active {
            stream.stop_and_wait().await;
        }
    }

    pub fn state(&self, serial: &str) -> StreamState {
        self.lock()
            .get(serial)
            .map(|active| active.state.get())
            .unwrap_or(StreamState::Idle)
    }

    pub fn is_streaming(&self, serial: &str) -> bool {
        matches!(
            self.state(serial),
            StreamState::Starting | StreamState::Streaming
        )
    }

    /// Devices with a stream that has not exited yet
    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|active| !active.tail.is_finished())
            .count()
    }
}

async fn tail_logs<T: DeviceTransport + Send + Sync>(ctx: Arc<StreamContext<T>>) {
    read_stream(&ctx).await;
    finish_stream(&ctx);
    debug!("Log tail for {} done", ctx.serial);
}

/// Mark the stream idle, stop its refresh and drop its entry if still current
fn finish_stream<T>(ctx: &StreamContext<T>) {
    ctx.token.cancel();
    ctx.state.set(StreamState::Idle);

    let mut streams = lock_streams(&ctx.streams);
    if streams
        .get(&ctx.serial)
        .is_some_and(|active| active.token.same(&ctx.token))
    {
        streams.remove(&ctx.serial);
    }
}

async fn read_stream<T: DeviceTransport + Send + Sync>(ctx: &StreamContext<T>) {
    let args: Vec<String> = LOGCAT_FORMAT.iter().map(|s| s.to_string()).collect();

    let opened = tokio::select! {
        biased;
        _ = ctx.token.cancelled() => None,
        stream = ctx.shell.transport().execute_shell(&ctx.serial, LOGCAT_COMMAND, &args) => Some(stream),
    };
    let stream = match opened {
        Some(Ok(stream)) => stream,
        Some(Err(e)) => {
            error!("Failed to open log stream for {}: {}", ctx.serial, e);
            return;
        }
        None => return,
    };
    ctx.state.set(StreamState::Streaming);

    let mut lines = BufReader::new(stream).lines();
    let mut batcher = LogBatcher::new(ctx.settings.flush_interval());

    loop {
        let wait = batcher.time_until_flush();
        tokio::select! {
            biased;
            _ = ctx.token.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(entry) = accept_line(&line, ctx.since) {
                        batcher.add(entry);
                    }
                }
                Ok(None) => {
                    debug!("Log stream for {} ended", ctx.serial);
                    break;
                }
                Err(e) => {
                    warn!("Log stream for {} failed: {}", ctx.serial, e);
                    break;
                }
            },
            _ = tokio::time::sleep(wait), if batcher.has_pending() => {}
        }

        if batcher.should_flush() {
            deliver(ctx, batcher.flush());
            if ctx.token.is_cancelled() {
                break;
            }
        }
    }

    if batcher.has_pending() && !ctx.token.is_cancelled() {
        deliver(ctx, batcher.flush());
    }
}

/// Parse a line; `None` when it has no timestamp or predates `since`
pub fn accept_line(line: &str, since: Option<NaiveDateTime>) -> Option<LogEntry> {
    let entry = LogEntry::parse(line);
    let timestamp = entry.timestamp?;
    if since.is_some_and(|since| timestamp < since) {
        return None;
    }
    Some(entry)
}

fn deliver<T>(ctx: &StreamContext<T>, mut entries: Vec<LogEntry>) {
    if entries.is_empty() {
        return;
    }
    {
        let processes = ctx.processes.read().unwrap_or_else(|p| p.into_inner());
        if !processes.is_empty() {
            for entry in &mut entries {
                entry.annotate(&processes);
            }
        }
    }
    ctx.listener.log_entries(&ctx.serial, &entries);
}

/// Rebuild the pid table now, then again after every refresh delay.
///
/// The next run is scheduled only after the current one completes, so a slow
/// `ps` never overlaps with itself.
async fn refresh_processes<T: DeviceTransport + Send + Sync>(ctx: Arc<StreamContext<T>>) {
    let every = ctx.settings.process_refresh();
    loop {
        if ctx.token.is_cancelled() {
            break;
        }

        let lines = ctx.shell.run_lines(&ctx.serial, PROCESS_LIST_COMMAND).await;
        let processes = parse_process_map(&lines);
        if processes.is_empty() {
            trace!("Empty process table for {}", ctx.serial);
        } else if !ctx.token.is_cancelled() {
            *ctx.processes.write().unwrap_or_else(|p| p.into_inner()) = processes.clone();
            ctx.listener.process_map(&ctx.serial, &processes);
        }

        tokio::select! {
            _ = ctx.token.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
    }
    trace!("Process refresh for {} done", ctx.serial);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ChannelListener;
    use crate::EngineEvent;
    use devmgr_core::parse_since;
    use devmgr_daemon::test_utils::MockTransport;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn settings() -> LogSettings {
        LogSettings {
            flush_interval_ms: 20,
            process_refresh_secs: 30,
        }
    }

    fn streamer(mock: &Arc<MockTransport>) -> LogStreamer<MockTransport> {
        LogStreamer::new(ShellExecutor::new(Arc::clone(mock)), settings())
    }

    async fn wait_for_state(streamer: &LogStreamer<MockTransport>, serial: &str, state: StreamState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while streamer.state(serial) != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stream never reached the expected state");
    }

    async fn next_entries(rx: &mut UnboundedReceiver<EngineEvent>) -> Vec<LogEntry> {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("no log batch delivered")
                .expect("channel closed");
            if let EngineEvent::LogEntries { entries, .. } = event {
                return entries;
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_token() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        assert!(!token.is_cancelled());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_accept_line_filters() {
        let since = parse_since("10-16 11:34:18");
        assert!(accept_line("--------- beginning of main", since).is_none());
        assert!(accept_line("10-16 11:34:17.100  1  2 I Tag: old", since).is_none());
        let entry = accept_line("10-16 11:34:19.100  1  2 I Tag: new", since).unwrap();
        assert_eq!(entry.message, "new");
        assert!(accept_line("10-16 11:34:17.100  1  2 I Tag: old", None).is_some());
    }

    #[tokio::test]
    async fn test_stream_drops_unparsable_and_old_lines() {
        let mock = Arc::new(MockTransport::new());
        let mut writer = mock.log_stream("S1");
        let streamer = streamer(&mock);
        let (listener, mut rx) = ChannelListener::channel();

        streamer
            .start("S1", parse_since("10-16 11:34:18"), Arc::new(listener))
            .await;

        writer
            .write_all(
                b"--------- beginning of main\n\
                  10-16 11:34:17.000  10  11 I Old: before cut-off\n\
                  10-16 11:34:19.000  10  11 W New: kept\n",
            )
            .await
            .unwrap();
        drop(writer);

        let entries = next_entries(&mut rx).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "kept");
        wait_for_state(&streamer, "S1", StreamState::Idle).await;
    }

    #[tokio::test]
    async fn test_pending_lines_flush_on_tick() {
        let mock = Arc::new(MockTransport::new());
        let mut writer = mock.log_stream("S1");
        let streamer = streamer(&mock);
        let (listener, mut rx) = ChannelListener::channel();

        streamer.start("S1", None, Arc::new(listener)).await;
        writer
            .write_all(b"10-16 11:34:19.000  10  11 I Tag: lonely line\n")
            .await
            .unwrap();

        // Writer stays open: only the tick can deliver it
        let entries = next_entries(&mut rx).await;
        assert_eq!(entries[0].message, "lonely line");
        assert!(streamer.is_streaming("S1"));
        streamer.stop_all().await;
    }

    #[tokio::test]
    async fn test_second_start_replaces_first() {
        let mock = Arc::new(MockTransport::new());
        let mut first = mock.log_stream("S1");
        let mut second = mock.log_stream("S1");
        let streamer = streamer(&mock);
        let (listener, mut rx) = ChannelListener::channel();
        let listener: Arc<dyn LogListener> = Arc::new(listener);

        streamer.start("S1", None, Arc::clone(&listener)).await;
        wait_for_state(&streamer, "S1", StreamState::Streaming).await;
        streamer.start("S1", None, listener).await;
        wait_for_state(&streamer, "S1", StreamState::Streaming).await;

        assert_eq!(streamer.active_count(), 1);
        // The first tail has exited and dropped its end of the pipe
        assert!(first.write_all(b"10-16 11:34:19.000  1  2 I A: x\n").await.is_err());

        second
            .write_all(b"10-16 11:34:19.000  1  2 I B: from second\n")
            .await
            .unwrap();
        let entries = next_entries(&mut rx).await;
        assert_eq!(entries[0].message, "from second");
        streamer.stop_all().await;
    }

    #[tokio::test]
    async fn test_process_map_is_delivered_and_annotates_entries() {
        let mock = Arc::new(MockTransport::new());
        mock.set_shell_output(PROCESS_LIST_COMMAND, "  PID ARGS\n 1234 com.example.app\n");
        let mut writer = mock.log_stream("S1");
        let streamer = streamer(&mock);
        let (listener, mut rx) = ChannelListener::channel();

        streamer.start("S1", None, Arc::new(listener)).await;

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            EngineEvent::ProcessMap { processes, .. } => {
                assert_eq!(processes.get("1234").map(String::as_str), Some("com.example.app"));
            }
            other => panic!("expected process map, got {other:?}"),
        }

        writer
            .write_all(b"10-16 11:34:19.000  1234  1256 I Tag: hello\n")
            .await
            .unwrap();
        let entries = next_entries(&mut rx).await;
        assert_eq!(entries[0].process_name.as_deref(), Some("com.example.app"));
        streamer.stop_all().await;
    }

    #[tokio::test]
    async fn test_ended_stream_stops_refresh_and_releases_listener() {
        let mock = Arc::new(MockTransport::new());
        mock.set_shell_output(PROCESS_LIST_COMMAND, "  PID ARGS\n 1234 com.example.app\n");
        let writer = mock.log_stream("S1");
        let streamer = LogStreamer::new(
            ShellExecutor::new(Arc::clone(&mock)),
            LogSettings {
                flush_interval_ms: 20,
                process_refresh_secs: 1,
            },
        );
        let (listener, mut rx) = ChannelListener::channel();

        streamer.start("S1", None, Arc::new(listener)).await;
        wait_for_state(&streamer, "S1", StreamState::Streaming).await;
        drop(writer);
        wait_for_state(&streamer, "S1", StreamState::Idle).await;
        assert_eq!(streamer.active_count(), 0);

        // Every sender is gone once both tasks have exited
        tokio::time::timeout(Duration::from_secs(2), async {
            while rx.recv().await.is_some() {}
        })
        .await
        .expect("listener was never released");

        let refreshes = mock.count_calls("shell S1 ps");
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(mock.count_calls("shell S1 ps"), refreshes);
        assert!(!streamer.stop("S1"));
    }

    #[tokio::test]
    async fn test_failed_open_leaves_no_stream() {
        let mock = Arc::new(MockTransport::new());
        mock.fail_calls("shell S1 logcat");
        let streamer = streamer(&mock);
        let (listener, _rx) = ChannelListener::channel();

        streamer.start("S1", None, Arc::new(listener)).await;
        wait_for_state(&streamer, "S1", StreamState::Idle).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(streamer.active_count(), 0);
        assert!(!streamer.stop("S1"));
    }

    #[tokio::test]
    async fn test_stop() {
        let mock = Arc::new(MockTransport::new());
        let _writer = mock.log_stream("S1");
        let streamer = streamer(&mock);
        let (listener, _rx) = ChannelListener::channel();

        streamer.start("S1", None, Arc::new(listener)).await;
        assert!(streamer.stop("S1"));
        assert!(!streamer.is_streaming("S1"));
        assert!(!streamer.stop("S1"));
        assert_eq!(streamer.active_count(), 0);
    }
}
