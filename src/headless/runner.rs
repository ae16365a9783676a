//! Headless mode runner - one function per `devmgr` subcommand
//!
//! Each runner forwards engine callbacks to stdout until its work is done or a
//! shutdown signal arrives, then shuts the engine down.

use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use devmgr_app::signals::shutdown_requested;
use devmgr_app::{ChannelListener, Engine, EngineEvent};
use devmgr_core::prelude::*;
use devmgr_daemon::DeviceTransport;

use super::{emit_engine_event, HeadlessEvent};

/// Follow device discovery until interrupted
pub async fn run_watch<T>(engine: &Engine<T>, mut shutdown: watch::Receiver<bool>) -> Result<()>
where
    T: DeviceTransport + Send + Sync + 'static,
{
    info!("Watching devices");
    let (listener, rx) = ChannelListener::channel();
    engine.start_discovery(Arc::new(listener));

    forward_events(rx, &mut shutdown).await;
    finish(engine).await;
    Ok(())
}

/// Stream logcat for one device until interrupted
pub async fn run_logs<T>(
    engine: &Engine<T>,
    serial: &str,
    since: Option<NaiveDateTime>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    T: DeviceTransport + Send + Sync + 'static,
{
    info!("Streaming logs for {} (since {:?})", serial, since);
    let (listener, rx) = ChannelListener::channel();
    engine.start_logs(serial, since, Arc::new(listener)).await;

    forward_events(rx, &mut shutdown).await;
    finish(engine).await;
    Ok(())
}

/// Run a helper script against one device. Returns whether it succeeded.
pub async fn run_script<T>(
    engine: &Engine<T>,
    serial: &str,
    name: &str,
    args: &[String],
    long_running: bool,
    mut shutdown: watch::Receiver<bool>,
) -> Result<bool>
where
    T: DeviceTransport + Send + Sync + 'static,
{
    info!("Running {} for {} {:?}", name, serial, args);
    let script = engine.run_script(serial, name, args, long_running);
    tokio::pin!(script);

    // On a signal the shutdown sweep kills the script; its result still follows
    let result = tokio::select! {
        result = &mut script => result,
        _ = shutdown_requested(&mut shutdown) => {
            warn!("Interrupted while running {}", name);
            let killed = engine.shutdown().await;
            let result = script.await;
            HeadlessEvent::script_finished(serial, name, result.clone()).emit();
            HeadlessEvent::shutdown(killed).emit();
            return Ok(result.success);
        }
    };

    let success = result.success;
    HeadlessEvent::script_finished(serial, name, result).emit();
    finish(engine).await;
    Ok(success)
}

/// Print the current device list, with details, and exit
pub async fn run_devices<T>(engine: &Engine<T>) -> Result<()>
where
    T: DeviceTransport + Send + Sync + 'static,
{
    let (listener, _rx) = ChannelListener::channel();
    let devices = engine.scan(Arc::new(listener)).await?;
    info!("Found {} device(s)", devices.len());

    emit_engine_event(&EngineEvent::DevicesUpdated { devices });
    finish(engine).await;
    Ok(())
}

async fn forward_events(
    mut rx: mpsc::UnboundedReceiver<EngineEvent>,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => emit_engine_event(&event),
                None => {
                    info!("Event channel closed");
                    break;
                }
            },
            _ = shutdown_requested(shutdown) => {
                info!("Quit requested");
                break;
            }
        }
    }
}

async fn finish<T>(engine: &Engine<T>)
where
    T: DeviceTransport + Send + Sync + 'static,
{
    let killed = engine.shutdown().await;
    HeadlessEvent::shutdown(killed).emit();
}
