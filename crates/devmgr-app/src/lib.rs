//! devmgr-app - Device coordination engine for Device Manager
//!
//! Keeps the registry of known devices in sync with the transport, fetches
//! device details once per device, streams logcat output in batches and runs
//! device operations on a bounded worker pool. Results reach the frontend
//! through the listener traits in [`listener`].

pub mod config;
pub mod details;
pub mod discovery;
pub mod dispatcher;
pub mod engine;
pub mod engine_event;
pub mod listener;
pub mod log_batcher;
pub mod log_streamer;
pub mod operations;
pub mod registry;
pub mod signals;

// Re-export primary types
pub use config::Settings;
pub use discovery::{DiscoveryLoop, DiscoveryState};
pub use dispatcher::TaskDispatcher;
pub use engine::Engine;
pub use engine_event::EngineEvent;
pub use listener::{ChannelListener, DeviceListener, FileListener, LogListener, TaskListener};
pub use log_streamer::{LogStreamer, StreamState};
pub use operations::Operations;
pub use registry::{DeviceHandle, DeviceRegistry};
