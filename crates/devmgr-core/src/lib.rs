//! # devmgr-core - Core Domain Types
//!
//! Foundation crate for Device Manager. Provides domain types, error handling,
//! logging setup, and the parsers for device command output.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, chrono, thiserror, regex, tracing).
//!
//! ## Public API
//!
//! ### Domain Types
//! - [`Device`] - A device tracked by the engine, keyed by serial
//! - [`ConnectionState`] - Transport-reported connection state
//! - [`LogEntry`] - One parsed `logcat -v threadtime` line
//! - [`ProcessIdMap`] - pid → process name table used to annotate log entries
//! - [`TaskResult`] - Captured outcome of a process or shell command
//! - [`DiscoveryEvent`] - Added/Updated/Removed/Error diff of device snapshots
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ### Parsers (`parse`)
//! - [`parse_service_call()`], [`parse_free_space()`], [`parse_process_map()`],
//!   [`parse_custom_properties()`], [`parse_getprop()`]
//!
//! ## Prelude
//!
//! ```rust
//! use devmgr_core::prelude::*;
//! ```

pub mod device;
pub mod error;
pub mod events;
pub mod logcat;
pub mod logging;
pub mod parse;
pub mod prelude;
pub mod task;

pub use device::{props, ConnectionState, Device};
pub use error::{Error, Result, ResultExt};
pub use events::DiscoveryEvent;
pub use logcat::{parse_since, LogEntry, LogPriority, ProcessIdMap};
pub use parse::{
    parse_custom_properties, parse_free_space, parse_getprop, parse_process_map,
    parse_service_call,
};
pub use task::TaskResult;
