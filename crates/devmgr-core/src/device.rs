//! Device domain type and transport-reported connection states

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// `getprop` keys the engine and its consumers read directly
pub mod props {
    pub const SDK: &str = "ro.build.version.sdk";
    pub const MODEL: &str = "ro.product.model";
    pub const OS: &str = "ro.build.version.release";
    pub const CARRIER: &str = "gsm.sim.operator.alpha";
    pub const BRAND: &str = "ro.product.brand";
    pub const NAME: &str = "ro.product.name";
}

/// Connection state as reported by the transport (`adb devices` column two)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Ready for commands
    Device,
    Offline,
    Unauthorized,
    Authorizing,
    Connecting,
    Recovery,
    Bootloader,
    Sideload,
    Host,
    #[default]
    Unknown,
}

impl ConnectionState {
    /// Parse the state column of `adb devices` / `adb track-devices`
    pub fn from_adb(state: &str) -> Self {
        match state.trim() {
            "device" => Self::Device,
            "offline" => Self::Offline,
            "unauthorized" => Self::Unauthorized,
            "authorizing" => Self::Authorizing,
            "connecting" => Self::Connecting,
            "recovery" => Self::Recovery,
            "bootloader" => Self::Bootloader,
            "sideload" => Self::Sideload,
            "host" => Self::Host,
            _ => Self::Unknown,
        }
    }

    /// Only devices in this state accept shell commands and get detail-fetched
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Device)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Offline => "offline",
            Self::Unauthorized => "unauthorized",
            Self::Authorizing => "authorizing",
            Self::Connecting => "connecting",
            Self::Recovery => "recovery",
            Self::Bootloader => "bootloader",
            Self::Sideload => "sideload",
            Self::Host => "host",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device known to the engine.
///
/// `serial` is fixed at construction and has no setter; every other field is
/// public and owned by a single writer in practice (detail fetch owns the
/// phone/imei/free-space/property fields, discovery owns `is_online` and
/// `status`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    serial: String,

    #[serde(default)]
    pub phone: Option<String>,

    #[serde(default)]
    pub imei: Option<String>,

    /// Free space on the emulated storage partition, in bytes
    #[serde(default)]
    pub free_space_bytes: Option<u64>,

    /// Read-only `getprop` table
    #[serde(default)]
    pub properties: HashMap<String, String>,

    /// Key/value pairs persisted in a properties file on the device
    #[serde(default)]
    pub custom_properties: HashMap<String, String>,

    /// Describes an in-flight operation; `None` when idle
    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub is_online: bool,

    /// Sticky: detail fetch runs once per device unless explicitly reset
    #[serde(default)]
    pub has_fetched_details: bool,

    #[serde(default)]
    pub connection_state: ConnectionState,

    pub last_state_change: DateTime<Local>,

    /// A detail fetch has been scheduled and has not completed yet
    #[serde(skip)]
    pub detail_fetch_pending: bool,
}

impl Device {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            phone: None,
            imei: None,
            free_space_bytes: None,
            properties: HashMap::new(),
            custom_properties: HashMap::new(),
            status: None,
            is_online: false,
            has_fetched_details: false,
            connection_state: ConnectionState::Unknown,
            last_state_change: Local::now(),
            detail_fetch_pending: false,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Best available human-readable name: model, then phone or serial
    pub fn display_name(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(2);
        if let Some(model) = self.property(props::MODEL) {
            parts.push(model);
        }
        match &self.phone {
            Some(phone) => parts.push(phone),
            None => parts.push(&self.serial),
        }
        parts.join(" - ")
    }

    /// Connected over the network (`host:port` serial)
    pub fn is_wireless(&self) -> bool {
        self.serial.find(':').is_some_and(|pos| pos > 0)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn custom_property(&self, key: &str) -> Option<&str> {
        self.custom_properties.get(key).map(String::as_str)
    }

    pub fn set_custom_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom_properties.insert(key.into(), value.into());
    }

    /// Stamp `last_state_change` with the current time
    pub fn touch(&mut self) {
        self.last_state_change = Local::now();
    }
}
