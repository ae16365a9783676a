//! Parsed `logcat -v threadtime` lines
//!
//! ```text
//! 10-16 11:34:17.824  1234  1256 I ActivityManager: Start proc 4321:com.example/u0a123
//! ```
//!
//! The timestamp carries no year, so the caller supplies one. A line whose
//! leading `MM-dd HH:mm:ss` does not parse yields an entry with no timestamp,
//! which the streamer drops.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{Datelike, Local, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Pattern of the leading logcat timestamp (fractional seconds ignored)
pub const TIMESTAMP_FORMAT: &str = "%m-%d %H:%M:%S";

/// Length of `MM-dd HH:mm:ss`
const TIMESTAMP_LEN: usize = 14;

/// pid → process name, rebuilt wholesale on every refresh
pub type ProcessIdMap = HashMap<String, String>;

static THREADTIME_BODY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\.\d+)?\s+(\d+)\s+(\d+)\s+([VDIWEFAS])\s+(.*?)\s*: (.*)$")
        .expect("threadtime regex is valid")
});

/// Logcat priority letter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogPriority {
    Verbose,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Assert,
    Silent,
}

impl LogPriority {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'V' => Some(Self::Verbose),
            'D' => Some(Self::Debug),
            'I' => Some(Self::Info),
            'W' => Some(Self::Warn),
            'E' => Some(Self::Error),
            'F' => Some(Self::Fatal),
            'A' => Some(Self::Assert),
            'S' => Some(Self::Silent),
            _ => None,
        }
    }
}

/// One incoming log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub raw_line: String,

    /// `None` when the leading timestamp does not parse
    pub timestamp: Option<NaiveDateTime>,

    pub pid: Option<String>,
    pub tid: Option<String>,
    pub priority: Option<LogPriority>,
    pub tag: Option<String>,
    pub message: String,

    /// Resolved from the latest [`ProcessIdMap`] before the batch is delivered
    #[serde(default)]
    pub process_name: Option<String>,
}

impl LogEntry {
    /// Parse a threadtime line, assuming the current local year
    pub fn parse(line: &str) -> Self {
        Self::parse_with_year(line, Local::now().year())
    }

    pub fn parse_with_year(line: &str, year: i32) -> Self {
        let mut entry = LogEntry {
            raw_line: line.to_string(),
            timestamp: None,
            pid: None,
            tid: None,
            priority: None,
            tag: None,
            message: line.to_string(),
            process_name: None,
        };

        let Some(timestamp) = parse_timestamp(line, year) else {
            return entry;
        };
        entry.timestamp = Some(timestamp);

        let body = &line[TIMESTAMP_LEN..];
        match THREADTIME_BODY.captures(body) {
            Some(caps) => {
                entry.pid = Some(caps[1].to_string());
                entry.tid = Some(caps[2].to_string());
                entry.priority = caps[3].chars().next().and_then(LogPriority::from_char);
                entry.tag = Some(caps[4].to_string());
                entry.message = caps[5].to_string();
            }
            None => entry.message = body.trim().to_string(),
        }
        entry
    }

    /// Fill in `process_name` from a pid table
    pub fn annotate(&mut self, processes: &ProcessIdMap) {
        if let Some(pid) = &self.pid {
            if let Some(name) = processes.get(pid) {
                self.process_name = Some(name.clone());
            }
        }
    }
}

/// Parse the leading `MM-dd HH:mm:ss` of a line in the given year
pub fn parse_timestamp(line: &str, year: i32) -> Option<NaiveDateTime> {
    let prefix = line.get(..TIMESTAMP_LEN)?;
    NaiveDateTime::parse_from_str(&format!("{year}-{prefix}"), "%Y-%m-%d %H:%M:%S").ok()
}

/// Parse a user-supplied `MM-dd HH:mm:ss` cut-off in the current year
pub fn parse_since(value: &str) -> Option<NaiveDateTime> {
    parse_timestamp(value.trim(), Local::now().year())
}
