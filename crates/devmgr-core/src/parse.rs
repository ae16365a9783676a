//! Parsers for device command output
//!
//! All of these tolerate malformed input: a parse failure yields `None` or an
//! empty table, never an error, because odd output is routine across device
//! OS versions.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::logcat::ProcessIdMap;

/// Zero-based column of the "Available" figure in a `df` row.
///
/// `df` output differs between toybox versions; this matches
/// `Filesystem 1K-blocks Used Available Use% Mounted-on`.
pub const DF_AVAILABLE_COLUMN: usize = 3;

/// `df` reports 1K blocks; figures are scaled by 1000 (decimal kilobytes)
const DF_BLOCK_SCALE: u64 = 1000;

static QUOTED_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'([^']*)'").expect("Invalid quoted segment regex"));

static GETPROP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[([^\]]+)\]:\s*\[(.*)\]$").expect("Invalid getprop line regex")
});

/// Decode the output of `service call iphonesubinfo …`
///
/// ```text
/// Result: Parcel(
/// 0x00000000: 00000000 0000000b 00350031 00300034 '........1.2.2.2.'
/// 0x00000010: 00310039 00390034 00310032 00000034 '3.3.3.4.4.4.4...')
/// ```
///
/// Every quoted segment after the first line is reduced to its digits (plus a
/// leading minus sign) and the pieces are concatenated in line order. No
/// quoted segment at all yields `None`.
pub fn parse_service_call<S: AsRef<str>>(lines: &[S]) -> Option<String> {
    let mut result: Option<String> = None;

    for line in lines.iter().skip(1) {
        for caps in QUOTED_SEGMENT.captures_iter(line.as_ref()) {
            let digits = keep_digits(&caps[1]);
            result.get_or_insert_with(String::new).push_str(&digits);
        }
    }

    result
}

fn keep_digits(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for c in segment.chars() {
        if c.is_ascii_digit() || (c == '-' && out.is_empty()) {
            out.push(c);
        }
    }
    out
}

/// Free space in bytes from the last line of `df` output
///
/// ```text
/// /dev/fuse 115249236 14681484 100436680 13% /storage/emulated
///                              ^^^^^^^^^
/// ```
pub fn parse_free_space<S: AsRef<str>>(lines: &[S]) -> Option<u64> {
    let last = lines
        .iter()
        .map(AsRef::as_ref)
        .rev()
        .find(|line| !line.trim().is_empty())?;

    let field = last.split_whitespace().nth(DF_AVAILABLE_COLUMN)?;
    field
        .parse::<u64>()
        .ok()
        .and_then(|kb| kb.checked_mul(DF_BLOCK_SCALE))
}

/// Build a pid → name table from `ps -A -o PID,ARGS`
///
/// ```text
///   PID ARGS
///  7617 com.android.traceur
///  7677 [csf_sync_update]
/// ```
pub fn parse_process_map<S: AsRef<str>>(lines: &[S]) -> ProcessIdMap {
    let mut map = ProcessIdMap::new();
    for line in lines {
        let Some((pid, name)) = line.as_ref().trim().split_once(char::is_whitespace) else {
            continue;
        };
        if !pid.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let name = name.trim();
        if !name.is_empty() {
            map.insert(pid.to_string(), name.to_string());
        }
    }
    map
}

/// Parse a `key=value` properties file; lines without `=` are skipped
pub fn parse_custom_properties(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Parse `getprop` output: `[ro.product.model]: [Pixel 7]`
pub fn parse_getprop(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let caps = GETPROP_LINE.captures(line.trim())?;
            Some((caps[1].to_string(), caps[2].to_string()))
        })
        .collect()
}
