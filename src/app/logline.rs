//! Log-line timestamps in the fixed-width `MM-DD HH:MM:SS.mmm` form that
//! `logcat -v threadtime` prints at the start of every line.
//!
//! The width is fixed, so ordering is plain string ordering; no timezone
//! conversion happens anywhere.

use std::sync::OnceLock;

use chrono::{Local, TimeZone};
use regex::Regex;

pub const LOG_LINE_TIMESTAMP_LEN: usize = 18;
const LOG_LINE_TIMESTAMP_FORMAT: &str = "%m-%d %H:%M:%S%.3f";

fn timestamp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{2}-\d{2} \d{2}:\d{2}:\d{2}\.\d{3}$").unwrap())
}

pub fn log_line_timestamp_now() -> String {
    Local::now().format(LOG_LINE_TIMESTAMP_FORMAT).to_string()
}

pub fn epoch_millis_to_log_line_timestamp(epoch_millis: i64) -> Option<String> {
    Local
        .timestamp_millis_opt(epoch_millis)
        .single()
        .map(|time| time.format(LOG_LINE_TIMESTAMP_FORMAT).to_string())
}

pub fn is_valid_log_line_timestamp(value: &str) -> bool {
    value.len() == LOG_LINE_TIMESTAMP_LEN && timestamp_regex().is_match(value)
}

/// The timestamp a log line starts with, if it starts with a valid one.
pub fn leading_timestamp(line: &str) -> Option<&str> {
    let candidate = line.get(..LOG_LINE_TIMESTAMP_LEN)?;
    is_valid_log_line_timestamp(candidate).then_some(candidate)
}

pub fn is_timestamp_in_range(target: &str, begin: &str, end: &str) -> bool {
    begin <= target && target <= end
}

/// Makes a log-line timestamp safe for file names.
pub fn normalize_log_line_timestamp(value: &str) -> String {
    value.replace(' ', "_").replace(':', "-")
}
