use std::path::{Path, PathBuf};

pub const MAX_FILENAME_LEN: usize = 255;
pub const EXCERPT_DIR_NAME: &str = "AdbLogExcerpts";
pub const BUGREPORT_DIR_NAME: &str = "BugReports";
const LOGCAT_FILE_PREFIX: &str = "adblog,";
const TEXT_SUFFIX: &str = ".txt";

pub fn device_log_dir(log_root: &Path, serial: &str) -> PathBuf {
    log_root.join(format!("AndroidDevice{serial}"))
}

pub fn sanitize_filename_component(value: &str) -> String {
    value
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | '\0' => '_',
            other => other,
        })
        .collect()
}

/// Joins a free-text prefix with a fixed suffix, shortening only the prefix
/// so the whole name stays within [`MAX_FILENAME_LEN`] characters.
pub fn fit_file_name(prefix: &str, suffix: &str) -> String {
    let budget = MAX_FILENAME_LEN.saturating_sub(suffix.chars().count());
    let mut name: String = sanitize_filename_component(prefix)
        .chars()
        .take(budget)
        .collect();
    name.push_str(suffix);
    name
}

pub fn logcat_file_name(model: &str, serial: &str) -> String {
    format!("{LOGCAT_FILE_PREFIX}{model},{serial}{TEXT_SUFFIX}")
}

/// `<tag>,<begin>,<model>,<serial>.txt`, derived from the capture file name.
pub fn excerpt_file_name(tag: &str, begin_time: &str, logcat_file_name: &str) -> String {
    let base = logcat_file_name
        .replace(LOGCAT_FILE_PREFIX, "")
        .replace(TEXT_SUFFIX, "");
    fit_file_name(tag, &format!(",{begin_time},{base}{TEXT_SUFFIX}"))
}

pub fn bugreport_file_name(test_name: &str, begin_time: &str, serial: &str) -> String {
    fit_file_name(test_name, &format!(",{begin_time},{serial}{TEXT_SUFFIX}"))
}
