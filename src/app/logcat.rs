//! Background logcat capture for one device and time-window excerpts cut
//! from the capture file.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::app::adb::proxy::{CaptureProcess, CommandProxy};
use crate::app::error::AppError;
use crate::app::logline::{
    is_timestamp_in_range, is_valid_log_line_timestamp, leading_timestamp, log_line_timestamp_now,
};
use crate::app::paths::{excerpt_file_name, logcat_file_name, EXCERPT_DIR_NAME};

const LOGPERSIST_START: &str = "logpersist.start";

pub struct LogcatHandle {
    process: Box<dyn CaptureProcess>,
    file_path: PathBuf,
}

impl LogcatHandle {
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }
}

pub struct LogcatCollector {
    serial: String,
    log_dir: PathBuf,
    extra_params: String,
    handle: Option<LogcatHandle>,
    last_file: Option<PathBuf>,
}

impl LogcatCollector {
    pub fn new(serial: &str, log_dir: PathBuf, extra_params: &str) -> Self {
        Self {
            serial: serial.to_string(),
            log_dir,
            extra_params: extra_params.to_string(),
            handle: None,
            last_file: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&LogcatHandle> {
        self.handle.as_ref()
    }

    /// Path of the most recent capture file, kept after `stop`.
    pub fn last_file(&self) -> Option<&Path> {
        self.last_file.as_deref()
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Starts streaming the device log to `adblog,<model>,<serial>.txt`.
    pub fn start(
        &mut self,
        proxy: &dyn CommandProxy,
        model: &str,
        trace_id: &str,
    ) -> Result<&LogcatHandle, AppError> {
        if self.handle.is_some() {
            return Err(AppError::usage(
                format!("Android device {} already has an adb logcat thread going on. Cannot start another one.", self.serial),
                trace_id,
            ));
        }
        // Turns off the chatty filter so nothing is dropped from the capture.
        if let Err(err) = proxy.shell(LOGPERSIST_START) {
            warn!(trace_id = %trace_id, serial = %self.serial, error = %err, "logpersist.start failed");
        }

        fs::create_dir_all(&self.log_dir).map_err(|err| {
            AppError::system(
                format!("Failed to create log dir {}: {err}", self.log_dir.display()),
                trace_id,
            )
        })?;
        let log_dir = fs::canonicalize(&self.log_dir).unwrap_or_else(|_| self.log_dir.clone());
        let file_path = log_dir.join(logcat_file_name(model, &self.serial));

        let process = proxy.spawn_logcat(&self.extra_params, &file_path)?;
        info!(
            trace_id = %trace_id,
            serial = %self.serial,
            pid = ?process.id(),
            path = %file_path.display(),
            "logcat capture started"
        );
        self.last_file = Some(file_path.clone());
        Ok(self.handle.insert(LogcatHandle { process, file_path }))
    }

    pub fn stop(&mut self, trace_id: &str) -> Result<(), AppError> {
        let Some(mut handle) = self.handle.take() else {
            return Err(AppError::usage(
                format!("Android device {} does not have an ongoing adb logcat collection.", self.serial),
                trace_id,
            ));
        };
        handle.process.stop()?;
        info!(trace_id = %trace_id, serial = %self.serial, "logcat capture stopped");
        Ok(())
    }

    /// Cuts the lines logged between `begin` and now into an excerpt file.
    pub fn extract_range(&self, tag: &str, begin: &str, trace_id: &str) -> Result<PathBuf, AppError> {
        self.extract_range_until(tag, begin, &log_line_timestamp_now(), trace_id)
    }

    pub fn extract_range_until(
        &self,
        tag: &str,
        begin: &str,
        end: &str,
        trace_id: &str,
    ) -> Result<PathBuf, AppError> {
        let Some(source) = self.last_file.as_deref() else {
            return Err(AppError::usage(
                format!("Attempting to cat adb log when none has been collected on Android device {}.", self.serial),
                trace_id,
            ));
        };
        if !is_valid_log_line_timestamp(begin) {
            return Err(AppError::validation(
                format!("Invalid log line timestamp: {begin:?}"),
                trace_id,
            ));
        }

        let source_name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let excerpt_dir = self.log_dir.join(EXCERPT_DIR_NAME);
        fs::create_dir_all(&excerpt_dir).map_err(|err| {
            AppError::system(
                format!("Failed to create excerpt dir {}: {err}", excerpt_dir.display()),
                trace_id,
            )
        })?;
        let target = excerpt_dir.join(excerpt_file_name(tag, begin, &source_name));

        let io_err = |err: std::io::Error| {
            AppError::system(format!("Failed to write logcat excerpt: {err}"), trace_id)
        };
        let reader = BufReader::new(File::open(source).map_err(io_err)?);
        let mut writer = BufWriter::new(File::create(&target).map_err(io_err)?);
        let written = write_excerpt(reader, &mut writer, begin, end).map_err(io_err)?;
        writer.flush().map_err(io_err)?;
        info!(
            trace_id = %trace_id,
            serial = %self.serial,
            lines = written,
            path = %target.display(),
            "logcat excerpt written"
        );
        Ok(target)
    }
}

/// Copies the single contiguous run of lines stamped within `[begin, end]`.
/// Lines without a timestamp are skipped before the window and kept inside
/// it; the first stamped line past the window ends the scan.
pub fn write_excerpt<R: BufRead, W: Write>(
    mut reader: R,
    writer: &mut W,
    begin: &str,
    end: &str,
) -> std::io::Result<usize> {
    let mut buffer = Vec::new();
    let mut in_range = false;
    let mut written = 0;
    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buffer);
        match leading_timestamp(&line) {
            Some(stamp) if is_timestamp_in_range(stamp, begin, end) => in_range = true,
            Some(_) if in_range => break,
            Some(_) => continue,
            None if in_range => {}
            None => continue,
        }
        writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            writer.write_all(b"\n")?;
        }
        written += 1;
    }
    Ok(written)
}
