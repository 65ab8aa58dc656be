//! The per-device aggregate: port forward, RPC sessions and their event
//! dispatchers, logcat capture, and the reboot sequence that tears all of
//! them down and brings them back.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::adb::parse::{
    is_boot_completed, is_root_id_output, parse_device_list, parse_fastboot_product,
    parse_getprop_value,
};
use crate::app::adb::proxy::CommandProxy;
use crate::app::config::{ControllerConfig, DeviceConfig};
use crate::app::error::{resolve_trace_id, AppError, Phase};
use crate::app::events::EventChannelRegistry;
use crate::app::logcat::{LogcatCollector, LogcatHandle};
use crate::app::logline::normalize_log_line_timestamp;
use crate::app::paths::{bugreport_file_name, device_log_dir, BUGREPORT_DIR_NAME};
use crate::app::ports::{PortAllocator, PortForwarder};
use crate::app::rpc::{Connection, DispatcherFactory, EventDispatcher, RpcClient, SessionId};
use crate::app::session::SessionMultiplexer;


const BOOT_COMPLETED_PROP: &str = "getprop sys.boot_completed";
const BUILD_PRODUCT_PROP: &str = "getprop ro.build.product";
const PRODUCT_NAME_PROP: &str = "getprop ro.product.name";
// The one build whose ro.build.product is the name we want.
const SPROUT_PRODUCT: &str = "sprout";
const ROOT_CHECK: &str = "id -u";
const UNKNOWN_MODEL: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    Bootloader,
    OnlineUnrooted,
    OnlineRooted,
}

/// Lazily queried device facts. Anything that can change them (root,
/// reboot) calls [`DeviceInfoCache::invalidate`].
#[derive(Debug, Default, Clone)]
pub struct DeviceInfoCache {
    model: Option<String>,
    rooted: Option<bool>,
    bootloader: Option<bool>,
}

impl DeviceInfoCache {
    pub fn invalidate(&mut self) {
        *self = Self::default();
    }
}

/// The collaborators a controller drives.
#[derive(Clone)]
pub struct ControllerDeps {
    pub proxy: Arc<dyn CommandProxy>,
    pub rpc: Arc<dyn RpcClient>,
    pub dispatcher_factory: DispatcherFactory,
    pub ports: Arc<PortAllocator>,
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerTimings {
    pub boot_timeout: Duration,
    pub boot_poll_interval: Duration,
    /// Grace period after launching the RPC server before reconnecting.
    pub rpc_server_start_delay: Duration,
}

impl Default for ControllerTimings {
    fn default() -> Self {
        Self::from_config(&ControllerConfig::default())
    }
}

impl ControllerTimings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            boot_timeout: config.boot_timeout(),
            boot_poll_interval: config.boot_poll_interval(),
            rpc_server_start_delay: Duration::from_millis(config.rpc.server_start_delay_ms),
        }
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    pub uid: SessionId,
    pub connection: Connection,
    pub dispatcher: Arc<dyn EventDispatcher>,
}

/// Failures collected by a best-effort teardown.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CleanupReport {
    pub failures: Vec<AppError>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, result: Result<(), AppError>) {
        if let Err(err) = result {
            self.failures.push(err);
        }
    }

    fn merge(&mut self, other: CleanupReport) {
        self.failures.extend(other.failures);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IperfResult {
    pub success: bool,
    pub lines: Vec<String>,
}

pub struct DeviceController {
    serial: String,
    label: Option<String>,
    log_dir: PathBuf,
    proxy: Arc<dyn CommandProxy>,
    ports: PortForwarder,
    sessions: SessionMultiplexer,
    events: EventChannelRegistry,
    logcat: LogcatCollector,
    info: DeviceInfoCache,
    timings: ControllerTimings,
}

impl DeviceController {
    pub fn new(
        device: &DeviceConfig,
        log_root: &Path,
        deps: ControllerDeps,
        timings: ControllerTimings,
    ) -> Self {
        let serial = device.serial.clone();
        let log_dir = device_log_dir(log_root, &serial);
        Self {
            label: device.label.clone(),
            ports: PortForwarder::new(deps.ports, device.device_port()),
            sessions: SessionMultiplexer::new(&serial, deps.rpc),
            events: EventChannelRegistry::new(&serial, deps.dispatcher_factory),
            logcat: LogcatCollector::new(&serial, log_dir.clone(), device.logcat_params()),
            proxy: deps.proxy,
            info: DeviceInfoCache::default(),
            timings,
            log_dir,
            serial,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn host_port(&self) -> Option<u16> {
        self.ports.host_port()
    }

    pub fn proxy(&self) -> &dyn CommandProxy {
        self.proxy.as_ref()
    }

    pub fn sessions(&self) -> &SessionMultiplexer {
        &self.sessions
    }

    pub fn logcat(&self) -> &LogcatCollector {
        &self.logcat
    }

    pub fn first_session(&self) -> Option<Connection> {
        self.sessions.first_primary()
    }

    pub fn first_dispatcher(&self) -> Option<Arc<dyn EventDispatcher>> {
        self.events.first()
    }

    pub fn dispatchers(&self) -> Vec<Arc<dyn EventDispatcher>> {
        self.events.all()
    }

    pub fn invalidate_info(&mut self) {
        self.info.invalidate();
    }

    pub fn is_bootloader_mode(&mut self, trace_id: &str) -> Result<bool, AppError> {
        if let Some(bootloader) = self.info.bootloader {
            return Ok(bootloader);
        }
        let output = self.proxy.list_bootloader_devices()?;
        let bootloader = parse_device_list(&output, "fastboot").contains(&self.serial);
        debug!(trace_id = %trace_id, serial = %self.serial, bootloader, "bootloader check");
        self.info.bootloader = Some(bootloader);
        Ok(bootloader)
    }

    pub fn is_adb_root(&mut self, trace_id: &str) -> Result<bool, AppError> {
        if let Some(rooted) = self.info.rooted {
            return Ok(rooted);
        }
        let rooted = is_root_id_output(&self.proxy.shell(ROOT_CHECK)?);
        debug!(trace_id = %trace_id, serial = %self.serial, rooted, "root check");
        self.info.rooted = Some(rooted);
        Ok(rooted)
    }

    /// Product name, lowercased. Read from the bootloader in fastboot mode.
    pub fn model(&mut self, trace_id: &str) -> Result<String, AppError> {
        if let Some(model) = &self.info.model {
            return Ok(model.clone());
        }
        let model = if self.is_bootloader_mode(trace_id)? {
            parse_fastboot_product(&self.proxy.bootloader_product()?)
        } else {
            match parse_getprop_value(&self.proxy.shell(BUILD_PRODUCT_PROP)?) {
                Some(product) if product == SPROUT_PRODUCT => Some(product),
                _ => parse_getprop_value(&self.proxy.shell(PRODUCT_NAME_PROP)?),
            }
        }
        .unwrap_or_else(|| UNKNOWN_MODEL.to_string());
        self.info.model = Some(model.clone());
        Ok(model)
    }

    pub fn mode(&mut self, trace_id: &str) -> Result<DeviceMode, AppError> {
        if self.is_bootloader_mode(trace_id)? {
            return Ok(DeviceMode::Bootloader);
        }
        if self.is_adb_root(trace_id)? {
            Ok(DeviceMode::OnlineRooted)
        } else {
            Ok(DeviceMode::OnlineUnrooted)
        }
    }

    /// Restarts adbd as root and remounts the system partitions, waiting
    /// for the device after each step. No-op when adbd already runs as root.
    pub fn root_adb(&mut self, trace_id: &str) -> Result<(), AppError> {
        if self.is_adb_root(trace_id)? {
            debug!(trace_id = %trace_id, serial = %self.serial, "adb already root");
            return Ok(());
        }
        self.proxy.root()?;
        self.proxy.wait_for_device(self.timings.boot_timeout)?;
        self.info.rooted = None;
        self.remount(trace_id)?;
        self.proxy.wait_for_device(self.timings.boot_timeout)?;
        info!(trace_id = %trace_id, serial = %self.serial, "adb restarted as root");
        Ok(())
    }

    pub fn remount(&self, trace_id: &str) -> Result<(), AppError> {
        self.proxy.remount()?;
        debug!(trace_id = %trace_id, serial = %self.serial, "remounted");
        Ok(())
    }

    /// Starts an RPC session with a running event dispatcher.
    pub fn ensure_session(&mut self, trace_id: &str) -> Result<SessionHandle, AppError> {
        let (uid, connection) = self.open_session(trace_id)?;
        let dispatcher = self
            .events
            .get(&mut self.sessions, uid, trace_id)
            .and_then(|dispatcher| dispatcher.start().map(|_| dispatcher));
        match dispatcher {
            Ok(dispatcher) => Ok(SessionHandle {
                uid,
                connection,
                dispatcher,
            }),
            Err(err) => {
                if let Err(close_err) = self.close_session(uid, trace_id) {
                    warn!(trace_id = %trace_id, serial = %self.serial, uid, error = %close_err, "failed to close session after dispatcher failure");
                }
                Err(err.at(&self.serial, Phase::Session))
            }
        }
    }

    /// Starts an RPC session without an event dispatcher. When the server is
    /// unreachable it is launched once and the session retried.
    pub fn open_session(&mut self, trace_id: &str) -> Result<(SessionId, Connection), AppError> {
        let port = self
            .ports
            .ensure_forwarded(self.proxy.as_ref(), trace_id)
            .map_err(|err| err.at(&self.serial, Phase::Port))?;
        let started = match self.sessions.start_session(port, trace_id) {
            Err(err) if err.is_transient() => {
                warn!(trace_id = %trace_id, serial = %self.serial, error = %err, "rpc server unreachable, launching it");
                self.proxy
                    .start_rpc_server(self.ports.device_port())
                    .and_then(|_| {
                        thread::sleep(self.timings.rpc_server_start_delay);
                        self.sessions.start_session(port, trace_id)
                    })
            }
            other => other,
        };
        started.map_err(|err| {
            if self.sessions.is_empty() {
                if let Err(release_err) = self.ports.release(self.proxy.as_ref(), trace_id) {
                    warn!(trace_id = %trace_id, serial = %self.serial, error = %release_err, "failed to release port");
                }
            }
            err.at(&self.serial, Phase::Session)
        })
    }

    /// Closes one session and its dispatcher.
    pub fn close_session(&mut self, uid: SessionId, trace_id: &str) -> Result<(), AppError> {
        self.events.release(uid);
        self.sessions
            .close_session(uid, trace_id)
            .map_err(|err| err.at(&self.serial, Phase::Session))
    }

    /// Closes every session, then removes the forward and returns the port.
    /// Never fails; problems land in the report.
    pub fn close_all_sessions(&mut self, trace_id: &str) -> CleanupReport {
        let mut report = CleanupReport::default();
        for uid in self.sessions.session_ids() {
            report.record(self.close_session(uid, trace_id));
        }
        report.record(
            self.ports
                .release(self.proxy.as_ref(), trace_id)
                .map_err(|err| err.at(&self.serial, Phase::Port)),
        );
        for failure in &report.failures {
            warn!(trace_id = %trace_id, serial = %self.serial, error = %failure, "cleanup step failed");
        }
        report
    }

    pub fn start_logcat(&mut self, trace_id: &str) -> Result<&LogcatHandle, AppError> {
        let model = self
            .model(trace_id)
            .map_err(|err| err.at(&self.serial, Phase::Logging))?;
        self.logcat
            .start(self.proxy.as_ref(), &model, trace_id)
            .map_err(|err| err.at(&self.serial, Phase::Logging))
    }

    pub fn stop_logcat(&mut self, trace_id: &str) -> Result<(), AppError> {
        self.logcat
            .stop(trace_id)
            .map_err(|err| err.at(&self.serial, Phase::Logging))
    }

    /// Excerpt of the capture from `begin` until now.
    pub fn extract_logcat(&self, tag: &str, begin: &str, trace_id: &str) -> Result<PathBuf, AppError> {
        self.logcat
            .extract_range(tag, begin, trace_id)
            .map_err(|err| err.at(&self.serial, Phase::Logging))
    }

    /// Reboots and brings back whatever was running: root, an RPC session
    /// with its dispatcher, and logcat capture if it was on.
    pub fn reboot(&mut self, trace_id: &str) -> Result<(), AppError> {
        let at_reboot = |err: AppError, serial: &str| err.at(serial, Phase::Reboot);
        if self
            .is_bootloader_mode(trace_id)
            .map_err(|err| at_reboot(err, &self.serial))?
        {
            self.proxy
                .bootloader_reboot()
                .map_err(|err| at_reboot(err, &self.serial))?;
            self.info.invalidate();
            info!(trace_id = %trace_id, serial = %self.serial, "bootloader rebooted");
            return Ok(());
        }

        let had_logcat = self.logcat.is_running();
        if had_logcat {
            self.stop_logcat(trace_id)?;
        }
        let report = self.close_all_sessions(trace_id);
        if !report.is_clean() {
            warn!(trace_id = %trace_id, serial = %self.serial, failures = report.failures.len(), "sessions not cleanly closed before reboot");
        }

        info!(trace_id = %trace_id, serial = %self.serial, "rebooting");
        self.proxy
            .reboot()
            .map_err(|err| at_reboot(err, &self.serial))?;
        self.info.invalidate();
        self.wait_for_boot_completion(trace_id)
            .map_err(|err| at_reboot(err, &self.serial))?;
        self.root_adb(trace_id)
            .map_err(|err| at_reboot(err, &self.serial))?;
        self.ensure_session(trace_id)?;
        if had_logcat {
            self.start_logcat(trace_id)?;
        }
        info!(trace_id = %trace_id, serial = %self.serial, "reboot complete");
        Ok(())
    }

    /// Waits for adb to reappear, then polls `sys.boot_completed`. Shell
    /// errors while the device is still coming up are ignored.
    pub fn wait_for_boot_completion(&self, trace_id: &str) -> Result<(), AppError> {
        let deadline = Instant::now() + self.timings.boot_timeout;
        self.proxy.wait_for_device(self.timings.boot_timeout)?;
        loop {
            match self.proxy.shell(BOOT_COMPLETED_PROP) {
                Ok(output) if is_boot_completed(&output) => return Ok(()),
                Ok(_) => {}
                Err(err) => {
                    debug!(trace_id = %trace_id, serial = %self.serial, error = %err, "boot poll failed");
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AppError::timeout(
                    format!("device {} did not finish booting", self.serial),
                    trace_id,
                ));
            }
            thread::sleep(self.timings.boot_poll_interval.min(deadline - now));
        }
    }

    /// Writes a bug report to `BugReports/<test>,<begin>,<serial>.txt`.
    /// `begin` may be a raw or already normalized log-line timestamp.
    pub fn take_diagnostic_snapshot(
        &self,
        test_name: &str,
        begin: &str,
        trace_id: &str,
    ) -> Result<PathBuf, AppError> {
        let at_snapshot = |err: AppError| err.at(&self.serial, Phase::Snapshot);
        let dir = self.log_dir.join(BUGREPORT_DIR_NAME);
        fs::create_dir_all(&dir).map_err(|err| {
            at_snapshot(AppError::system(
                format!("Failed to create {}: {err}", dir.display()),
                trace_id,
            ))
        })?;
        let path = dir.join(bugreport_file_name(
            test_name,
            &normalize_log_line_timestamp(begin),
            &self.serial,
        ));
        info!(trace_id = %trace_id, serial = %self.serial, path = %path.display(), "taking bug report");
        self.proxy.bugreport(&path).map_err(at_snapshot)?;
        info!(trace_id = %trace_id, serial = %self.serial, "bug report taken");
        Ok(path)
    }

    /// Runs `iperf3 -c <host>` on the device. The run fails when the first
    /// output line reports an error.
    pub fn run_iperf_client(
        &self,
        server_host: &str,
        extra_args: &str,
        trace_id: &str,
    ) -> Result<IperfResult, AppError> {
        let output = self
            .proxy
            .shell(format!("iperf3 -c {server_host} {extra_args}").trim_end())?;
        let text = String::from_utf8_lossy(&output);
        let lines: Vec<String> = text.trim().lines().map(str::to_string).collect();
        let success = !lines
            .first()
            .is_some_and(|line| line.to_lowercase().contains("error"));
        debug!(trace_id = %trace_id, serial = %self.serial, success, "iperf client finished");
        Ok(IperfResult { success, lines })
    }

    /// Closes sessions, stops capture and returns the port. Safe to repeat.
    pub fn release(&mut self, trace_id: &str) -> CleanupReport {
        let mut report = self.close_all_sessions(trace_id);
        if self.logcat.is_running() {
            report.record(self.stop_logcat(trace_id));
        }
        report
    }

    fn holds_resources(&self) -> bool {
        !self.sessions.is_empty() || self.logcat.is_running() || self.ports.host_port().is_some()
    }
}

impl Drop for DeviceController {
    fn drop(&mut self) {
        if !self.holds_resources() {
            return;
        }
        let trace_id = resolve_trace_id(None);
        let report = self.release(&trace_id);
        if !report.is_clean() {
            warn!(trace_id = %trace_id, serial = %self.serial, failures = report.failures.len(), "release on drop was not clean");
        }
    }
}

/// Merges the cleanup reports of several controllers.
pub fn merge_reports(reports: impl IntoIterator<Item = CleanupReport>) -> CleanupReport {
    let mut merged = CleanupReport::default();
    for report in reports {
        merged.merge(report);
    }
    merged
}
