use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;
use crate::app::ports::{DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START};

pub const ANDROID_DEVICE_PICK_ALL_TOKEN: &str = "*";
pub const ANDROID_DEVICE_EMPTY_CONFIG_MSG: &str = "Configuration is empty, abort!";
pub const ANDROID_DEVICE_NOT_LIST_CONFIG_MSG: &str = "Configuration should be a list, abort!";
pub const DEFAULT_DEVICE_PORT: u16 = 8080;
pub const DEFAULT_LOGCAT_PARAMS: &str = "-b all";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandSettings {
    pub adb_path: String,
    pub fastboot_path: String,
    pub command_timeout_secs: u64,
    pub bugreport_timeout_secs: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            adb_path: String::new(),
            fastboot_path: String::new(),
            command_timeout_secs: 30,
            bugreport_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BootSettings {
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for BootSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 15 * 60,
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RpcSettings {
    pub connect_timeout_secs: u64,
    pub server_start_delay_ms: u64,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub event_poll_timeout_ms: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            server_start_delay_ms: 3000,
            port_range_start: DEFAULT_PORT_RANGE_START,
            port_range_end: DEFAULT_PORT_RANGE_END,
            event_poll_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
    pub log_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BugreportSettings {
    pub concurrency: usize,
}

impl Default for BugreportSettings {
    fn default() -> Self {
        Self { concurrency: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ControllerConfig {
    #[serde(default)]
    pub command: CommandSettings,
    #[serde(default)]
    pub boot: BootSettings,
    #[serde(default)]
    pub rpc: RpcSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub bugreport: BugreportSettings,
    /// Raw device selection; see [`parse_device_selection`].
    #[serde(default, rename = "AndroidDevice")]
    pub devices: serde_json::Value,
}

impl ControllerConfig {
    pub fn log_root(&self) -> PathBuf {
        let configured = self.logging.log_path.trim();
        if configured.is_empty() {
            std::env::temp_dir().join("hil_controller_logs")
        } else {
            PathBuf::from(configured)
        }
    }

    pub fn device_selection(&self, trace_id: &str) -> Result<DeviceSelection, AppError> {
        parse_device_selection(&self.devices, trace_id)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot.timeout_secs)
    }

    pub fn boot_poll_interval(&self) -> Duration {
        Duration::from_secs(self.boot.poll_interval_secs)
    }
}

/// Per-device settings. Every knob is a named field; anything else in the
/// object is rejected when the configuration is loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub serial: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub adb_logcat_param: Option<String>,
    #[serde(default)]
    pub device_port: Option<u16>,
}

impl DeviceConfig {
    pub fn from_serial(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            label: None,
            adb_logcat_param: None,
            device_port: None,
        }
    }

    pub fn logcat_params(&self) -> &str {
        self.adb_logcat_param
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(DEFAULT_LOGCAT_PARAMS)
    }

    pub fn device_port(&self) -> u16 {
        self.device_port.unwrap_or(DEFAULT_DEVICE_PORT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelection {
    AllAttached { include_bootloader: bool },
    Devices(Vec<DeviceConfig>),
}

pub fn parse_device_selection(
    value: &serde_json::Value,
    trace_id: &str,
) -> Result<DeviceSelection, AppError> {
    use serde_json::Value;

    let empty = || AppError::configuration(ANDROID_DEVICE_EMPTY_CONFIG_MSG, trace_id);
    let items = match value {
        Value::Null => return Err(empty()),
        Value::String(token) if token.trim().is_empty() => return Err(empty()),
        Value::String(token) if token.trim() == ANDROID_DEVICE_PICK_ALL_TOKEN => {
            return Ok(DeviceSelection::AllAttached {
                include_bootloader: false,
            })
        }
        Value::Array(items) if items.is_empty() => return Err(empty()),
        Value::Object(map) if map.is_empty() => return Err(empty()),
        Value::Array(items) => items,
        _ => {
            return Err(AppError::configuration(
                ANDROID_DEVICE_NOT_LIST_CONFIG_MSG,
                trace_id,
            ))
        }
    };

    let mut devices = Vec::with_capacity(items.len());
    if items.iter().all(|item| item.is_string()) {
        for item in items {
            let serial = item.as_str().unwrap_or_default().trim();
            if serial.is_empty() {
                return Err(AppError::configuration("Device serial must not be empty", trace_id));
            }
            devices.push(DeviceConfig::from_serial(serial));
        }
    } else if items.iter().all(|item| item.is_object()) {
        for item in items {
            if item.get("serial").and_then(|serial| serial.as_str()).is_none() {
                return Err(AppError::configuration(
                    format!("Required value \"serial\" is missing in AndroidDevice config {item}."),
                    trace_id,
                ));
            }
            let device: DeviceConfig = serde_json::from_value(item.clone()).map_err(|err| {
                AppError::configuration(format!("Invalid AndroidDevice config {item}: {err}"), trace_id)
            })?;
            devices.push(device);
        }
    } else {
        return Err(AppError::configuration(
            "Device list must contain only serials or only device objects",
            trace_id,
        ));
    }

    let mut seen = HashSet::new();
    for device in &devices {
        if !seen.insert(device.serial.as_str()) {
            return Err(AppError::configuration(
                format!("Device {} is listed more than once", device.serial),
                trace_id,
            ));
        }
    }
    Ok(DeviceSelection::Devices(devices))
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("HIL_CONTROLLER_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hil_controller_config.json")
}

pub fn load_config(trace_id: &str) -> Result<ControllerConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<ControllerConfig, AppError> {
    if !path.exists() {
        return Ok(ControllerConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let config: ControllerConfig = serde_json::from_str(&raw).map_err(|err| {
        AppError::configuration(format!("Failed to parse config: {err}"), trace_id)
    })?;
    Ok(validate_config(config))
}

fn validate_config(mut config: ControllerConfig) -> ControllerConfig {
    let defaults = ControllerConfig::default();
    if config.command.command_timeout_secs == 0 {
        config.command.command_timeout_secs = defaults.command.command_timeout_secs;
    }
    if config.command.bugreport_timeout_secs == 0 {
        config.command.bugreport_timeout_secs = defaults.command.bugreport_timeout_secs;
    }
    if config.boot.timeout_secs == 0 {
        config.boot.timeout_secs = defaults.boot.timeout_secs;
    }
    if config.boot.poll_interval_secs == 0 {
        config.boot.poll_interval_secs = defaults.boot.poll_interval_secs;
    }
    if config.rpc.port_range_start == 0 || config.rpc.port_range_start >= config.rpc.port_range_end {
        config.rpc.port_range_start = defaults.rpc.port_range_start;
        config.rpc.port_range_end = defaults.rpc.port_range_end;
    }
    if config.rpc.connect_timeout_secs == 0 {
        config.rpc.connect_timeout_secs = defaults.rpc.connect_timeout_secs;
    }
    if config.bugreport.concurrency == 0 {
        config.bugreport.concurrency = defaults.bugreport.concurrency;
    }
    config
}
