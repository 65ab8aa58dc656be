//! Turns the device selection from configuration into live controllers, and
//! finds controllers again by serial, label or model.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::parse::parse_device_list;
use crate::app::adb::proxy::{AdbCommandProxy, CommandProxy};
use crate::app::config::{ControllerConfig, DeviceConfig, DeviceSelection};
use crate::app::controller::{merge_reports, CleanupReport, ControllerDeps, ControllerTimings, DeviceController};
use crate::app::error::{AppError, Phase};
use crate::app::ports::PortAllocator;
use crate::app::rpc::dispatcher::PollingEventDispatcher;
use crate::app::rpc::json::JsonRpcClient;

pub type DepsFactory = Box<dyn Fn(&DeviceConfig) -> ControllerDeps + Send + Sync>;

pub struct Discovery {
    host: Arc<dyn CommandProxy>,
    deps: DepsFactory,
    log_root: PathBuf,
    timings: ControllerTimings,
    connect_services: bool,
}

impl Discovery {
    pub fn new(
        host: Arc<dyn CommandProxy>,
        deps: DepsFactory,
        log_root: PathBuf,
        timings: ControllerTimings,
    ) -> Self {
        Self {
            host,
            deps,
            log_root,
            timings,
            connect_services: true,
        }
    }

    /// Wiring against real adb, JSON-RPC and the process-wide port table.
    pub fn from_config(config: &ControllerConfig, trace_id: &str) -> Self {
        let command = config.command.clone();
        let rpc = config.rpc.clone();
        let ports = PortAllocator::global(rpc.port_range_start, rpc.port_range_end);
        let trace = trace_id.to_string();
        let deps: DepsFactory = Box::new(move |device: &DeviceConfig| ControllerDeps {
            proxy: Arc::new(AdbCommandProxy::new(&command, &device.serial, &trace)),
            rpc: Arc::new(JsonRpcClient::new(
                Duration::from_secs(rpc.connect_timeout_secs),
                &trace,
            )),
            dispatcher_factory: PollingEventDispatcher::factory(rpc.event_poll_timeout_ms, &trace),
            ports: Arc::clone(&ports),
        });
        Self::new(
            Arc::new(AdbCommandProxy::host(&config.command, trace_id)),
            deps,
            config.log_root(),
            ControllerTimings::from_config(config),
        )
    }

    /// Skip logcat and RPC startup; devices are only attached and rooted.
    pub fn without_services(mut self) -> Self {
        self.connect_services = false;
        self
    }

    pub fn list_adb_devices(&self) -> Result<Vec<String>, AppError> {
        Ok(parse_device_list(&self.host.list_devices()?, "device"))
    }

    pub fn list_fastboot_devices(&self) -> Result<Vec<String>, AppError> {
        Ok(parse_device_list(&self.host.list_bootloader_devices()?, "fastboot"))
    }

    fn resolve(&self, selection: &DeviceSelection) -> Result<Vec<DeviceConfig>, AppError> {
        let devices = match selection {
            DeviceSelection::AllAttached { include_bootloader } => {
                let mut serials = self.list_adb_devices()?;
                if *include_bootloader {
                    serials.extend(self.list_fastboot_devices()?);
                }
                serials.into_iter().map(DeviceConfig::from_serial).collect()
            }
            DeviceSelection::Devices(devices) => devices.clone(),
        };
        Ok(devices)
    }

    /// Builds one controller per selected device. Every device must be
    /// attached; non-bootloader devices are rooted and, unless disabled, get
    /// logcat capture plus an RPC session with a dispatcher.
    pub fn discover(
        &self,
        selection: &DeviceSelection,
        trace_id: &str,
    ) -> Result<Vec<DeviceController>, AppError> {
        let devices = self.resolve(selection)?;
        let attached = self.list_adb_devices()?;
        let in_bootloader = self.list_fastboot_devices().unwrap_or_else(|err| {
            warn!(trace_id = %trace_id, error = %err, "fastboot listing failed");
            Vec::new()
        });

        let mut controllers = Vec::with_capacity(devices.len());
        for device in &devices {
            let serial = device.serial.as_str();
            let bootloader = in_bootloader.iter().any(|s| s == serial);
            if !bootloader && !attached.iter().any(|s| s == serial) {
                return Err(AppError::configuration(
                    format!("Android device {serial} is specified in config but is not attached."),
                    trace_id,
                )
                .at(serial, Phase::Discovery));
            }
            let mut controller =
                DeviceController::new(device, &self.log_root, (self.deps)(device), self.timings);
            if !bootloader {
                controller
                    .root_adb(trace_id)
                    .map_err(|err| err.at(serial, Phase::Discovery))?;
                if self.connect_services {
                    Self::start_services(&mut controller, trace_id)?;
                }
            }
            info!(trace_id = %trace_id, serial, bootloader, "device ready");
            controllers.push(controller);
        }
        Ok(controllers)
    }

    fn start_services(controller: &mut DeviceController, trace_id: &str) -> Result<(), AppError> {
        controller.start_logcat(trace_id)?;
        controller.ensure_session(trace_id).map_err(|err| {
            AppError::dependency(
                format!("Failed to start RPC services on {}: {err}", controller.serial()),
                trace_id,
            )
            .at(controller.serial(), Phase::Discovery)
        })?;
        Ok(())
    }
}

/// Releases every controller; never fails.
pub fn destroy(controllers: &mut [DeviceController], trace_id: &str) -> CleanupReport {
    merge_reports(
        controllers
            .iter_mut()
            .map(|controller| controller.release(trace_id)),
    )
}

/// Matches on any combination of serial, label and model. Unset fields
/// match everything.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub serial: Option<String>,
    pub label: Option<String>,
    pub model: Option<String>,
}

impl DeviceFilter {
    fn matches(&self, controller: &mut DeviceController, trace_id: &str) -> bool {
        if let Some(serial) = &self.serial {
            if controller.serial() != serial {
                return false;
            }
        }
        if let Some(label) = &self.label {
            if controller.label() != Some(label.as_str()) {
                return false;
            }
        }
        if let Some(model) = &self.model {
            match controller.model(trace_id) {
                Ok(actual) if actual == model.to_lowercase() => {}
                _ => return false,
            }
        }
        true
    }
}

pub fn filter_devices<'a>(
    controllers: &'a mut [DeviceController],
    filter: &DeviceFilter,
    trace_id: &str,
) -> Vec<&'a mut DeviceController> {
    controllers
        .iter_mut()
        .filter_map(|controller| {
            if filter.matches(controller, trace_id) {
                Some(controller)
            } else {
                None
            }
        })
        .collect()
}

/// The single controller matching `filter`.
pub fn get_device<'a>(
    controllers: &'a mut [DeviceController],
    filter: &DeviceFilter,
    trace_id: &str,
) -> Result<&'a mut DeviceController, AppError> {
    let mut matched = filter_devices(controllers, filter, trace_id);
    match matched.len() {
        0 => Err(AppError::validation(
            format!("Could not find a target device that matches condition: {filter:?}."),
            trace_id,
        )),
        1 => Ok(matched.remove(0)),
        _ => {
            let serials: Vec<&str> = matched.iter().map(|c| c.serial()).collect();
            Err(AppError::validation(
                format!("More than one device matched: {serials:?}"),
                trace_id,
            ))
        }
    }
}
