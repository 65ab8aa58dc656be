use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::debug;

use crate::app::adb::locator::{resolve_adb_program, resolve_fastboot_program};
use crate::app::adb::runner::{run_checked, run_checked_to_file, CommandOutput};
use crate::app::config::CommandSettings;
use crate::app::error::AppError;

/// A background process streaming into a file, e.g. logcat capture.
pub trait CaptureProcess: Send + Sync {
    fn id(&self) -> Option<u32>;
    fn stop(&mut self) -> Result<(), AppError>;
}

impl CaptureProcess for Child {
    fn id(&self) -> Option<u32> {
        Some(Child::id(self))
    }

    fn stop(&mut self) -> Result<(), AppError> {
        // kill() fails once the child already exited; wait() still reaps it.
        let _ = self.kill();
        let _ = self.wait();
        Ok(())
    }
}

/// The device-management bridge (adb + fastboot) for one device.
pub trait CommandProxy: Send + Sync {
    fn serial(&self) -> &str;
    fn shell(&self, command: &str) -> Result<Vec<u8>, AppError>;
    fn forward(&self, host_port: u16, device_port: u16) -> Result<(), AppError>;
    fn remove_forward(&self, host_port: u16) -> Result<(), AppError>;
    fn root(&self) -> Result<(), AppError>;
    fn remount(&self) -> Result<(), AppError>;
    fn wait_for_device(&self, timeout: Duration) -> Result<(), AppError>;
    fn reboot(&self) -> Result<(), AppError>;
    fn bootloader_reboot(&self) -> Result<(), AppError>;
    /// Raw `getvar product` output from the bootloader interface.
    fn bootloader_product(&self) -> Result<Vec<u8>, AppError>;
    fn list_devices(&self) -> Result<Vec<u8>, AppError>;
    fn list_bootloader_devices(&self) -> Result<Vec<u8>, AppError>;
    fn bugreport(&self, destination: &Path) -> Result<(), AppError>;
    fn start_rpc_server(&self, device_port: u16) -> Result<(), AppError>;
    fn spawn_logcat(
        &self,
        extra_params: &str,
        output: &Path,
    ) -> Result<Box<dyn CaptureProcess>, AppError>;
}

const RPC_LAUNCH_ACTION: &str = "com.googlecode.android_scripting.action.LAUNCH_SERVER";
const RPC_PORT_EXTRA: &str = "com.googlecode.android_scripting.extra.USE_SERVICE_PORT";
const RPC_LAUNCHER: &str =
    "com.googlecode.android_scripting/.activity.ScriptingLayerServiceLauncher";

/// [`CommandProxy`] backed by the `adb` and `fastboot` executables.
#[derive(Debug, Clone)]
pub struct AdbCommandProxy {
    adb_program: String,
    fastboot_program: String,
    serial: String,
    command_timeout: Duration,
    bugreport_timeout: Duration,
    trace_id: String,
}

impl AdbCommandProxy {
    pub fn new(settings: &CommandSettings, serial: &str, trace_id: &str) -> Self {
        Self {
            adb_program: resolve_adb_program(&settings.adb_path),
            fastboot_program: resolve_fastboot_program(&settings.fastboot_path),
            serial: serial.to_string(),
            command_timeout: Duration::from_secs(settings.command_timeout_secs),
            bugreport_timeout: Duration::from_secs(settings.bugreport_timeout_secs),
            trace_id: trace_id.to_string(),
        }
    }

    /// A proxy not bound to any serial, good for enumeration only.
    pub fn host(settings: &CommandSettings, trace_id: &str) -> Self {
        Self::new(settings, "", trace_id)
    }

    fn device_args(&self, args: &[&str]) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if !self.serial.is_empty() {
            full.push("-s".to_string());
            full.push(self.serial.clone());
        }
        full.extend(args.iter().map(|arg| arg.to_string()));
        full
    }

    fn adb(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput, AppError> {
        let args = self.device_args(args);
        debug!(trace_id = %self.trace_id, serial = %self.serial, args = ?args, "adb");
        run_checked(&self.adb_program, &args, timeout, &self.trace_id)
    }

    fn fastboot(&self, args: &[&str]) -> Result<CommandOutput, AppError> {
        let args = self.device_args(args);
        debug!(trace_id = %self.trace_id, serial = %self.serial, args = ?args, "fastboot");
        run_checked(&self.fastboot_program, &args, self.command_timeout, &self.trace_id)
    }
}

impl CommandProxy for AdbCommandProxy {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn shell(&self, command: &str) -> Result<Vec<u8>, AppError> {
        Ok(self.adb(&["shell", command], self.command_timeout)?.stdout)
    }

    fn forward(&self, host_port: u16, device_port: u16) -> Result<(), AppError> {
        let host = format!("tcp:{host_port}");
        let device = format!("tcp:{device_port}");
        self.adb(&["forward", &host, &device], self.command_timeout)?;
        Ok(())
    }

    fn remove_forward(&self, host_port: u16) -> Result<(), AppError> {
        let host = format!("tcp:{host_port}");
        self.adb(&["forward", "--remove", &host], self.command_timeout)?;
        Ok(())
    }

    fn root(&self) -> Result<(), AppError> {
        self.adb(&["root"], self.command_timeout)?;
        Ok(())
    }

    fn remount(&self) -> Result<(), AppError> {
        self.adb(&["remount"], self.command_timeout)?;
        Ok(())
    }

    fn wait_for_device(&self, timeout: Duration) -> Result<(), AppError> {
        self.adb(&["wait-for-device"], timeout)?;
        Ok(())
    }

    fn reboot(&self) -> Result<(), AppError> {
        self.adb(&["reboot"], self.command_timeout)?;
        Ok(())
    }

    fn bootloader_reboot(&self) -> Result<(), AppError> {
        self.fastboot(&["reboot"])?;
        Ok(())
    }

    fn bootloader_product(&self) -> Result<Vec<u8>, AppError> {
        // fastboot prints getvar answers on stderr.
        let output = self.fastboot(&["getvar", "product"])?;
        if output.stdout.iter().all(|byte| byte.is_ascii_whitespace()) {
            Ok(output.stderr)
        } else {
            Ok(output.stdout)
        }
    }

    fn list_devices(&self) -> Result<Vec<u8>, AppError> {
        let args = vec!["devices".to_string()];
        Ok(run_checked(&self.adb_program, &args, self.command_timeout, &self.trace_id)?.stdout)
    }

    fn list_bootloader_devices(&self) -> Result<Vec<u8>, AppError> {
        let args = vec!["devices".to_string()];
        Ok(run_checked(&self.fastboot_program, &args, self.command_timeout, &self.trace_id)?.stdout)
    }

    fn bugreport(&self, destination: &Path) -> Result<(), AppError> {
        let args = self.device_args(&["bugreport"]);
        debug!(trace_id = %self.trace_id, serial = %self.serial, path = %destination.display(), "adb bugreport");
        run_checked_to_file(
            &self.adb_program,
            &args,
            destination,
            self.bugreport_timeout,
            &self.trace_id,
        )?;
        Ok(())
    }

    fn start_rpc_server(&self, device_port: u16) -> Result<(), AppError> {
        let command = format!(
            "am start -a {RPC_LAUNCH_ACTION} --ei {RPC_PORT_EXTRA} {device_port} {RPC_LAUNCHER}"
        );
        self.shell(&command)?;
        Ok(())
    }

    fn spawn_logcat(
        &self,
        extra_params: &str,
        output: &Path,
    ) -> Result<Box<dyn CaptureProcess>, AppError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(output)
            .map_err(|err| {
                AppError::system(
                    format!("Failed to open logcat file {}: {err}", output.display()),
                    &self.trace_id,
                )
            })?;
        let mut cmd = Command::new(&self.adb_program);
        cmd.args(self.device_args(&["logcat", "-v", "threadtime"]));
        cmd.args(extra_params.split_whitespace());
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                AppError::dependency(format!("Failed to start logcat: {err}"), &self.trace_id)
            })?;
        Ok(Box::new(child))
    }
}
