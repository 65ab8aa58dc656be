use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde::Serialize;

use hil_device_controller_lib::app::bugreport::capture_all;
use hil_device_controller_lib::app::config::{
    load_config, load_config_from_path, ControllerConfig, DeviceConfig, DeviceSelection,
};
use hil_device_controller_lib::app::controller::DeviceController;
use hil_device_controller_lib::app::discovery::{destroy, Discovery};
use hil_device_controller_lib::app::error::{resolve_trace_id, AppError};
use hil_device_controller_lib::app::logging::init_logging;
use hil_device_controller_lib::app::logline::log_line_timestamp_now;
use hil_device_controller_lib::app::scheduler::TaskScheduler;

#[derive(Debug, Parser)]
#[command(name = "hil_smoke", about = "Smoke checks for HIL device controllers")]
struct Cli {
    /// Config file; defaults to $HIL_CONTROLLER_CONFIG or ~/.hil_controller_config.json.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Restrict the run to these serials instead of the configured devices.
    #[arg(long = "serial")]
    serials: Vec<String>,

    #[command(subcommand)]
    command: SmokeCommand,
}

#[derive(Debug, Subcommand)]
enum SmokeCommand {
    /// List devices attached over adb and fastboot.
    Devices,
    /// Take a bug report on every selected device concurrently.
    Bugreport {
        #[arg(long, default_value = "hil_smoke")]
        test_name: String,
    },
    /// Capture logcat for a while and cut an excerpt of it.
    Excerpt {
        #[arg(long, default_value = "hil_smoke")]
        tag: String,
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Reboot every selected device and bring its services back.
    Reboot,
}

impl SmokeCommand {
    fn name(&self) -> &'static str {
        match self {
            SmokeCommand::Devices => "devices",
            SmokeCommand::Bugreport { .. } => "bugreport",
            SmokeCommand::Excerpt { .. } => "excerpt",
            SmokeCommand::Reboot => "reboot",
        }
    }
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    command: &'static str,
    status: &'static str,
    trace_id: String,
    checks: Vec<SmokeCheck>,
}

#[derive(Serialize)]
struct SmokeCheck {
    name: String,
    status: &'static str, // pass|fail
    duration_ms: u128,
    artifacts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SmokeCheck {
    fn from_result(name: String, start: Instant, result: Result<Vec<String>, AppError>) -> Self {
        let duration_ms = start.elapsed().as_millis();
        match result {
            Ok(artifacts) => Self {
                name,
                status: "pass",
                duration_ms,
                artifacts,
                error_code: None,
                error: None,
            },
            Err(err) => Self {
                name,
                status: "fail",
                duration_ms,
                artifacts: vec![],
                error_code: Some(err.code.clone()),
                error: Some(err.to_string()),
            },
        }
    }
}

fn device_selection(cli: &Cli, config: &ControllerConfig, trace_id: &str) -> Result<DeviceSelection, AppError> {
    if !cli.serials.is_empty() {
        return Ok(DeviceSelection::Devices(
            cli.serials.iter().map(DeviceConfig::from_serial).collect(),
        ));
    }
    if config.devices.is_null() {
        return Ok(DeviceSelection::AllAttached {
            include_bootloader: false,
        });
    }
    config.device_selection(trace_id)
}

fn path_text(path: &std::path::Path) -> String {
    path.display().to_string()
}

fn run_devices(discovery: &Discovery) -> Vec<SmokeCheck> {
    let start = Instant::now();
    let adb = discovery.list_adb_devices();
    let adb_check = SmokeCheck::from_result("adb_devices".to_string(), start, adb);
    let start = Instant::now();
    let fastboot = discovery.list_fastboot_devices();
    vec![
        adb_check,
        SmokeCheck::from_result("fastboot_devices".to_string(), start, fastboot),
    ]
}

fn run_bugreport(
    controllers: &[DeviceController],
    test_name: &str,
    config: &ControllerConfig,
    trace_id: &str,
) -> Vec<SmokeCheck> {
    let start = Instant::now();
    let refs: Vec<&DeviceController> = controllers.iter().collect();
    let scheduler = TaskScheduler::new(config.bugreport.concurrency);
    capture_all(&refs, test_name, &log_line_timestamp_now(), &scheduler, trace_id)
        .into_iter()
        .map(|outcome| {
            SmokeCheck::from_result(
                format!("bugreport:{}", outcome.serial),
                start,
                outcome.result.map(|path| vec![path_text(&path)]),
            )
        })
        .collect()
}

fn run_excerpt(
    controllers: &[DeviceController],
    tag: &str,
    seconds: u64,
    trace_id: &str,
) -> Vec<SmokeCheck> {
    let begin = log_line_timestamp_now();
    thread::sleep(Duration::from_secs(seconds));
    controllers
        .iter()
        .map(|controller| {
            let start = Instant::now();
            let result = controller
                .extract_logcat(tag, &begin, trace_id)
                .map(|path| vec![path_text(&path)]);
            SmokeCheck::from_result(format!("excerpt:{}", controller.serial()), start, result)
        })
        .collect()
}

fn run_reboot(controllers: &mut [DeviceController], trace_id: &str) -> Vec<SmokeCheck> {
    controllers
        .iter_mut()
        .map(|controller| {
            let start = Instant::now();
            let result = controller.reboot(trace_id).map(|_| {
                controller
                    .logcat()
                    .last_file()
                    .map(path_text)
                    .into_iter()
                    .collect()
            });
            SmokeCheck::from_result(format!("reboot:{}", controller.serial()), start, result)
        })
        .collect()
}

fn run(cli: &Cli, trace_id: &str) -> Result<Vec<SmokeCheck>, AppError> {
    let config = match &cli.config {
        Some(path) => load_config_from_path(path, trace_id)?,
        None => load_config(trace_id)?,
    };
    init_logging(&config.logging.log_level);
    let discovery = Discovery::from_config(&config, trace_id);

    let checks = match &cli.command {
        SmokeCommand::Devices => run_devices(&discovery),
        SmokeCommand::Bugreport { test_name } => {
            let selection = device_selection(cli, &config, trace_id)?;
            let mut controllers = discovery
                .without_services()
                .discover(&selection, trace_id)?;
            let checks = run_bugreport(&controllers, test_name, &config, trace_id);
            destroy(&mut controllers, trace_id);
            checks
        }
        SmokeCommand::Excerpt { tag, seconds } => {
            let selection = device_selection(cli, &config, trace_id)?;
            let mut controllers = discovery.discover(&selection, trace_id)?;
            let checks = run_excerpt(&controllers, tag, *seconds, trace_id);
            destroy(&mut controllers, trace_id);
            checks
        }
        SmokeCommand::Reboot => {
            let selection = device_selection(cli, &config, trace_id)?;
            let mut controllers = discovery.discover(&selection, trace_id)?;
            let checks = run_reboot(&mut controllers, trace_id);
            destroy(&mut controllers, trace_id);
            checks
        }
    };
    Ok(checks)
}

fn main() {
    let cli = Cli::parse();
    let trace_id = resolve_trace_id(None);

    let checks = match run(&cli, &trace_id) {
        Ok(checks) => checks,
        Err(err) => vec![SmokeCheck::from_result(
            "setup".to_string(),
            Instant::now(),
            Err(err),
        )],
    };
    let status = if checks.iter().all(|check| check.status == "pass") {
        "pass"
    } else {
        "fail"
    };
    let summary = SmokeSummary {
        tool: "hil_smoke",
        command: cli.command.name(),
        status,
        trace_id,
        checks,
    };
    match serde_json::to_string_pretty(&summary) {
        Ok(text) => println!("{text}"),
        Err(err) => {
            eprintln!("Failed to encode summary: {err}");
            std::process::exit(1);
        }
    }
    if status != "pass" {
        std::process::exit(1);
    }
}
