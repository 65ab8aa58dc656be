use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use crate::app::controller::DeviceController;
use crate::app::error::AppError;
use crate::app::logline::normalize_log_line_timestamp;
use crate::app::scheduler::TaskScheduler;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotOutcome {
    pub serial: String,
    pub result: Result<PathBuf, AppError>,
}

impl SnapshotOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Takes a bug report on every controller at once. One outcome per
/// controller, in input order; a failing device does not affect the others.
pub fn capture_all(
    controllers: &[&DeviceController],
    test_name: &str,
    begin: &str,
    scheduler: &TaskScheduler,
    trace_id: &str,
) -> Vec<SnapshotOutcome> {
    let begin = normalize_log_line_timestamp(begin);
    info!(trace_id = %trace_id, devices = controllers.len(), test_name, "capturing bug reports");
    let results = scheduler.fan_out(controllers, trace_id, |controller| {
        controller.take_diagnostic_snapshot(test_name, &begin, trace_id)
    });
    controllers
        .iter()
        .zip(results)
        .map(|(controller, result)| {
            if let Err(err) = &result {
                warn!(trace_id = %trace_id, serial = %controller.serial(), error = %err, "bug report failed");
            }
            SnapshotOutcome {
                serial: controller.serial().to_string(),
                result,
            }
        })
        .collect()
}
