use serde::Serialize;
use std::fmt;
use uuid::Uuid;

pub const ERR_CONFIGURATION: &str = "ERR_CONFIGURATION";
pub const ERR_RESOURCE_EXHAUSTED: &str = "ERR_RESOURCE_EXHAUSTED";
pub const ERR_PROTOCOL: &str = "ERR_PROTOCOL";
pub const ERR_USAGE: &str = "ERR_USAGE";
pub const ERR_TRANSIENT_DEVICE: &str = "ERR_TRANSIENT_DEVICE";
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";
pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_DEPENDENCY: &str = "ERR_DEPENDENCY";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";

/// The controller phase an error surfaced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Port,
    Session,
    Reboot,
    Logging,
    Snapshot,
    Discovery,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Port => "port",
            Phase::Session => "session",
            Phase::Reboot => "reboot",
            Phase::Logging => "logging",
            Phase::Snapshot => "snapshot",
            Phase::Discovery => "discovery",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
            serial: None,
            phase: None,
        }
    }

    /// Malformed or empty device configuration; aborts startup.
    pub fn configuration(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_CONFIGURATION, message, trace_id)
    }

    pub fn resource_exhausted(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_RESOURCE_EXHAUSTED, message, trace_id)
    }

    /// The RPC server broke the session contract (duplicate or unknown uid).
    pub fn protocol(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_PROTOCOL, message, trace_id)
    }

    pub fn usage(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_USAGE, message, trace_id)
    }

    /// The device side is unreachable right now; one relaunch-and-retry is allowed.
    pub fn transient(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TRANSIENT_DEVICE, message, trace_id)
    }

    pub fn timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TIMEOUT, message, trace_id)
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_DEPENDENCY, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    /// Attaches device context. The first phase attached wins, so the
    /// innermost failing step is what gets reported.
    pub fn at(mut self, serial: &str, phase: Phase) -> Self {
        if self.serial.is_none() {
            self.serial = Some(serial.to_string());
        }
        if self.phase.is_none() {
            self.phase = Some(phase);
        }
        self
    }

    pub fn is_transient(&self) -> bool {
        self.code == ERR_TRANSIENT_DEVICE
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.serial, &self.phase) {
            (Some(serial), Some(phase)) => {
                write!(f, "[{serial}] {phase}: {} ({})", self.error, self.code)
            }
            (Some(serial), None) => write!(f, "[{serial}] {} ({})", self.error, self.code),
            _ => write!(f, "{} ({})", self.error, self.code),
        }
    }
}

impl std::error::Error for AppError {}

/// Uses the caller's trace id when given, else mints a fresh one.
pub fn resolve_trace_id(input: Option<&str>) -> String {
    input
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_serial_and_phase() {
        let err = AppError::timeout("device did not finish booting", "trace-1")
            .at("ABC123", Phase::Reboot);
        assert_eq!(
            err.to_string(),
            "[ABC123] reboot: device did not finish booting (ERR_TIMEOUT)"
        );
    }

    #[test]
    fn innermost_phase_is_kept() {
        let err = AppError::transient("rpc unreachable", "trace-2")
            .at("ABC123", Phase::Session)
            .at("ABC123", Phase::Reboot);
        assert_eq!(err.phase, Some(Phase::Session));
        assert!(err.is_transient());
    }

    #[test]
    fn serializes_without_empty_context() {
        let value = serde_json::to_value(AppError::usage("nope", "t")).expect("json");
        assert_eq!(value["code"], "ERR_USAGE");
        assert!(value.get("serial").is_none());
    }

    #[test]
    fn resolve_trace_id_keeps_non_blank_input() {
        assert_eq!(resolve_trace_id(Some("abc")), "abc");
        assert_eq!(resolve_trace_id(Some("  ")).len(), 36);
        assert_ne!(resolve_trace_id(None), resolve_trace_id(None));
    }
}
