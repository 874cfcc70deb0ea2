//! Error types for flow replay

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Browser driver not found: {0}. Install with: npm install playwright && npx playwright install")]
    DriverNotFound(String),

    #[error("Browser driver error: {0}")]
    Driver(String),

    #[error("Browser driver closed")]
    DriverClosed,

    #[error("Page command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Selector `{selector}` not actionable within {timeout_ms} ms: {reason}")]
    ReadinessTimeout {
        selector: String,
        timeout_ms: u64,
        reason: String,
    },

    #[error("Response #{seq} capture failed: {reason}")]
    ResponseCapture { seq: u64, reason: String },

    #[error("Recording parse error: {0}")]
    RecordingParse(String),

    #[error("Step {index} ({kind}) failed: {reason}")]
    StepFailed {
        index: usize,
        kind: String,
        reason: String,
    },

    #[error("Recording `{name}` failed: {reason}")]
    RecordingRun { name: String, reason: String },

    #[error("Replay session aborted: {0}")]
    Session(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl ReplayError {
    /// Short machine-readable name used in error records and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplayError::DriverNotFound(_) => "driver_not_found",
            ReplayError::Driver(_) => "driver",
            ReplayError::DriverClosed => "driver_closed",
            ReplayError::Command { .. } => "command",
            ReplayError::Timeout(_) => "timeout",
            ReplayError::ReadinessTimeout { .. } => "readiness_timeout",
            ReplayError::ResponseCapture { .. } => "response_capture",
            ReplayError::RecordingParse(_) => "recording_parse",
            ReplayError::StepFailed { .. } => "step_failed",
            ReplayError::RecordingRun { .. } => "recording_run",
            ReplayError::Session(_) => "session",
            ReplayError::InvalidConfig(_) => "invalid_config",
            ReplayError::Io(_) => "io",
            ReplayError::Json(_) => "json",
            ReplayError::Toml(_) => "toml",
            ReplayError::Base64(_) => "base64",
        }
    }
}

pub type ReplayResult<T> = Result<T, ReplayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_timeout_message() {
        let err = ReplayError::ReadinessTimeout {
            selector: "#submit".to_string(),
            timeout_ms: 5000,
            reason: "element not visible".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Selector `#submit` not actionable within 5000 ms: element not visible"
        );
        assert_eq!(err.kind(), "readiness_timeout");
    }

    #[test]
    fn test_io_conversion_keeps_kind() {
        let err: ReplayError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind(), "io");
    }
}
