//! Error types shared by every bridge component.
//!
//! Only [`BridgeError::Transport`] and [`BridgeError::ConnectivityLost`] describe a
//! broken link; everything else is scoped to the single command or frame that caused
//! it. Nothing in this crate turns an error into a process exit.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failures surfaced by the codec, the dispatcher and the link layers.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Serial write/read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Inbound frame whose trailing checksum did not match its contents.
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    /// A command or payload that failed validation. No state was mutated.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Message-bus or serial link dropped.
    #[error("connectivity lost: {0}")]
    ConnectivityLost(String),

    /// No arm is attached to this instance.
    #[error("arm_unavailable")]
    ArmUnavailable,

    /// A bounded wait expired.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Short machine-readable code used in outbound `error` fields.
    pub fn code(&self) -> String {
        match self {
            BridgeError::Validation(v) => v.code().to_string(),
            BridgeError::ArmUnavailable => "arm_unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

/// Rejected input, mapped one-to-one onto wire error codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("servo id out of range")]
    InvalidSid,
    #[error("angle missing")]
    MissingAngle,
    #[error("delta is not an integer")]
    InvalidDelta,
    #[error("expected exactly six angles")]
    InvalidAngles,
    #[error("time_ms is not a usable duration")]
    InvalidTime,
    #[error("angle {angle} out of range for joint {joint}")]
    AngleOutOfRange { joint: u8, angle: i32 },
    #[error("command not in allow-list")]
    UnknownCommand,
    #[error("command field missing")]
    MissingCommand,
    #[error("payload is not valid json")]
    InvalidJson,
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidSid => "invalid_sid",
            ValidationError::MissingAngle => "missing_angle",
            ValidationError::InvalidDelta => "invalid_delta",
            ValidationError::InvalidAngles => "invalid_angles",
            ValidationError::InvalidTime => "invalid_time_ms",
            ValidationError::AngleOutOfRange { .. } => "angle_out_of_range",
            ValidationError::UnknownCommand => "unknown_command",
            ValidationError::MissingCommand => "missing_command",
            ValidationError::InvalidJson => "invalid_json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_codes_survive_wrapping() {
        let err: BridgeError = ValidationError::InvalidSid.into();
        assert_eq!(err.code(), "invalid_sid");
    }

    #[test]
    fn transport_code_carries_message() {
        let err = BridgeError::Transport("port closed".to_string());
        assert_eq!(err.code(), "transport error: port closed");
    }
}
