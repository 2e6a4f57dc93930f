//! Carebot robot-arm bridge.
//!
//! This crate connects a six-joint serial robot arm to a message bus:
//! - [`protocol`]: checksummed frame codec for the servo controller.
//! - [`guard`]: the single lock every serial exchange goes through.
//! - [`engine`] and [`gestures`]: cancellable execution of authored gesture tables.
//! - [`dispatcher`]: validates commands and preempts the running gesture.
//! - [`telemetry`], [`follow`] and [`face_tracking`]: background loops sharing the arm.
//! - [`orchestrator`]: the rock-paper-scissors round driven over the bus.
//! - [`bridge`]: builds all of the above for one arm and routes bus traffic.
//! - [`mqtt`] and [`link`]: the two broker links behind [`bus::MessageBus`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod bridge;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod face_tracking;
pub mod follow;
pub mod gestures;
pub mod guard;
pub mod link;
pub mod logging;
pub mod manual;
pub mod messages;
pub mod motion;
pub mod mqtt;
pub mod orchestrator;
pub mod protocol;
pub mod speech;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result, ValidationError};

/// Which physical arm this instance drives.
///
/// The two arms are mounted facing each other, so several poses differ per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RobotId {
    #[serde(rename = "robot_left")]
    Left,
    #[serde(rename = "robot_right")]
    Right,
}

impl RobotId {
    pub fn as_str(self) -> &'static str {
        match self {
            RobotId::Left => "robot_left",
            RobotId::Right => "robot_right",
        }
    }
}

impl fmt::Display for RobotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RobotId {
    type Err = BridgeError;

    /// Accepts `robot_left`/`left` and `robot_right`/`right`, case-insensitively.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "robot_left" | "left" => Ok(RobotId::Left),
            "robot_right" | "right" => Ok(RobotId::Right),
            other => Err(BridgeError::Config(format!("unknown robot id {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn robot_id_parses_short_and_long_names() {
        assert_eq!("left".parse::<RobotId>().expect("left"), RobotId::Left);
        assert_eq!("ROBOT_RIGHT".parse::<RobotId>().expect("right"), RobotId::Right);
        assert!("robot_middle".parse::<RobotId>().is_err());
    }

    #[test]
    fn robot_id_serializes_as_wire_name() {
        assert_eq!(
            serde_json::to_string(&RobotId::Right).expect("json"),
            "\"robot_right\""
        );
    }
}
