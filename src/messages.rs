//! Message-bus envelopes: topics, the command allow-list and outbound events.
//!
//! Outbound messages never go straight to the bus. Components push them into an
//! [`EventSink`]; a single publisher task drains the channel and routes `joint_state`
//! to the joint topic and everything else to the event topic.

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::RobotId;

/// Sentinel `robot_id` addressing every instance.
pub const BROADCAST_ID: &str = "all";

/// Topic names derived from the configured base topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
    robot: RobotId,
}

impl Topics {
    pub fn new(base: impl Into<String>, robot: RobotId) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
            robot,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn broadcast_command(&self) -> String {
        format!("{}/robot/{BROADCAST_ID}/command", self.base)
    }

    pub fn own_command(&self) -> String {
        self.command_for(self.robot.as_str())
    }

    pub fn command_for(&self, robot_id: &str) -> String {
        format!("{}/robot/{robot_id}/command", self.base)
    }

    pub fn event(&self) -> String {
        format!("{}/robot/event", self.base)
    }

    pub fn joint(&self) -> String {
        format!("{}/robot/joint", self.base)
    }

    pub fn face(&self) -> String {
        format!("{}/robot/{}/face", self.base, self.robot.as_str())
    }

    /// Topics the bridge subscribes to.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            self.broadcast_command(),
            self.own_command(),
            self.joint(),
            self.face(),
        ]
    }
}

/// Every command the bridge accepts. Anything else is `unknown_command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    InitPose,
    MakeHeart,
    MakeHug,
    MakeHello,
    Scissors,
    Rock,
    Paper,
    GoodMorning,
    GoodNight,
    Hungry,
    AteAll,
    SetJoint,
    SetJoints,
    NudgeJoint,
    StartFollow,
    EndFollow,
    StartFaceTracking,
    StopFaceTracking,
}

impl CommandKind {
    pub const ALL: [CommandKind; 18] = [
        CommandKind::InitPose,
        CommandKind::MakeHeart,
        CommandKind::MakeHug,
        CommandKind::MakeHello,
        CommandKind::Scissors,
        CommandKind::Rock,
        CommandKind::Paper,
        CommandKind::GoodMorning,
        CommandKind::GoodNight,
        CommandKind::Hungry,
        CommandKind::AteAll,
        CommandKind::SetJoint,
        CommandKind::SetJoints,
        CommandKind::NudgeJoint,
        CommandKind::StartFollow,
        CommandKind::EndFollow,
        CommandKind::StartFaceTracking,
        CommandKind::StopFaceTracking,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::InitPose => "init_pose",
            CommandKind::MakeHeart => "make_heart",
            CommandKind::MakeHug => "make_hug",
            CommandKind::MakeHello => "make_hello",
            CommandKind::Scissors => "scissors",
            CommandKind::Rock => "rock",
            CommandKind::Paper => "paper",
            CommandKind::GoodMorning => "good_morning",
            CommandKind::GoodNight => "good_night",
            CommandKind::Hungry => "hungry",
            CommandKind::AteAll => "ate_all",
            CommandKind::SetJoint => "set_joint",
            CommandKind::SetJoints => "set_joints",
            CommandKind::NudgeJoint => "nudge_joint",
            CommandKind::StartFollow => "start_follow",
            CommandKind::EndFollow => "end_follow",
            CommandKind::StartFaceTracking => "start_face_tracking",
            CommandKind::StopFaceTracking => "stop_face_tracking",
        }
    }

    /// Exact, case-sensitive lookup.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    pub fn is_gesture(self) -> bool {
        matches!(
            self,
            CommandKind::InitPose
                | CommandKind::MakeHeart
                | CommandKind::MakeHug
                | CommandKind::MakeHello
                | CommandKind::Scissors
                | CommandKind::Rock
                | CommandKind::Paper
                | CommandKind::GoodMorning
                | CommandKind::GoodNight
                | CommandKind::Hungry
                | CommandKind::AteAll
        )
    }

    /// Gesture commands advertised in `hello`.
    pub fn gestures() -> impl Iterator<Item = CommandKind> {
        Self::ALL.into_iter().filter(|kind| kind.is_gesture())
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an outbound message is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Event,
    Joint,
}

/// One stamped outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub channel: Channel,
    pub payload: Value,
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Producer side of the outbound channel.
///
/// Every message is stamped with `ts` (when absent), `who: "robot"` and this
/// instance's `robot_id` before it is queued.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Outbound>,
    robot: RobotId,
}

impl EventSink {
    pub fn channel(robot: RobotId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, robot }, rx)
    }

    pub fn robot(&self) -> RobotId {
        self.robot
    }

    pub fn emit(&self, payload: Value) {
        let mut map = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        map.entry("ts").or_insert_with(|| Value::String(now_iso()));
        map.entry("who")
            .or_insert_with(|| Value::String("robot".to_string()));
        map.insert(
            "robot_id".to_string(),
            Value::String(self.robot.as_str().to_string()),
        );

        let channel = match map.get("type").and_then(Value::as_str) {
            Some("joint_state") => Channel::Joint,
            _ => Channel::Event,
        };
        if self
            .tx
            .send(Outbound {
                channel,
                payload: Value::Object(map),
            })
            .is_err()
        {
            debug!("outbound channel closed; message dropped");
        }
    }

    pub fn ack(&self, command: &str) {
        self.emit(json!({"type": "ack", "command": command, "status": "accepted"}));
    }

    pub fn progress(&self, command: &str, status: &str) {
        self.emit(json!({"type": "progress", "command": command, "status": status}));
    }

    pub fn result(&self, command: &str, status: &str, outcome: Value) {
        self.emit(json!({
            "type": "result",
            "command": command,
            "status": status,
            "outcome": outcome,
        }));
    }

    /// `result` carrying an error code instead of an outcome.
    pub fn result_error(&self, command: &str, error: &str) {
        self.emit(json!({
            "type": "result",
            "command": command,
            "status": "error",
            "error": error,
        }));
    }

    /// Top-level `error` (message rejected before dispatch).
    pub fn error(&self, error: &str, command: Option<&str>) {
        let mut payload = json!({"type": "error", "error": error});
        if let (Some(command), Value::Object(map)) = (command, &mut payload) {
            map.insert("command".to_string(), Value::String(command.to_string()));
        }
        self.emit(payload);
    }

    pub fn hello(&self, capabilities: &[String]) {
        self.emit(json!({
            "type": "hello",
            "agent": "robot",
            "capabilities": capabilities,
        }));
    }

    pub fn joint_state(&self, angles: &[Option<u16>; 6], seq: u64) {
        self.emit(json!({"type": "joint_state", "angles": angles, "seq": seq}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_base() {
        let topics = Topics::new("carebot/", RobotId::Right);
        assert_eq!(topics.broadcast_command(), "carebot/robot/all/command");
        assert_eq!(topics.own_command(), "carebot/robot/robot_right/command");
        assert_eq!(topics.event(), "carebot/robot/event");
        assert_eq!(topics.joint(), "carebot/robot/joint");
        assert_eq!(topics.face(), "carebot/robot/robot_right/face");
    }

    #[test]
    fn allow_list_is_exact() {
        assert_eq!(CommandKind::parse("make_heart"), Some(CommandKind::MakeHeart));
        assert_eq!(CommandKind::parse("Make_Heart"), None);
        assert_eq!(CommandKind::parse("dance"), None);
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CommandKind::gestures().count(), 11);
    }

    #[test]
    fn sink_stamps_identity_and_routes_joint_state() {
        let (sink, mut rx) = EventSink::channel(RobotId::Left);
        sink.ack("rock");
        sink.joint_state(&[Some(1), None, Some(3), Some(4), Some(5), Some(6)], 7);

        let ack = rx.try_recv().expect("ack");
        assert_eq!(ack.channel, Channel::Event);
        assert_eq!(ack.payload["who"], "robot");
        assert_eq!(ack.payload["robot_id"], "robot_left");
        assert!(ack.payload["ts"].is_string());

        let state = rx.try_recv().expect("joint state");
        assert_eq!(state.channel, Channel::Joint);
        assert_eq!(state.payload["seq"], 7);
        assert!(state.payload["angles"][1].is_null());
    }

    #[test]
    fn unknown_command_error_names_the_command() {
        let (sink, mut rx) = EventSink::channel(RobotId::Left);
        sink.error("unknown_command", Some("dance"));
        let msg = rx.try_recv().expect("error");
        assert_eq!(msg.payload["error"], "unknown_command");
        assert_eq!(msg.payload["command"], "dance");
    }
}
