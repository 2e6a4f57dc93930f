//! Command dispatcher.
//!
//! Two states: idle, or running exactly one gesture task. Every accepted command is
//! acknowledged and its payload validated. Only a valid command preempts whatever is
//! running (bounded join, never a deadlock) and is then routed to the gesture engine,
//! manual control, follow mode or face tracking.
//!
//! Rejections are always answered on the event channel; nothing here returns an error
//! to the bus loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{CancelToken, GestureEngine, GestureOutcome};
use crate::error::{BridgeError, ValidationError};
use crate::face_tracking::FaceTracking;
use crate::follow::{FollowMirror, FollowStart, MAX_FOLLOW_TIME_MS};
use crate::gestures::GestureCatalog;
use crate::manual::ManualControl;
use crate::messages::{CommandKind, EventSink, BROADCAST_ID};
use crate::RobotId;

/// Bound on waiting for a cancelled gesture to exit.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

const SET_JOINT_TIME_MS: u64 = 500;
const NUDGE_TIME_MS: u64 = 300;

struct ActionTask {
    id: u64,
    command: CommandKind,
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

/// A command whose payload passed validation.
#[derive(Debug, Clone)]
enum Request {
    Gesture(CommandKind),
    SetJoint { id: i64, angle: i64, time_ms: u16 },
    SetJoints { angles: [i64; 6], time_ms: u16 },
    NudgeJoint { id: i64, delta: i64, time_ms: u16 },
    StartFollow {
        leader: Option<String>,
        follower: Option<String>,
        time_ms: Option<u64>,
    },
    EndFollow,
    StartFaceTracking,
    StopFaceTracking,
}

/// Everything a dispatcher routes to.
#[derive(Debug, Clone)]
pub struct DispatchTargets {
    pub engine: GestureEngine,
    pub catalog: Arc<GestureCatalog>,
    pub manual: ManualControl,
    pub follow: FollowMirror,
    pub face: FaceTracking,
}

#[derive(Clone)]
pub struct Dispatcher {
    robot: RobotId,
    events: EventSink,
    targets: DispatchTargets,
    running: Arc<Mutex<Option<ActionTask>>>,
    next_id: Arc<AtomicU64>,
    serial: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("robot", &self.robot)
            .field("running", &self.running_command())
            .finish()
    }
}

/// Integer field the way loosely-typed senders write it: number, float or numeric string.
fn int_field(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn time_ms(data: &Value, default: u64) -> u16 {
    let ms = int_field(data.get("time_ms")).map_or(default, |t| t.max(0) as u64);
    u16::try_from(ms).unwrap_or(u16::MAX)
}

/// `id` wins unless it is missing or zero, then `sid`.
fn servo_id(data: &Value) -> Option<i64> {
    int_field(data.get("id"))
        .filter(|id| *id != 0)
        .or_else(|| int_field(data.get("sid")))
}

impl Dispatcher {
    pub fn new(robot: RobotId, events: EventSink, targets: DispatchTargets) -> Self {
        Self {
            robot,
            events,
            targets,
            running: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(0)),
            serial: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Gesture currently owned by the dispatcher, if any.
    pub fn running_command(&self) -> Option<CommandKind> {
        self.running
            .lock()
            .as_ref()
            .filter(|task| !task.handle.is_finished())
            .map(|task| task.command)
    }

    /// Handles one raw payload from a command topic.
    pub async fn handle_payload(&self, payload: &str) {
        match serde_json::from_str::<Value>(payload) {
            Ok(message) => self.handle(&message).await,
            Err(err) => {
                debug!(%err, "undecodable command payload");
                self.events.error(ValidationError::InvalidJson.code(), None);
            }
        }
    }

    pub async fn handle(&self, message: &Value) {
        let _serial = self.serial.lock().await;

        match message.get("type").and_then(Value::as_str) {
            None | Some("command") => {}
            Some("error") => {
                warn!(%message, "error message on command topic");
                return;
            }
            Some(other) => {
                debug!(kind = other, "ignoring non-command message");
                return;
            }
        }

        let target = message.get("robot_id").and_then(Value::as_str).unwrap_or("");
        if !(target.is_empty() || target == BROADCAST_ID || target == self.robot.as_str()) {
            debug!(target, "command addressed to another robot");
            return;
        }

        let Some(name) = message.get("command").and_then(Value::as_str) else {
            self.events.error(ValidationError::MissingCommand.code(), None);
            return;
        };
        let Some(command) = CommandKind::parse(name) else {
            warn!(command = name, "unknown command");
            self.events
                .error(ValidationError::UnknownCommand.code(), Some(name));
            return;
        };

        self.events.ack(command.as_str());
        let request = match self.validate(command, message) {
            Ok(request) => request,
            Err(err) => {
                info!(%command, %err, "command rejected");
                self.reject(command, err);
                return;
            }
        };
        info!(%command, robot_id = %self.robot, "preempt then dispatch");
        self.preempt(command != CommandKind::StopFaceTracking).await;
        self.dispatch(request).await;
    }

    /// Checks a command's payload without touching any state.
    fn validate(&self, command: CommandKind, data: &Value) -> Result<Request, BridgeError> {
        if command.is_gesture() {
            return Ok(Request::Gesture(command));
        }
        let manual = matches!(
            command,
            CommandKind::SetJoint | CommandKind::SetJoints | CommandKind::NudgeJoint
        );
        if manual && !self.targets.engine.bus().available() {
            return Err(BridgeError::ArmUnavailable);
        }
        let request = match command {
            CommandKind::SetJoint => {
                let id = servo_id(data)
                    .filter(|id| (1..=6).contains(id))
                    .ok_or(ValidationError::InvalidSid)?;
                let angle = int_field(data.get("angle")).ok_or(ValidationError::MissingAngle)?;
                Request::SetJoint {
                    id,
                    angle,
                    time_ms: time_ms(data, SET_JOINT_TIME_MS),
                }
            }
            CommandKind::SetJoints => {
                let list = data
                    .get("angles")
                    .and_then(Value::as_array)
                    .filter(|list| list.len() == 6)
                    .ok_or(ValidationError::InvalidAngles)?;
                let mut angles = [0i64; 6];
                for (slot, value) in angles.iter_mut().zip(list) {
                    *slot = int_field(Some(value)).ok_or(ValidationError::InvalidAngles)?;
                }
                Request::SetJoints {
                    angles,
                    time_ms: time_ms(data, SET_JOINT_TIME_MS),
                }
            }
            CommandKind::NudgeJoint => {
                let id = servo_id(data)
                    .filter(|id| (1..=6).contains(id))
                    .ok_or(ValidationError::InvalidSid)?;
                let delta = match data.get("delta") {
                    None => 0,
                    value => int_field(value).ok_or(ValidationError::InvalidDelta)?,
                };
                Request::NudgeJoint {
                    id,
                    delta,
                    time_ms: time_ms(data, NUDGE_TIME_MS),
                }
            }
            CommandKind::StartFollow => {
                let time_ms = match data.get("time_ms") {
                    None | Some(Value::Null) => None,
                    value => {
                        let ms = int_field(value)
                            .filter(|t| (0..=MAX_FOLLOW_TIME_MS as i64).contains(t))
                            .ok_or(ValidationError::InvalidTime)?;
                        Some(ms as u64).filter(|t| *t != 0)
                    }
                };
                Request::StartFollow {
                    leader: data.get("leader").and_then(Value::as_str).map(str::to_string),
                    follower: data.get("follower").and_then(Value::as_str).map(str::to_string),
                    time_ms,
                }
            }
            CommandKind::EndFollow => Request::EndFollow,
            CommandKind::StartFaceTracking => Request::StartFaceTracking,
            CommandKind::StopFaceTracking => Request::StopFaceTracking,
            other => Request::Gesture(other),
        };
        Ok(request)
    }

    /// Cancels and joins the running gesture. Face tracking is stopped as well unless the
    /// caller is about to stop it itself.
    async fn preempt(&self, stop_face: bool) {
        let task = self.running.lock().take();
        if let Some(task) = task {
            if !task.handle.is_finished() {
                info!(command = %task.command, "cancelling running gesture");
                task.cancel.cancel();
                if tokio::time::timeout(JOIN_TIMEOUT, task.handle).await.is_err() {
                    warn!(command = %task.command, "gesture did not stop within the join window");
                }
            }
        }
        if stop_face && self.targets.face.is_running() {
            info!("stopping face tracking for preemption");
            self.targets.face.stop().await;
        }
    }

    async fn dispatch(&self, request: Request) {
        match request {
            Request::Gesture(command) => self.start_gesture(command),
            Request::SetJoint { id, angle, time_ms } => {
                info!(sid = id, angle, time_ms, "set_joint request");
                let done = self.targets.manual.set_joint(id, angle, time_ms).await;
                self.manual_done(CommandKind::SetJoint, done.map(|_| true));
            }
            Request::SetJoints { angles, time_ms } => {
                let done = self.targets.manual.set_joints(angles, time_ms).await;
                self.manual_done(CommandKind::SetJoints, done.map(|_| true));
            }
            Request::NudgeJoint { id, delta, time_ms } => {
                let done = self.targets.manual.nudge_joint(id, delta, time_ms).await;
                self.manual_done(CommandKind::NudgeJoint, done.map(|moved| moved.is_some()));
            }
            Request::StartFollow {
                leader,
                follower,
                time_ms,
            } => self.start_follow(leader.as_deref(), follower.as_deref(), time_ms),
            Request::EndFollow => self.end_follow(),
            Request::StartFaceTracking => self.start_face_tracking(),
            Request::StopFaceTracking => self.stop_face_tracking().await,
        }
    }

    fn start_gesture(&self, command: CommandKind) {
        let name = command.as_str();
        if !self.targets.engine.bus().available() {
            self.events.result_error(name, "arm_unavailable");
            return;
        }
        let Some(gesture) = self.targets.catalog.get(command).cloned() else {
            self.events.result_error(name, ValidationError::UnknownCommand.code());
            return;
        };

        self.events.progress(name, "started");
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancelToken::new();
        let engine = self.targets.engine.clone();
        let events = self.events.clone();
        let running = self.running.clone();
        let token = cancel.clone();

        // Held across spawn so the task cannot clear its slot before it is filled.
        let mut slot = self.running.lock();
        let handle = tokio::spawn(async move {
            info!(command = name, "action start");
            let outcome = engine.run(&gesture, &token).await;
            let described = outcome.describe(gesture.prefix);
            match &outcome {
                GestureOutcome::Failed(msg) => {
                    warn!(command = name, error = %msg, "action failed");
                    events.emit(json!({
                        "type": "result",
                        "command": name,
                        "status": outcome.status(),
                        "outcome": described,
                        "error": msg,
                    }));
                }
                _ => {
                    info!(command = name, outcome = %described, "action result");
                    events.result(name, outcome.status(), Value::String(described));
                }
            }
            let mut slot = running.lock();
            if slot.as_ref().map_or(false, |task| task.id == id) {
                *slot = None;
            }
        });
        *slot = Some(ActionTask {
            id,
            command,
            cancel,
            handle,
        });
    }

    /// Answers a command that was refused before anything ran.
    fn reject(&self, command: CommandKind, err: BridgeError) {
        match err {
            BridgeError::Validation(v) => self.events.result_error(command.as_str(), v.code()),
            BridgeError::ArmUnavailable => {
                self.events.result_error(command.as_str(), "arm_unavailable")
            }
            other => self.manual_result(command, Err(other.to_string())),
        }
    }

    /// Emits the manual-command result shape: `ok`, or `error` with `error:<msg>`.
    fn manual_result(&self, command: CommandKind, outcome: std::result::Result<(), String>) {
        match outcome {
            Ok(()) => self.events.result(command.as_str(), "ok", json!("ok")),
            Err(msg) => self
                .events
                .result(command.as_str(), "error", json!(format!("error:{msg}"))),
        }
    }

    /// `Ok(false)` means the joint could not be read, so nothing moved.
    fn manual_done(&self, command: CommandKind, done: Result<bool, BridgeError>) {
        match done {
            Ok(true) => self.manual_result(command, Ok(())),
            Ok(false) => self.manual_result(command, Err("read_failed".to_string())),
            Err(err) => self.reject(command, err),
        }
    }

    fn start_follow(&self, leader: Option<&str>, follower: Option<&str>, time_ms: Option<u64>) {
        let name = CommandKind::StartFollow.as_str();
        match self.targets.follow.start(leader, follower, time_ms) {
            FollowStart::Started(follow) => self.events.result(
                name,
                "started",
                json!({
                    "leader": follow.leader,
                    "follower": follow.follower,
                    "time_ms": follow.time_ms,
                }),
            ),
            FollowStart::NotFollower => {
                info!(me = %self.robot, "start_follow ignored: not follower");
                self.events.result(name, "ignored", json!("not_follower"));
            }
        }
    }

    fn end_follow(&self) {
        let name = CommandKind::EndFollow.as_str();
        let status = if self.targets.follow.stop() {
            "stopped"
        } else {
            "not_running"
        };
        self.events.emit(json!({"type": "result", "command": name, "status": status}));
    }

    fn start_face_tracking(&self) {
        let name = CommandKind::StartFaceTracking.as_str();
        let face = &self.targets.face;
        if !face.available() {
            warn!("face tracking unavailable");
            self.events.result_error(name, "arm_or_tracker_unavailable");
            return;
        }
        let status = if face.start() { "running" } else { "already_running" };
        self.events.emit(json!({"type": "result", "command": name, "status": status}));
    }

    async fn stop_face_tracking(&self) {
        let name = CommandKind::StopFaceTracking.as_str();
        let face = &self.targets.face;
        if !face.available() {
            self.events.result_error(name, "tracker_unavailable");
            return;
        }
        let status = if face.stop().await { "stopped" } else { "not_running" };
        self.events.emit(json!({"type": "result", "command": name, "status": status}));
    }

    /// Cancels the running gesture and stops face tracking. Used on shutdown.
    pub async fn shutdown(&self) {
        let _serial = self.serial.lock().await;
        self.preempt(true).await;
    }
}
