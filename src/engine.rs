//! Gesture execution.
//!
//! A [`Gesture`] is data: an ordered list of [`Step`]s. Before running, the steps are
//! flattened into a [`PlannedStep`] list for the arm side this instance drives (mirroring,
//! per-side branches, repeats and the random wave are all resolved there). The engine then
//! walks the plan, sending each frame twice and sleeping in short slices so a
//! [`CancelToken`] is honoured within one slice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::error::Result;
use crate::guard::BusGuard;
use crate::messages::{CommandKind, EventSink};
use crate::motion::{neutral_pose, JointPose, MotionFrame, PoseSpec, READY_POSE};
use crate::RobotId;

/// Delay before the redundant second send of a frame.
pub const RESEND_DELAY: Duration = Duration::from_millis(30);
/// Longest the redundant send waits for the bus before it is skipped.
pub const RESEND_WAIT: Duration = Duration::from_millis(50);
/// Granularity of cancellable sleeps.
pub const SLEEP_SLICE: Duration = Duration::from_millis(50);

const READY_MOVE_MS: u16 = 1500;

/// Cooperative cancellation flag shared between the dispatcher and a running gesture.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a gesture ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GestureOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

impl GestureOutcome {
    /// `<prefix>_completed`, `<prefix>_cancelled` or `error:<message>`.
    pub fn describe(&self, prefix: &str) -> String {
        match self {
            GestureOutcome::Completed => format!("{prefix}_completed"),
            GestureOutcome::Cancelled => format!("{prefix}_cancelled"),
            GestureOutcome::Failed(msg) => format!("error:{msg}"),
        }
    }

    /// Value of the `status` field in the final `result`.
    pub fn status(&self) -> &'static str {
        match self {
            GestureOutcome::Completed => "completed",
            GestureOutcome::Cancelled => "cancelled",
            GestureOutcome::Failed(_) => "error",
        }
    }
}

/// One authored step of a gesture.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Frame(MotionFrame),
    /// Cancellable pause. A zero hold is skipped.
    Hold(u64),
    Repeat { times: u32, steps: Vec<Step> },
    /// Steps that only one arm performs.
    ForSide { left: Vec<Step>, right: Vec<Step> },
    /// Picks a left-authored seed pose at random and jitters joints 2, 3, 4 and 6.
    Wave {
        seeds: Vec<[u16; 6]>,
        repeat: u32,
        move_ms: u64,
        overlap_ms: u64,
        jitter: u16,
    },
    /// Returns to the side's neutral pose and reports `init_completed`.
    Neutral { move_ms: u64 },
}

impl Step {
    pub fn frame(pose: PoseSpec, move_ms: u64, overlap_ms: u64) -> Self {
        Step::Frame(MotionFrame::new(pose, move_ms, overlap_ms))
    }
}

/// Concrete step for one arm, ready to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedStep {
    Send {
        pose: JointPose,
        move_ms: u64,
        overlap_ms: u64,
    },
    Hold(u64),
    Neutral {
        pose: JointPose,
        move_ms: u64,
    },
}

/// A named choreography.
#[derive(Debug, Clone, PartialEq)]
pub struct Gesture {
    pub command: CommandKind,
    /// Prefix of the outcome string (`heart` -> `heart_completed`).
    pub prefix: &'static str,
    pub steps: Vec<Step>,
}

impl Gesture {
    pub fn new(command: CommandKind, prefix: &'static str, steps: Vec<Step>) -> Self {
        Self {
            command,
            prefix,
            steps,
        }
    }

    /// Resolves the steps for `robot`.
    pub fn plan<R: Rng>(&self, robot: RobotId, rng: &mut R) -> Vec<PlannedStep> {
        let mut out = Vec::new();
        plan_into(&self.steps, robot, rng, &mut out);
        out
    }
}

fn plan_into<R: Rng>(
    steps: &[Step],
    robot: RobotId,
    rng: &mut R,
    out: &mut Vec<PlannedStep>,
) {
    for step in steps {
        match step {
            Step::Frame(frame) => out.push(PlannedStep::Send {
                pose: frame.pose.resolve(robot),
                move_ms: frame.move_ms,
                overlap_ms: frame.overlap_ms,
            }),
            Step::Hold(0) => {}
            Step::Hold(ms) => out.push(PlannedStep::Hold(*ms)),
            Step::Repeat { times, steps } => {
                for _ in 0..(*times).max(1) {
                    plan_into(steps, robot, rng, out);
                }
            }
            Step::ForSide { left, right } => {
                let branch = match robot {
                    RobotId::Left => left,
                    RobotId::Right => right,
                };
                plan_into(branch, robot, rng, out);
            }
            Step::Wave {
                seeds,
                repeat,
                move_ms,
                overlap_ms,
                jitter,
            } => {
                for _ in 0..(*repeat).max(1) {
                    let Some(seed) = seeds.choose(rng) else {
                        break;
                    };
                    let mut angles = *seed;
                    for idx in [1, 2, 3, 5] {
                        let delta = rng.gen_range(-i32::from(*jitter)..=i32::from(*jitter));
                        angles[idx] = (i32::from(angles[idx]) + delta).clamp(0, 180) as u16;
                    }
                    out.push(PlannedStep::Send {
                        pose: PoseSpec::Mirrored(JointPose::new(angles)).resolve(robot),
                        move_ms: *move_ms,
                        overlap_ms: *overlap_ms,
                    });
                }
            }
            Step::Neutral { move_ms } => out.push(PlannedStep::Neutral {
                pose: neutral_pose(robot),
                move_ms: *move_ms,
            }),
        }
    }
}

fn time_field(ms: u64) -> u16 {
    u16::try_from(ms).unwrap_or(u16::MAX)
}

/// Sleeps for `total` in [`SLEEP_SLICE`] steps. Returns `false` once `cancel` is set.
pub async fn sleep_cancellable(total: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(SLEEP_SLICE)).await;
    }
}

/// Runs gestures for one arm.
#[derive(Debug, Clone)]
pub struct GestureEngine {
    bus: BusGuard,
    robot: RobotId,
    events: EventSink,
}

impl GestureEngine {
    pub fn new(bus: BusGuard, robot: RobotId, events: EventSink) -> Self {
        Self { bus, robot, events }
    }

    pub fn robot(&self) -> RobotId {
        self.robot
    }

    pub fn bus(&self) -> &BusGuard {
        &self.bus
    }

    /// Executes `gesture` until it completes, fails or `cancel` is set.
    pub async fn run(&self, gesture: &Gesture, cancel: &CancelToken) -> GestureOutcome {
        let plan = {
            let mut rng = rand::thread_rng();
            gesture.plan(self.robot, &mut rng)
        };
        info!(gesture = gesture.prefix, steps = plan.len(), robot_id = %self.robot, "gesture started");

        for step in plan {
            if cancel.is_cancelled() {
                return GestureOutcome::Cancelled;
            }
            let proceed = match step {
                PlannedStep::Send {
                    pose,
                    move_ms,
                    overlap_ms,
                } => self.run_frame(&pose, move_ms, overlap_ms, cancel).await,
                PlannedStep::Hold(ms) => {
                    Ok(sleep_cancellable(Duration::from_millis(ms), cancel).await)
                }
                PlannedStep::Neutral { pose, move_ms } => {
                    self.return_to_neutral(&pose, move_ms, cancel).await
                }
            };
            match proceed {
                Ok(true) => {}
                Ok(false) => {
                    debug!(gesture = gesture.prefix, "gesture observed cancellation");
                    return GestureOutcome::Cancelled;
                }
                Err(err) => return GestureOutcome::Failed(err.to_string()),
            }
        }
        GestureOutcome::Completed
    }

    /// Sends one frame and waits `move_ms - overlap_ms`. `Ok(false)` when cancelled.
    pub async fn run_frame(
        &self,
        pose: &JointPose,
        move_ms: u64,
        overlap_ms: u64,
        cancel: &CancelToken,
    ) -> Result<bool> {
        self.send_reliable(pose, time_field(move_ms)).await?;
        let settle = move_ms.saturating_sub(overlap_ms);
        Ok(sleep_cancellable(Duration::from_millis(settle), cancel).await)
    }

    /// Writes a pose, then repeats it after [`RESEND_DELAY`] to cover a dropped frame.
    /// Only the first write may fail the call.
    pub async fn send_reliable(&self, pose: &JointPose, time_ms: u16) -> Result<()> {
        let pose = *pose;
        self.bus
            .lock()
            .await?
            .run(move |codec| codec.write_six(&pose, time_ms))
            .await?;
        tokio::time::sleep(RESEND_DELAY).await;
        match self.bus.lock_within(RESEND_WAIT).await {
            Some(lease) => {
                if let Err(err) = lease.run(move |codec| codec.write_six(&pose, time_ms)).await {
                    debug!(%err, "redundant send failed");
                }
            }
            None => trace!("bus busy; redundant send skipped"),
        }
        Ok(())
    }

    async fn return_to_neutral(
        &self,
        pose: &JointPose,
        move_ms: u64,
        cancel: &CancelToken,
    ) -> Result<bool> {
        self.send_reliable(pose, time_field(move_ms)).await?;
        if !sleep_cancellable(Duration::from_millis(move_ms), cancel).await {
            return Ok(false);
        }
        self.events.result(
            CommandKind::InitPose.as_str(),
            "completed",
            serde_json::Value::String("init_completed".to_string()),
        );
        Ok(true)
    }

    /// Startup pose, sent once when the bridge comes up.
    pub async fn move_to_ready(&self) -> Result<()> {
        self.send_reliable(&READY_POSE, READY_MOVE_MS).await
    }
}
