//! Follow mode: one arm replays another arm's telemetry.
//!
//! The follower subscribes to the shared joint topic. While active, every `joint_state`
//! published by the leader is applied through [`ManualControl::set_joints`] with the
//! configured latency, which also keeps the local telemetry cadence in its active band.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::Result;
use crate::manual::ManualControl;
use crate::RobotId;

/// Longest mirror latency accepted by config validation.
pub const MAX_FOLLOW_TIME_MS: u64 = 10_000;

/// `[follow]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowSettings {
    pub leader: String,
    pub follower: String,
    pub time_ms: u64,
}

impl Default for FollowSettings {
    fn default() -> Self {
        Self {
            leader: RobotId::Left.as_str().to_string(),
            follower: RobotId::Right.as_str().to_string(),
            time_ms: 160,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveFollow {
    pub leader: String,
    pub follower: String,
    pub time_ms: u64,
}

/// Reply to `start_follow`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowStart {
    Started(ActiveFollow),
    /// This instance is not the requested follower.
    NotFollower,
}

#[derive(Debug, Clone)]
pub struct FollowMirror {
    robot: RobotId,
    defaults: FollowSettings,
    manual: ManualControl,
    active: Arc<Mutex<Option<ActiveFollow>>>,
}

impl FollowMirror {
    pub fn new(robot: RobotId, defaults: FollowSettings, manual: ManualControl) -> Self {
        Self {
            robot,
            defaults,
            manual,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn start(
        &self,
        leader: Option<&str>,
        follower: Option<&str>,
        time_ms: Option<u64>,
    ) -> FollowStart {
        let leader = leader
            .filter(|s| !s.is_empty())
            .unwrap_or(self.defaults.leader.as_str())
            .to_string();
        let follower = follower
            .filter(|s| !s.is_empty())
            .unwrap_or(self.defaults.follower.as_str())
            .to_string();
        let time_ms = time_ms.unwrap_or(self.defaults.time_ms);

        if !follower.eq_ignore_ascii_case(self.robot.as_str()) {
            return FollowStart::NotFollower;
        }
        let follow = ActiveFollow {
            leader,
            follower,
            time_ms,
        };
        info!(leader = %follow.leader, time_ms, "follow mode started");
        *self.active.lock() = Some(follow.clone());
        FollowStart::Started(follow)
    }

    /// Returns `false` when follow mode was not running.
    pub fn stop(&self) -> bool {
        let stopped = self.active.lock().take().is_some();
        if stopped {
            info!("follow mode stopped");
        }
        stopped
    }

    pub fn active(&self) -> Option<ActiveFollow> {
        self.active.lock().clone()
    }

    /// Target pose for a leader sample, or `None` when the sample should be ignored.
    pub fn mirror_target(&self, sample: &Value) -> Option<([i64; 6], u64)> {
        let follow = self.active()?;
        if sample.get("type").and_then(Value::as_str) != Some("joint_state") {
            return None;
        }
        if sample.get("robot_id").and_then(Value::as_str) != Some(follow.leader.as_str()) {
            return None;
        }
        let raw = sample.get("angles")?.as_array()?;
        if raw.len() != 6 {
            return None;
        }
        let mut angles = [0i64; 6];
        for (slot, value) in angles.iter_mut().zip(raw) {
            *slot = value.as_i64().or_else(|| value.as_f64().map(|f| f.round() as i64))?;
        }

        let leader = follow.leader.to_ascii_lowercase();
        let canonical = matches!(
            (leader.parse::<RobotId>(), self.robot),
            (Ok(RobotId::Left), RobotId::Right) | (Ok(RobotId::Right), RobotId::Left)
        );
        if canonical {
            for idx in [0, 4] {
                angles[idx] = (180 - angles[idx]).clamp(0, 180);
            }
        }
        Some((angles, follow.time_ms))
    }

    /// Applies a leader sample. Returns `true` when a pose was written.
    pub async fn apply(&self, sample: &Value) -> Result<bool> {
        let Some((angles, time_ms)) = self.mirror_target(sample) else {
            return Ok(false);
        };
        let time_ms = u16::try_from(time_ms).unwrap_or(u16::MAX);
        let pose = self.manual.set_joints(angles, time_ms).await?;
        debug!(?pose, "follow sample applied");
        Ok(true)
    }
}
