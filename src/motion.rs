//! Poses and motion frames.
//!
//! - [`JointPose`]: six target angles, joint 1 first.
//! - [`PoseSpec`]: how a frame resolves to a concrete pose for one arm side.
//! - [`MotionFrame`]: a pose plus its move time and the overlap used to pipeline the next frame.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ValidationError};
use crate::protocol::Calibration;
use crate::RobotId;

/// Six joint angles in degrees, joint 1 first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JointPose([u16; 6]);

impl JointPose {
    pub const fn new(angles: [u16; 6]) -> Self {
        Self(angles)
    }

    pub fn angles(&self) -> [u16; 6] {
        self.0
    }

    pub fn get(&self, id: u8) -> Option<u16> {
        self.0.get(usize::from(id).checked_sub(1)?).copied()
    }

    /// Checks every joint against its calibrated domain.
    pub fn validate(&self, calibration: &Calibration) -> Result<()> {
        for (idx, (angle, joint)) in self.0.iter().zip(calibration.joints.iter()).enumerate() {
            if !joint.contains(*angle) {
                return Err(ValidationError::AngleOutOfRange {
                    joint: idx as u8 + 1,
                    angle: i32::from(*angle),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Builds a pose from signed angles, clamping each joint into its domain.
    pub fn clamped(angles: [i64; 6], calibration: &Calibration) -> Self {
        let mut out = [0u16; 6];
        for (idx, angle) in angles.iter().enumerate() {
            let max = i64::from(calibration.joints[idx].angle_max);
            out[idx] = (*angle).clamp(0, max) as u16;
        }
        Self(out)
    }

    /// Left/right mirror image: joints 1 and 5 become `180 - v`, clamped to 0..=180.
    pub fn mirrored(&self) -> Self {
        let mut out = self.0;
        for idx in [0, 4] {
            out[idx] = (180 - i32::from(out[idx])).clamp(0, 180) as u16;
        }
        Self(out)
    }
}

impl From<[u16; 6]> for JointPose {
    fn from(angles: [u16; 6]) -> Self {
        Self(angles)
    }
}

/// How one motion frame resolves to a pose for a given arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseSpec {
    /// Authored for the left arm; the right arm plays the mirror image.
    Mirrored(JointPose),
    /// Each arm has its own authored pose.
    Asymmetric { left: JointPose, right: JointPose },
    /// Both arms play the same pose verbatim.
    Shared(JointPose),
}

impl PoseSpec {
    pub fn mirrored(angles: [u16; 6]) -> Self {
        PoseSpec::Mirrored(JointPose::new(angles))
    }

    pub fn asymmetric(left: [u16; 6], right: [u16; 6]) -> Self {
        PoseSpec::Asymmetric {
            left: JointPose::new(left),
            right: JointPose::new(right),
        }
    }

    pub fn shared(angles: [u16; 6]) -> Self {
        PoseSpec::Shared(JointPose::new(angles))
    }

    pub fn resolve(&self, robot: RobotId) -> JointPose {
        match (self, robot) {
            (PoseSpec::Mirrored(pose), RobotId::Left) => *pose,
            (PoseSpec::Mirrored(pose), RobotId::Right) => pose.mirrored(),
            (PoseSpec::Asymmetric { left, .. }, RobotId::Left) => *left,
            (PoseSpec::Asymmetric { right, .. }, RobotId::Right) => *right,
            (PoseSpec::Shared(pose), _) => *pose,
        }
    }
}

/// One step of a choreography.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionFrame {
    pub pose: PoseSpec,
    pub move_ms: u64,
    pub overlap_ms: u64,
}

impl MotionFrame {
    pub fn new(pose: PoseSpec, move_ms: u64, overlap_ms: u64) -> Self {
        Self {
            pose,
            move_ms,
            overlap_ms,
        }
    }

    /// Time to wait after sending before the next frame may start.
    pub fn settle_ms(&self) -> u64 {
        self.move_ms.saturating_sub(self.overlap_ms)
    }
}

/// Rest pose of an arm.
pub fn neutral_pose(robot: RobotId) -> JointPose {
    match robot {
        RobotId::Left => JointPose::new([160, 30, 60, 80, 90, 90]),
        RobotId::Right => JointPose::new([20, 30, 60, 80, 90, 90]),
    }
}

/// Pose both arms take right after startup.
pub const READY_POSE: JointPose = JointPose::new([90, 150, 20, 20, 90, 30]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_flips_base_and_wrist_only() {
        let pose = JointPose::new([87, 131, 1, 22, 90, 1]);
        assert_eq!(pose.mirrored().angles(), [93, 131, 1, 22, 90, 1]);
        assert_eq!(pose.mirrored().mirrored(), pose);
    }

    #[test]
    fn mirror_clamps_wrist_beyond_half_turn() {
        let pose = JointPose::new([0, 0, 0, 0, 250, 0]);
        assert_eq!(pose.mirrored().angles()[4], 0);
    }

    #[test]
    fn pose_spec_resolves_per_side() {
        let spec = PoseSpec::asymmetric([1; 6], [2; 6]);
        assert_eq!(spec.resolve(RobotId::Left).angles(), [1; 6]);
        assert_eq!(spec.resolve(RobotId::Right).angles(), [2; 6]);

        let shared = PoseSpec::shared([90, 90, 90, 90, 90, 0]);
        assert_eq!(shared.resolve(RobotId::Right).angles(), [90, 90, 90, 90, 90, 0]);
    }

    #[test]
    fn clamped_respects_wrist_domain() {
        let pose = JointPose::clamped([-5, 200, 90, 90, 300, 90], &Calibration::default());
        assert_eq!(pose.angles(), [0, 180, 90, 90, 270, 90]);
    }

    #[test]
    fn settle_never_underflows() {
        let frame = MotionFrame::new(PoseSpec::shared([0; 6]), 50, 100);
        assert_eq!(frame.settle_ms(), 0);
    }
}
