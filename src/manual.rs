//! Direct joint control that bypasses the gesture engine.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, ValidationError};
use crate::guard::BusGuard;
use crate::motion::JointPose;
use crate::protocol::Calibration;

/// Time of the most recent manual or follow-driven write.
///
/// The telemetry streamer polls faster while this is recent.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<Mutex<Option<Instant>>>);

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self) {
        *self.0.lock() = Some(Instant::now());
    }

    pub fn last(&self) -> Option<Instant> {
        *self.0.lock()
    }

    /// True when a manual write happened less than `window` ago.
    pub fn is_active(&self, window: Duration) -> bool {
        self.last()
            .map(|at| at.elapsed() < window)
            .unwrap_or(false)
    }
}

/// `set_joint`, `set_joints` and `nudge_joint`.
#[derive(Debug, Clone)]
pub struct ManualControl {
    bus: BusGuard,
    clock: ManualClock,
    calibration: Calibration,
}

impl ManualControl {
    pub fn new(bus: BusGuard, clock: ManualClock, calibration: Calibration) -> Self {
        Self {
            bus,
            clock,
            calibration,
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    fn joint_id(id: i64) -> Result<u8> {
        match u8::try_from(id) {
            Ok(id) if (1..=6).contains(&id) => Ok(id),
            _ => Err(ValidationError::InvalidSid.into()),
        }
    }

    fn angle_max(&self, id: u8) -> i64 {
        self.calibration
            .joint(id)
            .map(|j| i64::from(j.angle_max))
            .unwrap_or(180)
    }

    fn clamp(&self, id: u8, angle: i64) -> u16 {
        angle.clamp(0, self.angle_max(id)) as u16
    }

    /// Moves one joint; the angle is clamped into the joint's domain. Returns the angle sent.
    pub async fn set_joint(&self, id: i64, angle: i64, time_ms: u16) -> Result<u16> {
        let id = Self::joint_id(id)?;
        let angle = self.clamp(id, angle);
        self.bus
            .lock()
            .await?
            .run(move |codec| codec.write_single(id, angle, time_ms))
            .await?;
        self.clock.touch();
        debug!(joint = id, angle, time_ms, "manual set_joint");
        Ok(angle)
    }

    /// Moves all six joints at once, clamping each.
    pub async fn set_joints(&self, angles: [i64; 6], time_ms: u16) -> Result<JointPose> {
        let pose = JointPose::clamped(angles, &self.calibration);
        self.bus
            .lock()
            .await?
            .run(move |codec| codec.write_six(&pose, time_ms))
            .await?;
        self.clock.touch();
        Ok(pose)
    }

    /// Reads joint `id` and moves it by `delta`. `Ok(None)` when the current angle could
    /// not be read; nothing is written in that case.
    pub async fn nudge_joint(&self, id: i64, delta: i64, time_ms: u16) -> Result<Option<u16>> {
        let id = Self::joint_id(id)?;
        let max = self.angle_max(id);
        let moved = self
            .bus
            .lock()
            .await?
            .run(move |codec| {
                let Some(current) = codec.read_single(id)? else {
                    return Ok(None);
                };
                let target = (i64::from(current) + delta).clamp(0, max) as u16;
                codec.write_single(id, target, time_ms)?;
                Ok(Some((current, target)))
            })
            .await?;
        let Some((current, target)) = moved else {
            return Ok(None);
        };
        self.clock.touch();
        debug!(joint = id, current, target, "manual nudge_joint");
        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::protocol::{func, ArmCodec};
    use crate::testing::MockTransport;

    fn control() -> (ManualControl, MockTransport) {
        let mock = MockTransport::new();
        let bus = BusGuard::new(ArmCodec::new(
            Box::new(mock.clone()),
            Calibration::default(),
        ));
        (
            ManualControl::new(bus, ManualClock::new(), Calibration::default()),
            mock,
        )
    }

    #[tokio::test]
    async fn out_of_range_id_never_touches_the_bus() {
        let (manual, mock) = control();
        let err = manual.set_joint(7, 90, 500).await.expect_err("invalid");
        assert!(matches!(
            err,
            BridgeError::Validation(ValidationError::InvalidSid)
        ));
        assert!(mock.written().is_empty());
        assert!(manual.clock().last().is_none());
    }

    #[tokio::test]
    async fn set_joint_clamps_and_touches_clock() {
        let (manual, mock) = control();
        assert_eq!(manual.set_joint(5, 400, 500).await.expect("write"), 270);
        assert_eq!(manual.set_joint(1, -20, 500).await.expect("write"), 0);
        assert_eq!(mock.frames().len(), 2);
        assert!(manual.clock().is_active(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn nudge_reads_then_writes() {
        let (manual, mock) = control();
        mock.set_servo_angles([Some(100), None, None, None, None, None]);
        assert_eq!(manual.nudge_joint(1, 10, 300).await.expect("nudge"), Some(110));
        assert_eq!(mock.frames_of(func::WRITE_SINGLE_BASE + 1).len(), 1);
    }

    #[tokio::test]
    async fn nudge_without_reading_writes_nothing() {
        let (manual, mock) = control();
        assert_eq!(manual.nudge_joint(2, 5, 300).await.expect("nudge"), None);
        assert!(mock.frames_of(func::WRITE_SINGLE_BASE + 2).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clock_goes_idle_after_window() {
        let clock = ManualClock::new();
        clock.touch();
        assert!(clock.is_active(Duration::from_secs(3)));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!clock.is_active(Duration::from_secs(3)));
    }
}
