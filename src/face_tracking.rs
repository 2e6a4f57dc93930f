//! Face tracking: steer the arm so a detected face stays centred in the camera frame.
//!
//! Detection itself happens in an external vision worker that publishes
//! `{"detected": bool, "bbox": {x, y, w, h}}` on the robot's face topic. This module only
//! turns those boxes into pan/tilt targets with a positional PID per axis.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::CancelToken;
use crate::guard::BusGuard;
use crate::messages::EventSink;
use crate::motion::JointPose;

const FRAME_CENTER: (f64, f64) = (320.0, 240.0);
const DEAD_ZONE_X: (f64, f64) = (260.0, 380.0);
const DEAD_ZONE_Y: (f64, f64) = (180.0, 300.0);
const MIN_BOX_SIDE: i64 = 10;
const WRITE_TIME_MS: u16 = 500;
const MIN_WRITE_INTERVAL: Duration = Duration::from_millis(150);
const MIN_ANGLE_DELTA: i32 = 1;
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_SLICE: Duration = Duration::from_millis(50);

/// `[face_tracking]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceTrackingSettings {
    /// Minimum time between two `face_tracking` status events.
    pub update_interval_ms: u64,
}

impl Default for FaceTrackingSettings {
    fn default() -> Self {
        Self {
            update_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
}

impl BoundingBox {
    fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.w as f64 / 2.0,
            self.y as f64 + self.h as f64 / 2.0,
        )
    }
}

/// One message from the vision worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceDetection {
    #[serde(default)]
    pub detected: bool,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
}

/// Positional PID with first-order inertia on the output.
#[derive(Debug, Clone)]
pub struct PositionalPid {
    kp: f64,
    ki: f64,
    kd: f64,
    output: f64,
    pid_output: f64,
    err_sum: f64,
    err_prev: f64,
}

impl PositionalPid {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            output: 0.0,
            pid_output: 0.0,
            err_sum: 0.0,
            err_prev: 0.0,
        }
    }

    /// Feeds a measurement and returns the smoothed system output.
    pub fn step(&mut self, measured: f64, setpoint: f64) -> f64 {
        self.output = measured;
        let err = setpoint - self.output;
        self.pid_output = self.kp * err + self.ki * self.err_sum + self.kd * (err - self.err_prev);
        self.err_sum += err;
        self.err_prev = err;

        let (inertia, sample) = (0.01, 0.1);
        self.output = (inertia * self.pid_output + sample * self.output) / (sample + inertia);
        self.output
    }
}

/// Pan/tilt state for one tracking session.
#[derive(Debug, Clone)]
pub struct FaceTracker {
    pan: i32,
    tilt: i32,
    pid_x: PositionalPid,
    pid_y: PositionalPid,
    last_sent: Option<(i32, i32)>,
    last_write: Option<Instant>,
}

impl Default for FaceTracker {
    fn default() -> Self {
        Self {
            pan: 90,
            tilt: 45,
            pid_x: PositionalPid::new(0.25, 0.1, 0.05),
            pid_y: PositionalPid::new(0.25, 0.1, 0.05),
            last_sent: None,
            last_write: None,
        }
    }
}

impl FaceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn targets(&self) -> (i32, i32) {
        (self.pan, self.tilt)
    }

    /// Updates pan/tilt from a face box and returns the joint targets.
    pub fn update(&mut self, bbox: &BoundingBox) -> JointPose {
        let (cx, cy) = bbox.center();

        let pan_saturated = (self.pan >= 180 && cx <= FRAME_CENTER.0) || (self.pan <= 0 && cx >= FRAME_CENTER.0);
        if !pan_saturated && !(DEAD_ZONE_X.0..=DEAD_ZONE_X.1).contains(&cx) {
            let out = self.pid_x.step(cx, FRAME_CENTER.0);
            let pulse = (1500.0 + out) as i32;
            self.pan = ((pulse - 500) / 10).clamp(0, 180);
        }

        let tilt_saturated = (self.tilt >= 180 && cy <= FRAME_CENTER.1) || (self.tilt <= 0 && cy >= FRAME_CENTER.1);
        if !tilt_saturated && !(DEAD_ZONE_Y.0..=DEAD_ZONE_Y.1).contains(&cy) {
            let out = self.pid_y.step(cy, FRAME_CENTER.1);
            let pulse = (1500.0 + out) as i32;
            self.tilt = ((pulse - 500) / 10 - 45).clamp(0, 360);
        }

        let half_tilt = (self.tilt / 2) as u16;
        JointPose::new([self.pan as u16, 135, half_tilt, half_tilt, 90, 30])
    }

    /// Rate limit and dead band for servo writes. Records the write when it returns `true`.
    pub fn should_write(&mut self, now: Instant) -> bool {
        let current = (self.pan, (self.tilt / 2) * 2);
        let moved = match self.last_sent {
            None => true,
            Some((x, y)) => {
                (current.0 - x).abs() >= MIN_ANGLE_DELTA || (current.1 - y).abs() >= MIN_ANGLE_DELTA
            }
        };
        let due = self
            .last_write
            .map_or(true, |at| now.duration_since(at) >= MIN_WRITE_INTERVAL);
        if moved && due {
            self.last_sent = Some(current);
            self.last_write = Some(now);
            true
        } else {
            false
        }
    }
}

struct Session {
    cancel: CancelToken,
    feed: mpsc::UnboundedSender<FaceDetection>,
    handle: JoinHandle<()>,
}

/// Starts, stops and feeds the tracking worker.
#[derive(Clone)]
pub struct FaceTracking {
    bus: BusGuard,
    events: EventSink,
    settings: FaceTrackingSettings,
    session: Arc<Mutex<Option<Session>>>,
}

impl std::fmt::Debug for FaceTracking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaceTracking")
            .field("settings", &self.settings)
            .field("running", &self.is_running())
            .finish()
    }
}

impl FaceTracking {
    pub fn new(bus: BusGuard, events: EventSink, settings: FaceTrackingSettings) -> Self {
        Self {
            bus,
            events,
            settings,
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn available(&self) -> bool {
        self.bus.available()
    }

    pub fn is_running(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map_or(false, |s| !s.handle.is_finished())
    }

    /// Returns `false` if a session is already running.
    pub fn start(&self) -> bool {
        let mut slot = self.session.lock();
        if slot.as_ref().map_or(false, |s| !s.handle.is_finished()) {
            return false;
        }
        let cancel = CancelToken::new();
        let (feed, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            bus: self.bus.clone(),
            events: self.events.clone(),
            interval: Duration::from_millis(self.settings.update_interval_ms.max(50)),
        };
        let handle = tokio::spawn(worker.run(rx, cancel.clone()));
        *slot = Some(Session {
            cancel,
            feed,
            handle,
        });
        info!("face tracking started");
        true
    }

    /// Returns `false` if nothing was running.
    pub async fn stop(&self) -> bool {
        let Some(session) = self.session.lock().take() else {
            return false;
        };
        session.cancel.cancel();
        if tokio::time::timeout(JOIN_TIMEOUT, session.handle).await.is_err() {
            warn!("face tracking worker did not stop in time");
        }
        info!("face tracking stopped");
        true
    }

    /// Hands a detection to the running session; dropped when idle.
    pub fn feed(&self, detection: FaceDetection) {
        if let Some(session) = self.session.lock().as_ref() {
            let _ = session.feed.send(detection);
        }
    }
}

struct Worker {
    bus: BusGuard,
    events: EventSink,
    interval: Duration,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<FaceDetection>, cancel: CancelToken) {
        let mut tracker = FaceTracker::new();
        let mut last_emit: Option<Instant> = None;

        while !cancel.is_cancelled() {
            let detection = match tokio::time::timeout(POLL_SLICE, rx.recv()).await {
                Ok(Some(detection)) => detection,
                Ok(None) => break,
                Err(_) => continue,
            };

            let bbox = detection
                .bbox
                .filter(|b| detection.detected && b.w >= MIN_BOX_SIDE && b.h >= MIN_BOX_SIDE);
            let mut joints = None;
            if let Some(bbox) = bbox.as_ref() {
                let pose = tracker.update(bbox);
                if tracker.should_write(Instant::now()) {
                    self.write(&pose).await;
                }
                joints = Some(pose);
            }

            let now = Instant::now();
            if last_emit.map_or(true, |at| now.duration_since(at) >= self.interval) {
                self.emit(bbox.as_ref(), joints.as_ref());
                last_emit = Some(now);
            }
        }
        debug!("face tracking worker exiting");
    }

    async fn write(&self, pose: &JointPose) {
        let pose = *pose;
        match self.bus.lock().await {
            Ok(lease) => {
                let written = lease
                    .run(move |codec| codec.write_six(&pose, WRITE_TIME_MS))
                    .await;
                if let Err(err) = written {
                    debug!(%err, "face tracking write failed");
                }
            }
            Err(err) => debug!(%err, "face tracking has no bus"),
        }
    }

    fn emit(&self, bbox: Option<&BoundingBox>, joints: Option<&JointPose>) {
        let mut payload = json!({
            "type": "face_tracking",
            "status": "running",
            "detected": bbox.is_some(),
        });
        if let Value::Object(map) = &mut payload {
            if let Some(b) = bbox {
                map.insert("bbox".to_string(), json!({"x": b.x, "y": b.y, "w": b.w, "h": b.h}));
            }
            if let Some(pose) = joints {
                map.insert("joints".to_string(), json!(pose.angles()));
            }
        }
        self.events.emit(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{func, ArmCodec, Calibration};
    use crate::testing::MockTransport;
    use crate::RobotId;

    #[test]
    fn centred_face_keeps_initial_targets() {
        let mut tracker = FaceTracker::new();
        let pose = tracker.update(&BoundingBox {
            x: 300,
            y: 220,
            w: 40,
            h: 40,
        });
        assert_eq!(tracker.targets(), (90, 45));
        assert_eq!(pose.angles(), [90, 135, 22, 22, 90, 30]);
    }

    #[test]
    fn targets_stay_clamped() {
        let mut tracker = FaceTracker::new();
        for _ in 0..200 {
            tracker.update(&BoundingBox {
                x: 0,
                y: 0,
                w: 20,
                h: 20,
            });
            let (pan, tilt) = tracker.targets();
            assert!((0..=180).contains(&pan));
            assert!((0..=360).contains(&tilt));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn writes_are_rate_limited() {
        let mut tracker = FaceTracker::new();
        let start = Instant::now();
        tracker.update(&BoundingBox {
            x: 10,
            y: 220,
            w: 40,
            h: 40,
        });
        assert!(tracker.should_write(start));
        tracker.update(&BoundingBox {
            x: 600,
            y: 220,
            w: 40,
            h: 40,
        });
        assert!(!tracker.should_write(start + Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn session_lifecycle_and_status_events() {
        let mock = MockTransport::new();
        let bus = BusGuard::new(ArmCodec::new(
            Box::new(mock.clone()),
            Calibration::default(),
        ));
        let (events, mut rx) = EventSink::channel(RobotId::Left);
        let tracking = FaceTracking::new(bus, events, FaceTrackingSettings::default());

        assert!(!tracking.stop().await);
        assert!(tracking.start());
        assert!(!tracking.start());

        tracking.feed(FaceDetection {
            detected: true,
            bbox: Some(BoundingBox {
                x: 20,
                y: 20,
                w: 50,
                h: 50,
            }),
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let event = rx.try_recv().expect("status event");
        assert_eq!(event.payload["type"], "face_tracking");
        assert_eq!(event.payload["detected"], true);
        assert!(event.payload["joints"].is_array());
        assert_eq!(mock.frames_of(func::WRITE_SIX).len(), 1);

        assert!(tracking.stop().await);
        assert!(!tracking.is_running());
    }
}
