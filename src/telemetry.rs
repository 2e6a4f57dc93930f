//! Joint-state streaming.
//!
//! The streamer polls all six joints and publishes a `joint_state` only when something
//! moved, plus a forced sample once per forced interval so consumers can tell a quiet arm
//! from a dead one. Ordinary cycles never wait for the bus; a forced cycle waits a bounded
//! time so a long gesture cannot starve telemetry completely.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::engine::CancelToken;
use crate::guard::BusGuard;
use crate::manual::ManualClock;
use crate::messages::EventSink;

/// Minimum delay between two poll cycles.
pub const LOOP_FLOOR: Duration = Duration::from_millis(80);
/// Idle interval floor.
pub const IDLE_FLOOR: Duration = Duration::from_millis(300);
/// Bus wait allowed to a forced cycle.
pub const FORCED_WAIT: Duration = Duration::from_millis(200);
/// Smallest change in degrees that counts as movement.
pub const CHANGE_THRESHOLD: u16 = 1;

/// `[telemetry]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub interval_ms: u64,
    pub active_window_ms: u64,
    pub force_interval_ms: u64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            active_window_ms: 3000,
            force_interval_ms: 1000,
        }
    }
}

pub type JointAngles = [Option<u16>; 6];

/// Decides which samples are worth publishing and numbers them.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    last: Option<JointAngles>,
    next_seq: u64,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the sequence number to publish `angles` under, or `None` to skip them.
    pub fn observe(&mut self, angles: JointAngles, forced: bool) -> Option<u64> {
        let changed = match &self.last {
            None => true,
            Some(last) => last.iter().zip(angles.iter()).any(|(old, new)| match (old, new) {
                (Some(old), Some(new)) => old.abs_diff(*new) >= CHANGE_THRESHOLD,
                (None, None) => false,
                _ => true,
            }),
        };
        if !changed && !forced {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.last = Some(angles);
        Some(seq)
    }
}

/// Periodic joint poller for one arm.
#[derive(Debug, Clone)]
pub struct TelemetryStreamer {
    bus: BusGuard,
    clock: ManualClock,
    events: EventSink,
    settings: TelemetrySettings,
}

impl TelemetryStreamer {
    pub fn new(
        bus: BusGuard,
        clock: ManualClock,
        events: EventSink,
        settings: TelemetrySettings,
    ) -> Self {
        Self {
            bus,
            clock,
            events,
            settings,
        }
    }

    /// Base interval while manual control is recent, otherwise twice that (at least 300 ms).
    pub fn interval(&self) -> Duration {
        let base = Duration::from_millis(self.settings.interval_ms);
        let window = Duration::from_millis(self.settings.active_window_ms);
        let interval = if self.clock.is_active(window) {
            base
        } else {
            (base * 2).max(IDLE_FLOOR)
        };
        interval.max(LOOP_FLOOR)
    }

    async fn sample(&self, forced: bool) -> Option<JointAngles> {
        let lease = if forced {
            self.bus.lock_within(FORCED_WAIT).await
        } else {
            self.bus.try_lock()
        }?;
        match lease.run(|codec| codec.read_all()).await {
            Ok(angles) => Some(angles),
            Err(err) => {
                debug!(%err, "telemetry read failed");
                None
            }
        }
    }

    /// Polls until `shutdown` is set.
    pub async fn run(self, shutdown: CancelToken) {
        let force_every = Duration::from_millis(self.settings.force_interval_ms);
        let mut detector = ChangeDetector::new();
        let mut last_emit: Option<Instant> = None;
        info!(robot_id = %self.events.robot(), "telemetry started");

        while !shutdown.is_cancelled() {
            let forced = last_emit.map_or(true, |at| at.elapsed() >= force_every);
            match self.sample(forced).await {
                Some(angles) => {
                    if let Some(seq) = detector.observe(angles, forced) {
                        self.events.joint_state(&angles, seq);
                        last_emit = Some(Instant::now());
                    }
                }
                None => trace!(forced, "telemetry cycle skipped"),
            }
            tokio::time::sleep(self.interval()).await;
        }
        info!("telemetry stopped");
    }

    pub fn spawn(self, shutdown: CancelToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
