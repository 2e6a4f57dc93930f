//! Exclusive access to the arm's serial codec.
//!
//! Every caller that touches the transport goes through [`BusGuard`]. Gesture writes use
//! [`BusGuard::lock`], telemetry polls use [`BusGuard::try_lock`] or
//! [`BusGuard::lock_within`] so a busy bus costs them a skipped cycle rather than a stall.
//!
//! Acquisition yields an [`ArmLease`]. Serial reads and writes block, so
//! [`ArmLease::run`] moves the lease onto the blocking pool for the duration of the
//! exchange and releases the bus when the exchange returns. A lease never spans a sleep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{BridgeError, Result};
use crate::protocol::ArmCodec;

/// Cloneable handle over the shared codec. Empty when no arm is attached.
#[derive(Clone, Debug, Default)]
pub struct BusGuard {
    codec: Option<Arc<Mutex<ArmCodec>>>,
}

/// Exclusive hold on the codec.
#[derive(Debug)]
pub struct ArmLease {
    guard: OwnedMutexGuard<ArmCodec>,
}

impl ArmLease {
    /// Runs one serial exchange on the blocking pool, then releases the bus.
    pub async fn run<T, F>(self, exchange: F) -> Result<T>
    where
        F: FnOnce(&mut ArmCodec) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut guard = self.guard;
        tokio::task::spawn_blocking(move || exchange(&mut *guard))
            .await
            .map_err(|e| BridgeError::Transport(format!("serial exchange aborted: {e}")))?
    }
}

impl BusGuard {
    pub fn new(codec: ArmCodec) -> Self {
        Self {
            codec: Some(Arc::new(Mutex::new(codec))),
        }
    }

    /// Guard for an instance running without hardware.
    pub fn unavailable() -> Self {
        Self { codec: None }
    }

    pub fn available(&self) -> bool {
        self.codec.is_some()
    }

    /// Waits for the bus. Used by writes that must not be skipped.
    pub async fn lock(&self) -> Result<ArmLease> {
        match &self.codec {
            Some(codec) => Ok(ArmLease {
                guard: codec.clone().lock_owned().await,
            }),
            None => Err(BridgeError::ArmUnavailable),
        }
    }

    /// Takes the bus only if nobody holds it.
    pub fn try_lock(&self) -> Option<ArmLease> {
        let guard = self.codec.as_ref()?.clone().try_lock_owned().ok()?;
        Some(ArmLease { guard })
    }

    /// Waits at most `wait` for the bus.
    pub async fn lock_within(&self, wait: Duration) -> Option<ArmLease> {
        let codec = self.codec.as_ref()?.clone();
        let guard = tokio::time::timeout(wait, codec.lock_owned()).await.ok()?;
        Some(ArmLease { guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{func, Calibration};
    use crate::testing::MockTransport;

    fn guard() -> (BusGuard, MockTransport) {
        let mock = MockTransport::new();
        let bus = BusGuard::new(ArmCodec::new(
            Box::new(mock.clone()),
            Calibration::default(),
        ));
        (bus, mock)
    }

    #[tokio::test]
    async fn try_lock_fails_while_held() {
        let (bus, _) = guard();
        let held = bus.lock().await.expect("lock");
        assert!(bus.try_lock().is_none());
        drop(held);
        assert!(bus.try_lock().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_expires_under_contention() {
        let (bus, _) = guard();
        let _held = bus.lock().await.expect("lock");
        assert!(bus.lock_within(Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn missing_arm_reports_unavailable() {
        let bus = BusGuard::unavailable();
        assert!(!bus.available());
        assert!(matches!(bus.lock().await, Err(BridgeError::ArmUnavailable)));
        assert!(bus.try_lock().is_none());
    }

    #[tokio::test]
    async fn exchange_runs_off_the_runtime_and_releases_the_bus() {
        let (bus, mock) = guard();
        let caller = std::thread::current().id();
        let lease = bus.lock().await.expect("lock");
        let worker = lease
            .run(|codec| {
                codec.set_torque(true)?;
                Ok(std::thread::current().id())
            })
            .await
            .expect("exchange");
        assert_ne!(worker, caller);
        assert_eq!(mock.frames_of(func::TORQUE).len(), 1);
        assert!(bus.try_lock().is_some());
    }

    #[tokio::test]
    async fn exchange_error_still_releases_the_bus() {
        let (bus, mock) = guard();
        mock.fail_writes(true);
        let lease = bus.lock().await.expect("lock");
        let result = lease.run(|codec| codec.reset()).await;
        assert!(matches!(result, Err(BridgeError::Transport(_))));
        assert!(bus.try_lock().is_some());
    }
}
