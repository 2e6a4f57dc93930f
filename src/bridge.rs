//! Bridge context and wiring.
//!
//! [`Bridge`] is built once from the configuration and owns every component for one arm:
//! - the [`BusGuard`] over the serial codec
//! - the dispatcher with its gesture engine, manual control, follow mirror and face tracker
//! - the telemetry streamer
//!
//! Inbound [`LinkEvent`]s are routed by topic; outbound messages flow through the
//! [`EventSink`] channel into one publisher task.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{InboundMessage, LinkEvent, MessageBus};
use crate::config::BridgeConfig;
use crate::dispatcher::{DispatchTargets, Dispatcher};
use crate::engine::{CancelToken, GestureEngine};
use crate::face_tracking::{FaceDetection, FaceTracking};
use crate::follow::FollowMirror;
use crate::gestures::GestureCatalog;
use crate::guard::BusGuard;
use crate::manual::{ManualClock, ManualControl};
use crate::messages::{Channel, CommandKind, EventSink, Outbound, Topics};
use crate::protocol::ArmCodec;
use crate::telemetry::TelemetryStreamer;
use crate::RobotId;

/// Opens the configured serial port. A missing or unopenable port yields an unavailable
/// guard; the bridge keeps running and answers gesture commands with `arm_unavailable`.
pub fn open_arm(config: &BridgeConfig, robot: RobotId) -> BusGuard {
    let Some(path) = config.robot.serial_port_for(robot) else {
        warn!(robot_id = %robot, "no serial port configured; arm unavailable");
        return BusGuard::unavailable();
    };
    match ArmCodec::open_serial(
        path,
        config.robot.baud_rate,
        config.robot.read_timeout(),
        config.calibration,
    ) {
        Ok(codec) => {
            info!(robot_id = %robot, path, "arm connected");
            BusGuard::new(codec)
        }
        Err(err) => {
            warn!(robot_id = %robot, path, %err, "arm unavailable");
            BusGuard::unavailable()
        }
    }
}

/// Drains the outbound channel onto the bus: `joint_state` to the joint topic, everything
/// else to the event topic. Publish failures are dropped; the link reconnects on its own.
pub fn spawn_publisher(
    bus: Arc<dyn MessageBus>,
    topics: Topics,
    mut outbound: UnboundedReceiver<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let topic = match msg.channel {
                Channel::Joint => topics.joint(),
                Channel::Event => topics.event(),
            };
            if let Err(err) = bus.publish(&topic, &msg.payload.to_string()).await {
                debug!(topic = %topic, %err, "outbound message dropped");
            }
        }
    })
}

/// Awaits a background task and logs how it ended. Returns `false` when the task
/// panicked.
pub async fn reap(name: &str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(err) if err.is_cancelled() => {
            debug!(task = name, "background task cancelled");
            true
        }
        Err(err) => {
            warn!(task = name, %err, "background task failed");
            false
        }
    }
}

/// Everything one robot instance runs.
#[derive(Debug, Clone)]
pub struct Bridge {
    robot: RobotId,
    topics: Topics,
    arm: BusGuard,
    events: EventSink,
    engine: GestureEngine,
    dispatcher: Dispatcher,
    follow: FollowMirror,
    face: FaceTracking,
    telemetry: TelemetryStreamer,
    shutdown: CancelToken,
}

impl Bridge {
    /// Builds the component graph around `arm`. The returned receiver must be handed to
    /// [`spawn_publisher`] (or drained by the caller).
    pub fn new(
        config: &BridgeConfig,
        robot: RobotId,
        arm: BusGuard,
    ) -> (Self, UnboundedReceiver<Outbound>) {
        let (events, outbound) = EventSink::channel(robot);
        let topics = Topics::new(config.broker.base_topic.clone(), robot);
        let clock = ManualClock::new();

        let engine = GestureEngine::new(arm.clone(), robot, events.clone());
        let manual = ManualControl::new(arm.clone(), clock.clone(), config.calibration);
        let follow = FollowMirror::new(robot, config.follow.clone(), manual.clone());
        let face = FaceTracking::new(arm.clone(), events.clone(), config.face_tracking.clone());
        let dispatcher = Dispatcher::new(
            robot,
            events.clone(),
            DispatchTargets {
                engine: engine.clone(),
                catalog: Arc::new(GestureCatalog::new(&config.gestures)),
                manual,
                follow: follow.clone(),
                face: face.clone(),
            },
        );
        let telemetry =
            TelemetryStreamer::new(arm.clone(), clock, events.clone(), config.telemetry.clone());

        let bridge = Self {
            robot,
            topics,
            arm,
            events,
            engine,
            dispatcher,
            follow,
            face,
            telemetry,
            shutdown: CancelToken::new(),
        };
        (bridge, outbound)
    }

    pub fn robot(&self) -> RobotId {
        self.robot
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Capability list advertised in `hello`.
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps = Vec::new();
        if self.arm.available() {
            caps.push("face_tracking".to_string());
            caps.extend(CommandKind::gestures().map(|c| c.as_str().to_string()));
            caps.push("manual_control".to_string());
        }
        caps
    }

    /// Sends the ready pose and starts telemetry. Without an arm this is a no-op.
    pub async fn start(&self) -> Option<JoinHandle<()>> {
        if !self.arm.available() {
            return None;
        }
        if let Err(err) = self.engine.move_to_ready().await {
            warn!(%err, "ready pose failed");
        }
        Some(self.telemetry.clone().spawn(self.shutdown.clone()))
    }

    /// Routes one link event.
    pub async fn handle_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                info!(robot_id = %self.robot, "link connected");
                self.events.hello(&self.capabilities());
            }
            LinkEvent::Disconnected(reason) => {
                warn!(robot_id = %self.robot, reason = %reason, "link disconnected");
            }
            LinkEvent::Message(msg) => self.route(msg).await,
        }
    }

    async fn route(&self, msg: InboundMessage) {
        let topic = msg.topic.as_str();
        if topic == self.topics.broadcast_command() || topic == self.topics.own_command() {
            self.dispatcher.handle_payload(&msg.payload).await;
        } else if topic == self.topics.joint() {
            let Ok(sample) = serde_json::from_str::<Value>(&msg.payload) else {
                debug!("undecodable joint sample");
                return;
            };
            if let Err(err) = self.follow.apply(&sample).await {
                warn!(%err, "follow mirror error");
            }
        } else if topic == self.topics.face() {
            match serde_json::from_str::<FaceDetection>(&msg.payload) {
                Ok(detection) => self.face.feed(detection),
                Err(err) => debug!(%err, "undecodable face detection"),
            }
        } else {
            debug!(topic, "message on unrouted topic");
        }
    }

    /// Starts the arm, then processes link events until the inbound channel closes.
    pub async fn run(&self, mut inbound: UnboundedReceiver<LinkEvent>) {
        let telemetry = self.start().await;
        while let Some(event) = inbound.recv().await {
            self.handle_event(event).await;
        }
        info!("inbound link closed");
        self.stop().await;
        if let Some(handle) = telemetry {
            reap("telemetry", handle).await;
        }
    }

    /// Cancels the running gesture, face tracking and telemetry.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.dispatcher.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::protocol::{func, Calibration};
    use crate::testing::MockTransport;
    use serde_json::json;
    use std::time::Duration;

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn bridge(robot: RobotId) -> (Bridge, MockTransport, UnboundedReceiver<Outbound>) {
        let mock = MockTransport::new();
        let arm = BusGuard::new(ArmCodec::new(
            Box::new(mock.clone()),
            Calibration::default(),
        ));
        let (bridge, rx) = Bridge::new(&BridgeConfig::default(), robot, arm);
        (bridge, mock, rx)
    }

    #[tokio::test]
    async fn hello_lists_capabilities() {
        let (bridge, _, mut rx) = bridge(RobotId::Left);
        bridge.handle_event(LinkEvent::Connected).await;
        let hello = drain(&mut rx).pop().expect("hello").payload;
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["agent"], "robot");
        let caps = hello["capabilities"].as_array().expect("caps");
        assert_eq!(caps.first(), Some(&json!("face_tracking")));
        assert_eq!(caps.last(), Some(&json!("manual_control")));
        assert!(caps.contains(&json!("make_heart")));

        let (armless, _) = Bridge::new(
            &BridgeConfig::default(),
            RobotId::Right,
            BusGuard::unavailable(),
        );
        assert!(armless.capabilities().is_empty());
    }

    #[tokio::test]
    async fn routes_by_topic() {
        let (right, mock, mut rx) = bridge(RobotId::Right);
        let topics = right.topics().clone();

        right
            .handle_event(LinkEvent::Message(InboundMessage::new(
                topics.own_command(),
                json!({"type": "command", "command": "start_follow"}).to_string(),
            )))
            .await;
        right
            .handle_event(LinkEvent::Message(InboundMessage::new(
                topics.joint(),
                json!({"type": "joint_state", "robot_id": "robot_left", "angles": [10, 30, 60, 80, 90, 90]})
                    .to_string(),
            )))
            .await;
        assert_eq!(mock.frames_of(func::WRITE_SIX).len(), 1);

        right
            .handle_event(LinkEvent::Message(InboundMessage::new(
                "robot/robot/robot_left/command",
                json!({"command": "make_heart"}).to_string(),
            )))
            .await;
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .all(|m| m.payload["command"] != "make_heart"));
    }

    #[tokio::test(start_paused = true)]
    async fn publisher_routes_channels() {
        let hub = MemoryBus::new();
        let mut tap = hub.tap();
        let (bridge, _, rx) = bridge(RobotId::Left);
        let topics = bridge.topics().clone();
        let publisher = spawn_publisher(Arc::new(hub.clone()), topics.clone(), rx);

        let started = bridge.start().await;
        assert!(started.is_some());
        bridge.handle_event(LinkEvent::Connected).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        bridge.stop().await;

        let mut seen = Vec::new();
        while let Ok(msg) = tap.try_recv() {
            seen.push(msg.topic);
        }
        assert!(seen.contains(&topics.event()));
        assert!(seen.contains(&topics.joint()));
        publisher.abort();
        assert!(reap("publisher", publisher).await);
    }

    #[tokio::test]
    async fn reap_reports_a_panicked_task() {
        let finished = tokio::spawn(async {});
        assert!(reap("finished", finished).await);

        let panicked = tokio::spawn(async { panic!("publisher blew up") });
        assert!(!reap("panicked", panicked).await);
    }
}
