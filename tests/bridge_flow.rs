//! End-to-end flows through the in-memory bus with a recording serial port.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use carebot_bridge::bridge::{spawn_publisher, Bridge};
use carebot_bridge::bus::{LinkEvent, MemoryBus, MessageBus};
use carebot_bridge::guard::BusGuard;
use carebot_bridge::messages::Topics;
use carebot_bridge::protocol::{func, ArmCodec, Calibration, HEADER};
use carebot_bridge::{BridgeConfig, RobotId};

/// Serial port stand-in that keeps every written byte and never answers.
#[derive(Clone, Default)]
struct RecordingPort {
    written: Arc<Mutex<Vec<u8>>>,
}

impl RecordingPort {
    fn write_six_poses(&self) -> Vec<[u16; 6]> {
        let bytes = self.written.lock().expect("port lock").clone();
        let calibration = Calibration::default();
        let mut poses = Vec::new();
        let mut i = 0;
        while i + 3 < bytes.len() {
            if bytes[i] != HEADER {
                i += 1;
                continue;
            }
            let total = 2 + usize::from(bytes[i + 2]);
            let frame = &bytes[i..i + total];
            if frame[3] == func::WRITE_SIX {
                let mut pose = [0u16; 6];
                for (idx, angle) in pose.iter_mut().enumerate() {
                    let raw = u16::from_be_bytes([frame[4 + idx * 2], frame[5 + idx * 2]]);
                    let joint = calibration.joint(idx as u8 + 1).expect("joint");
                    *angle = joint.decode(raw).expect("in range");
                }
                poses.push(pose);
            }
            i += total;
        }
        poses
    }

    fn is_silent(&self) -> bool {
        self.written.lock().expect("port lock").is_empty()
    }
}

impl Read for RecordingPort {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

impl Write for RecordingPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().expect("port lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Harness {
    hub: MemoryBus,
    topics: Topics,
    port: RecordingPort,
    events: UnboundedReceiver<LinkEvent>,
}

impl Harness {
    /// Starts a bridge (without the startup pose) wired to a fresh in-memory bus.
    async fn start(robot: RobotId) -> Self {
        let hub = MemoryBus::new();
        let port = RecordingPort::default();
        let arm = BusGuard::new(ArmCodec::new(
            Box::new(port.clone()),
            Calibration::default(),
        ));
        let (bridge, outbound) = Bridge::new(&BridgeConfig::default(), robot, arm);
        let topics = bridge.topics().clone();

        let mut events = hub.subscribe(vec![topics.event()]);
        assert_eq!(events.recv().await, Some(LinkEvent::Connected));

        let mut inbound = hub.subscribe(topics.subscriptions());
        spawn_publisher(Arc::new(hub.clone()), topics.clone(), outbound);
        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                bridge.handle_event(event).await;
            }
        });

        let mut harness = Self {
            hub,
            topics,
            port,
            events,
        };
        assert_eq!(harness.next_event().await["type"], "hello");
        harness
    }

    async fn send(&self, command: Value) {
        self.hub
            .publish(&self.topics.broadcast_command(), &command.to_string())
            .await
            .expect("publish");
    }

    async fn next_event(&mut self) -> Value {
        let event = tokio::time::timeout(Duration::from_secs(60), self.events.recv())
            .await
            .expect("event in time")
            .expect("bus open");
        match event {
            LinkEvent::Message(msg) => serde_json::from_str(&msg.payload).expect("json"),
            other => panic!("unexpected link event {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn make_heart_runs_to_completion() {
    let mut harness = Harness::start(RobotId::Left).await;
    harness
        .send(json!({"type": "command", "command": "make_heart", "robot_id": "all"}))
        .await;

    let ack = harness.next_event().await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["command"], "make_heart");
    assert_eq!(ack["who"], "robot");
    assert_eq!(ack["robot_id"], "robot_left");

    let progress = harness.next_event().await;
    assert_eq!(progress["type"], "progress");
    assert_eq!(progress["status"], "started");

    let neutral = harness.next_event().await;
    assert_eq!(neutral["command"], "init_pose");
    assert_eq!(neutral["outcome"], "init_completed");

    let result = harness.next_event().await;
    assert_eq!(result["type"], "result");
    assert_eq!(result["command"], "make_heart");
    assert_eq!(result["status"], "completed");
    assert_eq!(result["outcome"], "heart_completed");
    assert!(result["ts"].is_string());

    let raise = [87, 131, 1, 22, 90, 1];
    let spread = [0, 55, 65, 97, 90, 1];
    let heart = [0, 55, 44, 0, 0, 177];
    let neutral = [160, 30, 60, 80, 90, 90];
    let expected: Vec<[u16; 6]> = [raise, spread, heart, spread, neutral]
        .into_iter()
        .flat_map(|pose| [pose, pose])
        .collect();
    assert_eq!(harness.port.write_six_poses(), expected);
}

#[tokio::test]
async fn out_of_range_joint_is_rejected_without_writing() {
    let mut harness = Harness::start(RobotId::Left).await;
    harness
        .send(json!({"type": "command", "command": "set_joint", "id": 7, "angle": 90, "robot_id": "robot_left"}))
        .await;

    assert_eq!(harness.next_event().await["type"], "ack");
    let result = harness.next_event().await;
    assert_eq!(result["type"], "result");
    assert_eq!(result["status"], "error");
    assert_eq!(result["error"], "invalid_sid");
    assert!(harness.port.is_silent());
}

#[tokio::test(start_paused = true)]
async fn second_command_preempts_the_first() {
    let mut harness = Harness::start(RobotId::Right).await;
    harness
        .send(json!({"type": "command", "command": "make_hug", "robot_id": "all"}))
        .await;
    assert_eq!(harness.next_event().await["type"], "ack");
    assert_eq!(harness.next_event().await["status"], "started");

    tokio::time::sleep(Duration::from_millis(2500)).await;
    harness
        .send(json!({"type": "command", "command": "paper", "robot_id": "robot_right"}))
        .await;

    assert_eq!(harness.next_event().await["command"], "paper");
    let cancelled = harness.next_event().await;
    assert_eq!(cancelled["command"], "make_hug");
    assert_eq!(cancelled["status"], "cancelled");
    assert_eq!(cancelled["outcome"], "hug_cancelled");
    let progress = harness.next_event().await;
    assert_eq!(progress["command"], "paper");
    assert_eq!(progress["status"], "started");
}

#[tokio::test(start_paused = true)]
async fn rejected_command_leaves_the_running_gesture_alone() {
    let mut harness = Harness::start(RobotId::Right).await;
    harness
        .send(json!({"type": "command", "command": "make_hug", "robot_id": "all"}))
        .await;
    assert_eq!(harness.next_event().await["type"], "ack");
    assert_eq!(harness.next_event().await["status"], "started");

    tokio::time::sleep(Duration::from_millis(2500)).await;
    harness
        .send(json!({"type": "command", "command": "set_joint", "id": 7, "angle": 90, "robot_id": "robot_right"}))
        .await;

    let ack = harness.next_event().await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["command"], "set_joint");
    let rejected = harness.next_event().await;
    assert_eq!(rejected["command"], "set_joint");
    assert_eq!(rejected["error"], "invalid_sid");

    let neutral = harness.next_event().await;
    assert_eq!(neutral["outcome"], "init_completed");
    let result = harness.next_event().await;
    assert_eq!(result["command"], "make_hug");
    assert_eq!(result["status"], "completed");
    assert_eq!(result["outcome"], "hug_completed");
    assert_eq!(harness.port.write_six_poses().len(), 10);
}
