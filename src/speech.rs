//! Spoken prompts.
//!
//! Text-to-speech runs outside the bridge. [`BusSpeaker`] hands phrases to it over the
//! message bus as `{"text": ...}`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::bus::MessageBus;
use crate::error::Result;
use crate::messages::CommandKind;

#[async_trait]
pub trait Speaker: Send + Sync {
    async fn say(&self, text: &str) -> Result<()>;
}

/// Publishes phrases on a speech topic.
#[derive(Clone)]
pub struct BusSpeaker {
    bus: Arc<dyn MessageBus>,
    topic: String,
}

impl BusSpeaker {
    pub fn new(bus: Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Speaker for BusSpeaker {
    async fn say(&self, text: &str) -> Result<()> {
        debug!(topic = %self.topic, text, "speak");
        let payload = json!({ "text": text }).to_string();
        self.bus.publish(&self.topic, &payload).await
    }
}

/// Phrase spoken when a gesture command is announced. Manual and mode commands have none.
pub fn spoken_name(command: CommandKind) -> Option<&'static str> {
    let phrase = match command {
        CommandKind::MakeHeart => "사랑해",
        CommandKind::MakeHug => "안아줄게",
        CommandKind::MakeHello => "안녕",
        CommandKind::Scissors => "가위!",
        CommandKind::Rock => "바위!",
        CommandKind::Paper => "보!",
        CommandKind::GoodMorning => "좋은 아침!",
        CommandKind::GoodNight => "잘자요~",
        CommandKind::AteAll => "이 닦을 시간이야~",
        CommandKind::Hungry => "밥 먹을 시간이야~",
        CommandKind::InitPose => "초기 자세로 이동할게",
        _ => return None,
    };
    Some(phrase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, MessageBus};

    #[test]
    fn every_gesture_has_a_phrase() {
        for command in CommandKind::gestures() {
            assert!(spoken_name(command).is_some(), "{command}");
        }
        assert_eq!(spoken_name(CommandKind::SetJoint), None);
        assert_eq!(spoken_name(CommandKind::Rock), Some("바위!"));
    }

    #[tokio::test]
    async fn bus_speaker_publishes_text() {
        let hub = MemoryBus::new();
        let mut tap = hub.tap();
        let bus: Arc<dyn MessageBus> = Arc::new(hub);
        let speaker = BusSpeaker::new(bus, "robot/tts");
        speaker.say("안녕").await.expect("say");

        let msg = tap.recv().await.expect("published");
        assert_eq!(msg.topic, "robot/tts");
        let value: serde_json::Value = serde_json::from_str(&msg.payload).expect("json");
        assert_eq!(value["text"], "안녕");
    }
}
