//! Rock-paper-scissors round.
//!
//! This is the one routine that is genuinely sequential control flow rather than a
//! gesture table:
//! - prompts and results are spoken through a [`Speaker`]
//! - the arm is driven by broadcasting ordinary `command` messages
//! - the player's hand is classified by an external vision worker, which is asked with
//!   `"start"` on the request topic and answers once on the response topic
//!
//! A round never fails outward. Every abort is reported in [`RpsRound::Aborted`] after an
//! apology has been spoken.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{LinkEvent, MessageBus};
use crate::error::BridgeError;
use crate::messages::{CommandKind, BROADCAST_ID};
use crate::speech::{spoken_name, Speaker};

const PROMPT: &str = "그래";
const COUNTDOWN: &str = "준비됐어? 하나 둘 셋!";
const ROBOT_WINS: &str = "내가 이겼다!";
const DRAW: &str = "비겼네?";
const PLAYER_WINS: &str = "너가 이겼네...";
const UNDETECTED: &str = "너의 포즈를 탐지하지 못했어";
const TIMEOUT_APOLOGY: &str = "응답 시간이 초과되었습니다";
const FAILURE_APOLOGY: &str = "게임 중 오류가 발생했습니다";

/// `[orchestrator]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub countdown_ms: u64,
    pub response_timeout_ms: u64,
    pub result_pause_ms: u64,
    pub request_topic: String,
    pub response_topic: String,
    /// Defaults to `{base}/robot/all/tts`.
    pub speech_topic: Option<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            countdown_ms: 5000,
            response_timeout_ms: 10_000,
            result_pause_ms: 3000,
            request_topic: "rsp_req".to_string(),
            response_topic: "rsp_res".to_string(),
            speech_topic: None,
        }
    }
}

impl OrchestratorSettings {
    pub fn speech_topic_for(&self, base: &str) -> String {
        self.speech_topic
            .clone()
            .unwrap_or_else(|| format!("{}/robot/{BROADCAST_ID}/tts", base.trim_end_matches('/')))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpsMove {
    Rock,
    Paper,
    Scissors,
}

impl RpsMove {
    pub const ALL: [RpsMove; 3] = [RpsMove::Rock, RpsMove::Paper, RpsMove::Scissors];

    pub fn command(self) -> CommandKind {
        match self {
            RpsMove::Rock => CommandKind::Rock,
            RpsMove::Paper => CommandKind::Paper,
            RpsMove::Scissors => CommandKind::Scissors,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "rock" => Some(RpsMove::Rock),
            "paper" => Some(RpsMove::Paper),
            "scissors" => Some(RpsMove::Scissors),
            _ => None,
        }
    }

    pub fn beats(self, other: RpsMove) -> bool {
        matches!(
            (self, other),
            (RpsMove::Rock, RpsMove::Scissors)
                | (RpsMove::Scissors, RpsMove::Paper)
                | (RpsMove::Paper, RpsMove::Rock)
        )
    }
}

impl fmt::Display for RpsMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command().as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpsOutcome {
    RobotWins,
    PlayerWins,
    Draw,
}

impl RpsOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RpsOutcome::RobotWins => "Robot Wins",
            RpsOutcome::PlayerWins => "Player Wins",
            RpsOutcome::Draw => "Draw",
        }
    }
}

/// Scores the worker's answer against the robot's move and picks the phrase to speak.
/// Anything the worker could not classify counts as a robot win.
pub fn classify(player: &str, robot: RpsMove) -> (RpsOutcome, &'static str) {
    if player.eq_ignore_ascii_case("nolandmarks") || player.eq_ignore_ascii_case("unknown") {
        return (RpsOutcome::RobotWins, UNDETECTED);
    }
    match RpsMove::parse(player) {
        Some(hand) if hand == robot => (RpsOutcome::Draw, DRAW),
        Some(hand) if hand.beats(robot) => (RpsOutcome::PlayerWins, PLAYER_WINS),
        _ => (RpsOutcome::RobotWins, ROBOT_WINS),
    }
}

/// A completed round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpsReport {
    pub robot_move: RpsMove,
    /// Lower-cased worker answer.
    pub player: String,
    pub outcome: RpsOutcome,
    pub phrase: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpsAbort {
    Disconnected,
    Timeout,
    Failed(String),
}

impl RpsAbort {
    pub fn apology(&self) -> &'static str {
        match self {
            RpsAbort::Timeout => TIMEOUT_APOLOGY,
            _ => FAILURE_APOLOGY,
        }
    }
}

impl From<BridgeError> for RpsAbort {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::ConnectivityLost(_) => RpsAbort::Disconnected,
            BridgeError::Timeout(_) => RpsAbort::Timeout,
            other => RpsAbort::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpsRound {
    Finished(RpsReport),
    Aborted(RpsAbort),
}

type Chooser = Arc<dyn Fn() -> RpsMove + Send + Sync>;

#[derive(Clone)]
pub struct RpsOrchestrator {
    bus: Arc<dyn MessageBus>,
    speaker: Arc<dyn Speaker>,
    base: String,
    settings: OrchestratorSettings,
    chooser: Chooser,
    pending: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

impl fmt::Debug for RpsOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpsOrchestrator")
            .field("base", &self.base)
            .field("settings", &self.settings)
            .field("pending", &self.pending.lock().is_some())
            .finish()
    }
}

impl RpsOrchestrator {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        speaker: Arc<dyn Speaker>,
        base: impl Into<String>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            bus,
            speaker,
            base: base.into().trim_end_matches('/').to_string(),
            settings,
            chooser: Arc::new(|| {
                *RpsMove::ALL
                    .choose(&mut rand::thread_rng())
                    .unwrap_or(&RpsMove::Rock)
            }),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Replaces the random move picker.
    pub fn with_chooser(mut self, chooser: impl Fn() -> RpsMove + Send + Sync + 'static) -> Self {
        self.chooser = Arc::new(chooser);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Plays one round. Aborts are logged, apologised for and returned.
    pub async fn play(&self) -> RpsRound {
        match self.round().await {
            Ok(report) => {
                info!(
                    robot = %report.robot_move,
                    player = %report.player,
                    outcome = report.outcome.as_str(),
                    "rps round finished"
                );
                RpsRound::Finished(report)
            }
            Err(abort) => {
                warn!(?abort, "rps round aborted");
                if let Err(err) = self.speaker.say(abort.apology()).await {
                    warn!(%err, "apology could not be spoken");
                }
                RpsRound::Aborted(abort)
            }
        }
    }

    async fn round(&self) -> Result<RpsReport, RpsAbort> {
        self.speaker.say(PROMPT).await?;
        self.ensure_connected()?;
        self.broadcast(CommandKind::InitPose).await?;
        self.speaker.say(COUNTDOWN).await?;
        tokio::time::sleep(Duration::from_millis(self.settings.countdown_ms)).await;

        let robot_move = (self.chooser)();
        info!(robot = %robot_move, "robot move chosen");
        self.ensure_connected()?;
        self.broadcast(robot_move.command()).await?;
        if let Some(phrase) = spoken_name(robot_move.command()) {
            self.speaker.say(phrase).await?;
        }

        let player = self.request_detection().await?;
        let (outcome, phrase) = classify(&player, robot_move);
        self.speaker.say(phrase).await?;

        tokio::time::sleep(Duration::from_millis(self.settings.result_pause_ms)).await;
        self.broadcast(CommandKind::InitPose).await?;

        Ok(RpsReport {
            robot_move,
            player,
            outcome,
            phrase,
        })
    }

    fn ensure_connected(&self) -> Result<(), RpsAbort> {
        if self.bus.is_connected() {
            Ok(())
        } else {
            Err(RpsAbort::Disconnected)
        }
    }

    async fn broadcast(&self, command: CommandKind) -> Result<(), RpsAbort> {
        let payload = json!({
            "type": "command",
            "command": command.as_str(),
            "who": "backend",
            "robot_id": BROADCAST_ID,
        });
        let topic = format!("{}/robot/{BROADCAST_ID}/command", self.base);
        self.bus.publish(&topic, &payload.to_string()).await?;
        Ok(())
    }

    async fn request_detection(&self) -> Result<String, RpsAbort> {
        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(tx);
        let outcome = async {
            self.bus
                .publish(&self.settings.request_topic, "start")
                .await?;
            let wait = Duration::from_millis(self.settings.response_timeout_ms);
            match tokio::time::timeout(wait, rx).await {
                Ok(Ok(player)) => Ok(player),
                Ok(Err(_)) => Err(RpsAbort::Failed("response channel closed".to_string())),
                Err(_) => Err(RpsAbort::Timeout),
            }
        }
        .await;
        self.pending.lock().take();
        outcome
    }

    /// Feeds a worker response. Returns `true` when a pending round consumed it.
    pub fn handle_response(&self, payload: &str) -> bool {
        let data: Value = match serde_json::from_str(payload) {
            Ok(data) => data,
            Err(err) => {
                warn!(%err, payload, "undecodable rps response");
                return false;
            }
        };
        let Some(player) = data.get("result").and_then(Value::as_str) else {
            warn!(payload, "rps response without result");
            return false;
        };
        let player = player.to_lowercase();
        match self.pending.lock().take() {
            Some(tx) => tx.send(player).is_ok(),
            None => {
                warn!(player = %player, "rps response with no pending round");
                false
            }
        }
    }

    /// Routes inbound messages on the response topic into [`Self::handle_response`].
    pub fn spawn_response_listener(
        &self,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let LinkEvent::Message(msg) = event {
                    if msg.topic == this.settings.response_topic {
                        this.handle_response(&msg.payload);
                    }
                }
            }
        })
    }
}
