use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use carebot_bridge::bridge::{open_arm, reap, spawn_publisher, Bridge};
use carebot_bridge::bus::{LinkEvent, MessageBus};
use carebot_bridge::config::{BridgeConfig, BrokerLink, CliOverrides};
use carebot_bridge::link::RelayLink;
use carebot_bridge::logging::init_logging;
use carebot_bridge::mqtt::MqttLink;
use carebot_bridge::orchestrator::{RpsOrchestrator, RpsRound};
use carebot_bridge::speech::BusSpeaker;
use carebot_bridge::{Result, RobotId};

const CONNECT_WAIT: Duration = Duration::from_secs(5);

const LONG_ABOUT: &str = "\
Robot-arm bridge between a serial servo controller and the message bus.

Broker links (`broker.link` or CAREBOT_BROKER_LINK):
  mqtt   (default) the bridge owns the MQTT session to broker.host:broker.port,
         over TCP or websockets, with optional TLS.
  relay  the bridge talks JSON lines to a relay process on broker.relay_socket
         (Unix socket or named pipe). The relay owns the broker session.

Relay protocol, one JSON object per line:
  subscribe connection  bridge sends {\"op\":\"subscribe\",\"client_id\",\"broker\",\"qos\",\"topics\"},
                        relay answers with {\"topic\",\"payload\"} lines until it closes.
  publish connection    bridge sends {\"op\":\"publisher\",\"client_id\"}, then
                        {\"op\":\"publish\",\"topic\",\"payload\",\"qos\"} lines.
Both connections are retried every 2 s.";

/// Robot-arm bridge between a serial servo controller and the message bus.
#[derive(Parser, Debug)]
#[command(name = "carebot-bridge", version, long_about = LONG_ABOUT)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Robot identity (`robot_left` or `robot_right`)
    #[arg(long, global = true)]
    robot_id: Option<String>,

    /// Short form of --robot-id: `left` or `right`
    #[arg(long, global = true, conflicts_with = "robot_id")]
    arm: Option<String>,

    /// Serial device path, overriding the config file
    #[arg(long, global = true)]
    serial_port: Option<String>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive the arm from bus commands (default)
    Run,
    /// Play one rock-paper-scissors round against the bus
    PlayRps,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = init_logging(&args.log_level) {
        eprintln!("{err}");
    }
    if let Err(err) = dispatch(args).await {
        error!(%err, "bridge exited with an error");
        std::process::exit(1);
    }
}

async fn dispatch(args: Args) -> Result<()> {
    let overrides = CliOverrides {
        robot_id: args.robot_id.clone().or_else(|| args.arm.clone()),
        serial_port: args.serial_port.clone(),
    };
    let config = BridgeConfig::load(args.config.as_deref(), &overrides)?;
    let robot = config.robot.robot_id()?;
    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config, robot).await,
        Command::PlayRps => play_rps(config, robot).await,
    }
}

/// Opens the configured broker link and subscribes to `topics`.
fn connect(
    config: &BridgeConfig,
    client_id: String,
    topics: Vec<String>,
) -> Result<(Arc<dyn MessageBus>, UnboundedReceiver<LinkEvent>)> {
    match config.broker.link {
        BrokerLink::Mqtt => {
            let (link, events) = MqttLink::connect(&config.broker, &client_id, topics)?;
            Ok((Arc::new(link), events))
        }
        BrokerLink::Relay => {
            let link = RelayLink::new(config.broker.clone(), client_id);
            let events = link.subscribe(topics);
            Ok((Arc::new(link), events))
        }
    }
}

async fn run(config: BridgeConfig, robot: RobotId) -> Result<()> {
    info!(
        robot_id = %robot,
        host = %config.broker.host,
        port = config.broker.port,
        link = ?config.broker.link,
        base = %config.broker.base_topic,
        "starting bridge"
    );
    let arm = open_arm(&config, robot);
    let (bridge, outbound) = Bridge::new(&config, robot, arm);

    let (bus, inbound) = connect(
        &config,
        format!("{robot}-{}", std::process::id()),
        bridge.topics().subscriptions(),
    )?;
    let publisher = spawn_publisher(bus, bridge.topics().clone(), outbound);

    tokio::select! {
        _ = bridge.run(inbound) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(%err, "ctrl-c handler failed");
            }
            info!("shutting down");
            bridge.stop().await;
        }
    }
    publisher.abort();
    reap("publisher", publisher).await;
    Ok(())
}

async fn play_rps(config: BridgeConfig, robot: RobotId) -> Result<()> {
    let settings = config.orchestrator.clone();
    let (bus, events) = connect(
        &config,
        format!("{robot}-rps-{}", std::process::id()),
        vec![settings.response_topic.clone()],
    )?;

    let deadline = tokio::time::Instant::now() + CONNECT_WAIT;
    while !bus.is_connected() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let base = config.broker.base_topic.clone();
    let speaker = Arc::new(BusSpeaker::new(bus.clone(), settings.speech_topic_for(&base)));
    let orchestrator = RpsOrchestrator::new(bus, speaker, base, settings);
    let listener = orchestrator.spawn_response_listener(events);

    match orchestrator.play().await {
        RpsRound::Finished(report) => info!(
            robot = %report.robot_move,
            player = %report.player,
            outcome = report.outcome.as_str(),
            "round finished"
        ),
        RpsRound::Aborted(reason) => warn!(?reason, "round aborted"),
    }
    listener.abort();
    reap("response listener", listener).await;
    Ok(())
}
