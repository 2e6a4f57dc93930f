//! Broker link through a local relay process, selected with `broker.link = "relay"`.
//!
//! The relay owns the broker session and exposes it on a local socket (Unix domain
//! socket or named pipe) using JSON lines:
//!
//! - subscribe connection: the bridge sends one `{"op":"subscribe", ...}` handshake
//!   carrying the broker settings, client id and topic list, then reads
//!   `{"topic":..,"payload":..}` lines until the socket closes
//! - publish connection: the bridge sends `{"op":"publisher","client_id":..}` once, then
//!   `{"op":"publish","topic":..,"payload":..,"qos":..}` per message
//!
//! Both connections are re-established after a fixed [`RECONNECT_DELAY`], forever.

use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use interprocess::local_socket::LocalSocketStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{InboundMessage, LinkEvent, MessageBus};
use crate::config::BrokerSettings;
use crate::error::{BridgeError, Result};

pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// One line received from the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RelayLine {
    topic: String,
    #[serde(default)]
    payload: String,
}

/// Relay-backed [`MessageBus`].
#[derive(Clone)]
pub struct RelayLink {
    broker: BrokerSettings,
    client_id: String,
    publisher: Arc<Mutex<Option<LocalSocketStream>>>,
    connected: Arc<AtomicBool>,
}

impl std::fmt::Debug for RelayLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayLink")
            .field("socket", &self.broker.relay_socket)
            .field("client_id", &self.client_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl RelayLink {
    pub fn new(broker: BrokerSettings, client_id: impl Into<String>) -> Self {
        Self {
            broker,
            client_id: client_id.into(),
            publisher: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn handshake(&self, topics: &[String]) -> String {
        let broker = &self.broker;
        let mut line = json!({
            "op": "subscribe",
            "client_id": self.client_id,
            "broker": {
                "host": broker.host,
                "port": broker.port,
                "username": broker.username,
                "password": broker.password,
                "tls": broker.tls,
                "tls_insecure": broker.tls_insecure,
                "ca_certs": broker.ca_certs,
                "transport": broker.transport,
                "ws_path": broker.ws_path,
            },
            "qos": broker.qos,
            "topics": topics,
        })
        .to_string();
        line.push('\n');
        line
    }

    /// Starts the subscribe loop on a dedicated thread. The loop ends once the returned
    /// receiver is dropped.
    pub fn subscribe(&self, topics: Vec<String>) -> mpsc::UnboundedReceiver<LinkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = self.broker.relay_socket.clone();
        let handshake = self.handshake(&topics);
        let connected = self.connected.clone();

        let spawned = thread::Builder::new()
            .name("relay-subscribe".to_string())
            .spawn(move || {
                while !tx.is_closed() {
                    match Self::read_session(&socket, &handshake, &tx, &connected) {
                        Ok(()) => info!(socket = %socket, "relay closed the subscribe connection"),
                        Err(err) => debug!(socket = %socket, %err, "relay subscribe failed"),
                    }
                    if connected.swap(false, Ordering::SeqCst) {
                        let _ = tx.send(LinkEvent::Disconnected("relay connection lost".to_string()));
                    }
                    thread::sleep(RECONNECT_DELAY);
                }
            });
        if let Err(err) = spawned {
            warn!(%err, "could not start relay subscribe thread");
        }
        rx
    }

    fn read_session(
        socket: &str,
        handshake: &str,
        tx: &mpsc::UnboundedSender<LinkEvent>,
        connected: &AtomicBool,
    ) -> Result<()> {
        let mut stream = LocalSocketStream::connect(socket)?;
        stream.write_all(handshake.as_bytes())?;
        stream.flush()?;
        connected.store(true, Ordering::SeqCst);
        info!(socket, "relay subscribe connection established");
        if tx.send(LinkEvent::Connected).is_err() {
            return Ok(());
        }

        for line in BufReader::new(stream).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RelayLine>(&line) {
                Ok(msg) => {
                    if tx
                        .send(LinkEvent::Message(InboundMessage::new(msg.topic, msg.payload)))
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                Err(err) => debug!(%err, "ignoring relay line"),
            }
        }
        Ok(())
    }

    fn publish_blocking(
        socket: &str,
        client_id: &str,
        slot: &mut Option<LocalSocketStream>,
        line: &[u8],
    ) -> Result<()> {
        if slot.is_none() {
            let mut stream = LocalSocketStream::connect(socket)?;
            let hello = json!({"op": "publisher", "client_id": client_id}).to_string() + "\n";
            stream.write_all(hello.as_bytes())?;
            *slot = Some(stream);
        }
        let Some(stream) = slot.as_mut() else {
            return Err(BridgeError::ConnectivityLost("relay publisher missing".to_string()));
        };
        let written = stream.write_all(line).and_then(|_| stream.flush());
        if let Err(err) = written {
            *slot = None;
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for RelayLink {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let mut line = json!({
            "op": "publish",
            "topic": topic,
            "payload": payload,
            "qos": self.broker.qos,
        })
        .to_string();
        line.push('\n');

        let publisher = self.publisher.clone();
        let socket = self.broker.relay_socket.clone();
        let client_id = self.client_id.clone();
        tokio::task::spawn_blocking(move || {
            let mut slot = publisher.lock();
            Self::publish_blocking(&socket, &client_id, &mut slot, line.as_bytes())
        })
        .await
        .map_err(|e| BridgeError::Transport(format!("publish task failed: {e}")))?
        .map_err(|err| BridgeError::ConnectivityLost(err.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use interprocess::local_socket::LocalSocketListener;
    use serde_json::Value;

    fn settings(socket: &str) -> BrokerSettings {
        BrokerSettings {
            relay_socket: socket.to_string(),
            ..BrokerSettings::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subscribe_handshake_and_delivery() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("relay.sock");
        let path = path.to_string_lossy().to_string();
        let listener = LocalSocketListener::bind(path.as_str()).expect("bind");

        let server = thread::spawn(move || {
            let stream = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream);
            let mut handshake = String::new();
            reader.read_line(&mut handshake).expect("handshake");
            let mut stream = reader.into_inner();
            stream
                .write_all(b"{\"topic\":\"robot/robot/all/command\",\"payload\":\"{}\"}\n")
                .expect("write");
            handshake
        });

        let link = RelayLink::new(settings(&path), "robot_left-test");
        let mut events = link.subscribe(vec!["robot/robot/all/command".to_string()]);
        assert_eq!(events.recv().await, Some(LinkEvent::Connected));
        assert_eq!(
            events.recv().await,
            Some(LinkEvent::Message(InboundMessage::new(
                "robot/robot/all/command",
                "{}"
            )))
        );

        let handshake: Value =
            serde_json::from_str(&server.join().expect("server")).expect("json");
        assert_eq!(handshake["op"], "subscribe");
        assert_eq!(handshake["client_id"], "robot_left-test");
        assert_eq!(handshake["topics"][0], "robot/robot/all/command");
        assert_eq!(handshake["broker"]["port"], 1883);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn publish_writes_json_lines() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("relay.sock");
        let path = path.to_string_lossy().to_string();
        let listener = LocalSocketListener::bind(path.as_str()).expect("bind");

        let server = thread::spawn(move || {
            let stream = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream);
            let mut lines = Vec::new();
            for _ in 0..3 {
                let mut line = String::new();
                reader.read_line(&mut line).expect("line");
                lines.push(line);
            }
            lines
        });

        let link = RelayLink::new(settings(&path), "robot_right-test");
        link.publish("robot/robot/event", "{\"type\":\"ack\"}")
            .await
            .expect("publish");
        link.publish("robot/robot/joint", "{}").await.expect("publish");

        let lines = server.join().expect("server");
        let hello: Value = serde_json::from_str(&lines[0]).expect("json");
        assert_eq!(hello["op"], "publisher");
        let first: Value = serde_json::from_str(&lines[1]).expect("json");
        assert_eq!(first["topic"], "robot/robot/event");
        assert_eq!(first["payload"], "{\"type\":\"ack\"}");
        let second: Value = serde_json::from_str(&lines[2]).expect("json");
        assert_eq!(second["topic"], "robot/robot/joint");
    }

    #[tokio::test]
    async fn missing_relay_is_connectivity_lost() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("absent.sock");
        let link = RelayLink::new(settings(&path.to_string_lossy()), "x");
        assert!(!link.is_connected());
        assert!(matches!(
            link.publish("t", "p").await,
            Err(BridgeError::ConnectivityLost(_))
        ));
    }
}
