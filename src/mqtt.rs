//! Direct MQTT session to the broker.
//!
//! The event loop runs on its own task: it reconnects after [`RECONNECT_DELAY`], renews
//! every subscription on each CONNACK, and reports the session as [`LinkEvent`]s.
//! Publishing never waits for a reconnect; while the session is down it fails with
//! [`BridgeError::ConnectivityLost`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration, Transport,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{InboundMessage, LinkEvent, MessageBus};
use crate::config::{BrokerSettings, BrokerTransport};
use crate::error::{BridgeError, Result};

pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 64;

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Builds client options from the `[broker]` section.
pub fn options(broker: &BrokerSettings, client_id: &str) -> Result<MqttOptions> {
    let mut options = match broker.transport {
        BrokerTransport::Tcp => MqttOptions::new(client_id, broker.host.clone(), broker.port),
        BrokerTransport::Websockets => {
            let scheme = if broker.tls { "wss" } else { "ws" };
            let url = format!(
                "{scheme}://{}:{}{}",
                broker.host, broker.port, broker.ws_path
            );
            MqttOptions::new(client_id, url, broker.port)
        }
    };
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);
    if let Some(username) = &broker.username {
        options.set_credentials(username.clone(), broker.password.clone().unwrap_or_default());
    }
    if broker.tls && broker.tls_insecure {
        warn!("broker.tls_insecure is not supported; certificates are still verified");
    }

    let tls = match (&broker.ca_certs, broker.tls) {
        (_, false) => None,
        (Some(path), true) => Some(TlsConfiguration::Simple {
            ca: std::fs::read(path)?,
            alpn: None,
            client_auth: None,
        }),
        (None, true) => None,
    };
    let transport = match (broker.transport, broker.tls, tls) {
        (BrokerTransport::Tcp, false, _) => Transport::Tcp,
        (BrokerTransport::Tcp, true, Some(tls)) => Transport::Tls(tls),
        (BrokerTransport::Tcp, true, None) => Transport::tls_with_default_config(),
        (BrokerTransport::Websockets, false, _) => Transport::Ws,
        (BrokerTransport::Websockets, true, Some(tls)) => Transport::Wss(tls),
        (BrokerTransport::Websockets, true, None) => Transport::wss_with_default_config(),
    };
    options.set_transport(transport);
    Ok(options)
}

/// MQTT-backed [`MessageBus`].
#[derive(Clone)]
pub struct MqttLink {
    client: AsyncClient,
    qos: QoS,
    connected: Arc<AtomicBool>,
}

impl std::fmt::Debug for MqttLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttLink")
            .field("qos", &self.qos)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl MqttLink {
    /// Opens the session and subscribes to `topics`. The event loop stops once the
    /// returned receiver is dropped.
    pub fn connect(
        broker: &BrokerSettings,
        client_id: &str,
        topics: Vec<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>)> {
        let options = options(broker, client_id)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let link = Self {
            client,
            qos: qos(broker.qos),
            connected: Arc::new(AtomicBool::new(false)),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(link.clone().drive(eventloop, topics, tx));
        info!(host = %broker.host, port = broker.port, client_id, "mqtt session started");
        Ok((link, rx))
    }

    async fn drive(
        self,
        mut eventloop: EventLoop,
        topics: Vec<String>,
        tx: mpsc::UnboundedSender<LinkEvent>,
    ) {
        while !tx.is_closed() {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.connected.store(true, Ordering::SeqCst);
                    for topic in &topics {
                        if let Err(err) = self.client.try_subscribe(topic.clone(), self.qos) {
                            warn!(topic = %topic, %err, "subscribe request failed");
                        }
                    }
                    info!(topics = topics.len(), "mqtt connected");
                    if tx.send(LinkEvent::Connected).is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                    let message = InboundMessage::new(publish.topic, payload);
                    if tx.send(LinkEvent::Message(message)).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    if self.connected.swap(false, Ordering::SeqCst) {
                        warn!(%err, "mqtt connection lost");
                        if tx.send(LinkEvent::Disconnected(err.to_string())).is_err() {
                            break;
                        }
                    } else {
                        debug!(%err, "mqtt connect failed");
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
        debug!("mqtt event loop stopped");
    }
}

#[async_trait]
impl MessageBus for MqttLink {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::ConnectivityLost("mqtt session is down".to_string()));
        }
        self.client
            .try_publish(topic, self.qos, false, payload.as_bytes().to_vec())
            .map_err(|err| BridgeError::ConnectivityLost(err.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
