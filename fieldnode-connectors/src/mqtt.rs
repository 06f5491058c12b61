//! rumqttc-Backed MQTT Link
//!
//! ## Why rumqttc
//!
//! Pure Rust (no C dependencies), small footprint, proven in production IoT
//! deployments. The comms pump is polled from a cooperative context, so this
//! adapter uses the synchronous `Client`/`Connection` pair rather than the
//! async API - no runtime required.
//!
//! ## Blocking Behavior
//!
//! `connect` blocks until CONNACK or a bounded timeout - that matches the
//! pump's connect path, which is allowed to take seconds. `poll` waits at
//! most a few milliseconds; keep-alive pings ride on whatever polling the
//! pump already does. `publish` uses the non-blocking enqueue so a stalled
//! link surfaces as an error instead of wedging the main loop.

use std::time::{Duration, Instant};

use log::{debug, warn};
use rumqttc::{Client, Connection, ConnectReturnCode, Event, MqttOptions, Packet, QoS};

use fieldnode_core::link::{Inbound, LinkError, MqttLink, MqttSessionConfig};

/// How long `connect` waits for CONNACK.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Per-poll wait; bounds the pump's tick time.
const POLL_WAIT: Duration = Duration::from_millis(10);
/// Broker keep-alive interval.
const KEEP_ALIVE: Duration = Duration::from_secs(30);
/// Client-side request queue depth.
const REQUEST_QUEUE: usize = 10;

/// MQTT link over rumqttc's synchronous client.
#[derive(Default)]
pub struct RumqttcLink {
    client: Option<Client>,
    connection: Option<Connection>,
    connected: bool,
}

impl RumqttcLink {
    /// New, unconnected link.
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&Client, LinkError> {
        self.client.as_ref().ok_or(LinkError::NotConnected)
    }
}

impl MqttLink for RumqttcLink {
    fn connect(&mut self, cfg: &MqttSessionConfig) -> Result<(), LinkError> {
        self.stop_transport();

        let mut options = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if !cfg.user.is_empty() {
            options.set_credentials(&cfg.user, &cfg.pass);
        }

        let (client, mut connection) = Client::new(options, REQUEST_QUEUE);

        // Drive the event loop until the broker answers the CONNECT.
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            if Instant::now() >= deadline {
                return Err(LinkError::Connect);
            }
            match connection.recv_timeout(Duration::from_millis(250)) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code == ConnectReturnCode::Success {
                        self.client = Some(client);
                        self.connection = Some(connection);
                        self.connected = true;
                        return Ok(());
                    }
                    warn!(target: "mqtt", "broker refused session: {:?}", ack.code);
                    return Err(LinkError::MqttRefused);
                }
                Ok(Ok(event)) => debug!(target: "mqtt", "pre-connack event: {event:?}"),
                Ok(Err(e)) => {
                    warn!(target: "mqtt", "connect failed: {e}");
                    return Err(LinkError::Connect);
                }
                // Timeout slice; keep waiting until the deadline.
                Err(_) => {}
            }
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        self.client()?
            .subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| LinkError::Io(e.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        self.client()?
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| LinkError::Io(e.to_string()))
    }

    fn poll(&mut self) -> Result<Option<Inbound>, LinkError> {
        let connection = self.connection.as_mut().ok_or(LinkError::NotConnected)?;
        match connection.recv_timeout(POLL_WAIT) {
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => Ok(Some(Inbound {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            })),
            Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                self.connected = false;
                Err(LinkError::Io("server disconnect".into()))
            }
            Ok(Ok(_)) => Ok(None),
            Ok(Err(e)) => {
                self.connected = false;
                Err(LinkError::Io(e.to_string()))
            }
            // Nothing within the poll slice.
            Err(_) => Ok(None),
        }
    }

    fn connected(&self) -> bool {
        self.connected && self.client.is_some()
    }

    fn disconnect(&mut self) {
        if let Some(client) = self.client.as_ref() {
            if let Err(e) = client.disconnect() {
                warn!(target: "mqtt", "disconnect failed: {e}");
            }
        }
        self.stop_transport();
    }

    fn stop_transport(&mut self) {
        // Dropping the pair closes the socket without an MQTT DISCONNECT.
        self.client = None;
        self.connection = None;
        self.connected = false;
    }
}
