//! Network Link Contracts: Cellular Modem and MQTT Transport
//!
//! The comms pump drives these traits; `fieldnode-connectors` provides the
//! rumqttc-backed MQTT implementation, the board provides the modem. Tests
//! script both.
//!
//! The split between [`MqttLink::disconnect`] and
//! [`MqttLink::stop_transport`] matters for power safety: a graceful MQTT
//! DISCONNECT writes to the network and may block, so the hibernate path
//! drops the transport without it.

use thiserror::Error;

/// Link failures, classified for retry policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Cellular attach failed
    #[error("cellular attach failed")]
    Attach,
    /// Transport (TCP) connect failed
    #[error("transport connect failed")]
    Connect,
    /// Broker refused the MQTT session
    #[error("mqtt connect refused")]
    MqttRefused,
    /// Operation attempted without a session
    #[error("not connected")]
    NotConnected,
    /// Payload exceeds the publish budget
    #[error("payload too large ({0} bytes)")]
    PayloadTooLarge(usize),
    /// Transport-level I/O failure
    #[error("link i/o: {0}")]
    Io(String),
}

/// Cellular network bring-up parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetConfig {
    /// SIM PIN
    pub sim_pin: String,
    /// Access point name
    pub apn: String,
    /// APN username
    pub apn_user: String,
    /// APN password
    pub apn_pass: String,
}

/// MQTT session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSessionConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Client identifier
    pub client_id: String,
    /// Username (empty: anonymous)
    pub user: String,
    /// Password
    pub pass: String,
}

/// Inbound MQTT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Topic the message arrived on
    pub topic: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

/// Cellular modem driver contract.
///
/// Only ever called from the cooperative main context.
pub trait CellularModem: Send {
    /// Attach to the network. Blocking, possibly for seconds.
    fn bring_up(&mut self, cfg: &NetConfig) -> Result<(), LinkError>;
    /// Hard-reset the modem stack.
    fn reset(&mut self);
    /// End the session. Skipped on the hibernate path (may block).
    fn end(&mut self);
    /// True while attached.
    fn is_up(&self) -> bool;
}

/// MQTT client contract.
pub trait MqttLink: Send {
    /// Open transport and MQTT session.
    fn connect(&mut self, cfg: &MqttSessionConfig) -> Result<(), LinkError>;
    /// Subscribe to a topic filter.
    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError>;
    /// Publish one message (QoS 0).
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), LinkError>;
    /// Drive the session and return the next inbound message, if any.
    /// Must not block for more than a few milliseconds.
    fn poll(&mut self) -> Result<Option<Inbound>, LinkError>;
    /// True while the session is established.
    fn connected(&self) -> bool;
    /// Graceful DISCONNECT then transport teardown. May write to the network.
    fn disconnect(&mut self);
    /// Drop the transport without a DISCONNECT. Never blocks.
    fn stop_transport(&mut self);
}
