//! Protocol adapters for the fieldnode control plane
//!
//! The core defines transport contracts ([`fieldnode_core::link`]); this
//! crate provides implementations that carry real network dependencies:
//!
//! - MQTT via rumqttc ([`mqtt::RumqttcLink`])
//!
//! The cellular modem contract has no adapter here - it is board-specific
//! and ships with the board support package.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod mqtt;

pub use mqtt::RumqttcLink;
