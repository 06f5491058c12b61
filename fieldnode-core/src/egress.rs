//! Comms Egress Facade
//!
//! Single entry point for everything that flows *toward* the comms pump: the
//! aggregate data path and the orchestrator command lane. Callers stay
//! decoupled from command kinds and payload formats - they say what they
//! want published and this facade builds the JSON and picks the lane.
//!
//! Everything here is fire-and-forget mailbox traffic; a full lane drops
//! (counted, warned) rather than blocking the caller.

use log::warn;
use serde_json::Value;

use crate::bus::{BusError, MailboxSender};
use crate::events::{Aggregate, OrchCommand, OrchCommandKind};
use crate::hal::BatterySnapshot;
use crate::protocol;

/// Cloneable producer facade toward the comms pump.
pub struct CommsEgress {
    commands: MailboxSender<OrchCommand>,
    aggregates: MailboxSender<Aggregate>,
}

impl Clone for CommsEgress {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            aggregates: self.aggregates.clone(),
        }
    }
}

impl CommsEgress {
    /// Facade over the command and aggregate lanes.
    pub fn new(
        commands: MailboxSender<OrchCommand>,
        aggregates: MailboxSender<Aggregate>,
    ) -> Self {
        Self {
            commands,
            aggregates,
        }
    }

    fn send(&self, kind: OrchCommandKind, payload: Option<&Value>) -> Result<(), BusError> {
        let cmd = match payload {
            Some(v) => {
                let json = v.to_string();
                if json.len() > 256 {
                    warn!(target: "egress", "command payload {} bytes, clipping", json.len());
                }
                OrchCommand::with_payload(kind, &json)
            }
            None => OrchCommand::bare(kind),
        };
        self.commands.publish(cmd)
    }

    /// Hand one aggregate to the comms data path.
    pub fn send_aggregate(&self, aggregate: &Aggregate) -> Result<(), BusError> {
        self.aggregates.publish(aggregate.clone())
    }

    /// Plain status publish for the current (awake) mode.
    pub fn publish_awake(&self) -> Result<(), BusError> {
        self.send(OrchCommandKind::PublishAwake, None)
    }

    /// `modeChange` between two awake modes; hibernate transitions take the
    /// hibernating lane so the pump stamps the right base mode.
    pub fn publish_mode_change(&self, mode: &str, previous_mode: &str) -> Result<(), BusError> {
        let payload = protocol::encode_mode_change(mode, previous_mode);
        if mode == "hibernate" {
            self.send(OrchCommandKind::PublishHibernating, Some(&payload))
        } else {
            self.send(OrchCommandKind::PublishAwake, Some(&payload))
        }
    }

    /// Periodic status with battery fields merged in.
    pub fn publish_status(&self, battery: &BatterySnapshot, mode: &str) -> Result<(), BusError> {
        let mut extra = protocol::encode_battery_fields(battery);
        if let Some(obj) = extra.as_object_mut() {
            obj.insert("mode".into(), Value::String(mode.into()));
        }
        self.send(OrchCommandKind::PublishAwake, Some(&extra))
    }

    /// One-time alert when the emergency hibernate timer is armed.
    pub fn publish_low_battery_alert(
        &self,
        battery: &BatterySnapshot,
        mode: &str,
    ) -> Result<(), BusError> {
        let payload = protocol::encode_low_battery_alert(mode, battery.minimum_voltage);
        self.send(OrchCommandKind::PublishAwake, Some(&payload))
    }

    /// Ask the pump for a (possibly chunked) config snapshot.
    pub fn publish_config(&self) -> Result<(), BusError> {
        self.send(OrchCommandKind::PublishConfig, None)
    }

    /// Route a settings patch through the pump for apply + persist.
    pub fn apply_settings_json(&self, patch: &Value) -> Result<(), BusError> {
        self.send(OrchCommandKind::ApplySettingsJson, Some(patch))
    }

    /// `hibernating` status with reason and expected duration.
    pub fn publish_hibernating(
        &self,
        reason: &str,
        expected_duration_s: u32,
    ) -> Result<(), BusError> {
        let payload = protocol::encode_hibernating_extra(reason, expected_duration_s);
        self.send(OrchCommandKind::PublishHibernating, Some(&payload))
    }

    /// `modeChange` into hibernate with reason and expected duration.
    pub fn publish_hibernate_mode_change(
        &self,
        previous_mode: &str,
        reason: &str,
        expected_duration_s: u32,
    ) -> Result<(), BusError> {
        let payload =
            protocol::encode_hibernate_mode_change(previous_mode, reason, expected_duration_s);
        self.send(OrchCommandKind::PublishHibernating, Some(&payload))
    }
}
