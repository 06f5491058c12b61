//! Message Types for the Mailbox Fabric
//!
//! ## Overview
//!
//! Everything that crosses a mailbox is defined here: sensor samples, windowed
//! aggregates, worker telemetry, UI events, comms events, and orchestrator
//! commands. The types are the contract between activities - an activity never
//! sees another activity's internals, only these messages.
//!
//! ## Memory Model
//!
//! Messages are moved into a bounded channel slot and moved out exactly once
//! by the single consumer; nothing is shared. String fields use inline
//! fixed-capacity storage so a message never allocates:
//!
//! - channel names (`k0`/`k1`): 7 bytes
//! - topics: 63 bytes
//! - UI values: 127 bytes
//! - JSON payloads: 256 bytes
//! - session ids: 47 bytes
//!
//! Oversized input is truncated on a character boundary at construction,
//! mirroring the fixed `char[]` fields this wire format originated with.

use heapless::String as InlineString;

/// Channel name, e.g. `"cond"` or `"temp"`
pub type KeyString = InlineString<7>;
/// MQTT topic
pub type TopicString = InlineString<63>;
/// UI event value
pub type ValueString = InlineString<127>;
/// JSON payload carried inside a command or event
pub type PayloadString = InlineString<256>;
/// Sampling session identifier
pub type SessionIdString = InlineString<47>;

/// Copy `s` into an inline string, truncating on a char boundary if needed.
pub fn clipped<const N: usize>(s: &str) -> InlineString<N> {
    let mut out = InlineString::new();
    for ch in s.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// One sensor reading (sampler to aggregator).
///
/// `rel_ms` is milliseconds since the current session reference time. An
/// empty `k1` means the sensor exposes a single channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Milliseconds since session reference
    pub rel_ms: u32,
    /// First channel name
    pub k0: KeyString,
    /// First channel value
    pub v0: f32,
    /// Second channel name (empty when single-channel)
    pub k1: KeyString,
    /// Second channel value
    pub v1: f32,
    /// Reading quality flag; ANDed into the window
    pub ok: bool,
}

/// One reduced window (aggregator to comms).
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    /// Session-relative time of the first folded sample
    pub rel_start_ms: u32,
    /// Session-relative time of the last folded sample
    pub rel_end_ms: u32,
    /// First channel name
    pub k0: KeyString,
    /// First channel mean
    pub v0_avg: f32,
    /// First channel minimum
    pub v0_min: f32,
    /// First channel maximum
    pub v0_max: f32,
    /// Second channel name (empty when single-channel)
    pub k1: KeyString,
    /// Second channel mean
    pub v1_avg: f32,
    /// Second channel minimum
    pub v1_min: f32,
    /// Second channel maximum
    pub v1_max: f32,
    /// Number of samples folded into the window; >= 1 on any emitted value
    pub n: u32,
    /// AND of all constituent sample `ok` flags
    pub ok: bool,
}

/// Worker telemetry kinds (sampler/aggregator to orchestrator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEventKind {
    /// A sample was produced and handed to the data path
    SampleTaken,
    /// A window was reduced and handed to comms
    AggregateReady,
}

/// Lightweight worker event for orchestrator visibility.
///
/// These do not replace the data mailboxes; they exist so the orchestrator
/// sees activity (for its inactivity timer) without touching the data path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerEvent {
    /// Event kind
    pub kind: WorkerEventKind,
    /// Uptime timestamp
    pub ts_ms: u32,
    /// Session-relative timestamp of the underlying data
    pub rel_ms: u32,
    /// Sample count (1 for `SampleTaken`)
    pub n: u32,
    /// Quality flag of the underlying data
    pub ok: bool,
}

/// UI-originated event (keys, menu actions).
#[derive(Debug, Clone, PartialEq)]
pub struct UiEvent {
    /// Uptime timestamp
    pub ts_ms: u32,
    /// What happened, e.g. `"key/up"`
    pub topic: TopicString,
    /// Event detail
    pub value: ValueString,
}

/// Events from the comms pump to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum CommsEvent {
    /// Pump initialized
    Boot,
    /// Cellular attach succeeded
    NetUp,
    /// Cellular attach failed or was torn down
    NetDown,
    /// MQTT session established, subscriptions in place
    MqttUp,
    /// MQTT session lost
    MqttDown,
    /// Inbound message on the command topic
    ServerCommand {
        /// Full topic the message arrived on
        topic: TopicString,
        /// Raw JSON payload
        payload: PayloadString,
    },
    /// An outbound publish failed
    PublishFailed {
        /// Topic the publish was aimed at
        topic: TopicString,
    },
    /// An aggregate was drained and a publish attempted (any outcome)
    AggregatePublishAttempted {
        /// Whether the publish succeeded
        ok: bool,
    },
}

/// Command kinds the orchestrator sends to the comms pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchCommandKind {
    /// Publish a status message for a non-hibernating mode
    PublishAwake,
    /// Publish a status message for the hibernating mode
    PublishHibernating,
    /// Publish the (possibly chunked) configuration snapshot
    PublishConfig,
    /// Apply a JSON settings patch and persist it
    ApplySettingsJson,
}

/// Command message (orchestrator to comms).
///
/// `payload` carries the JSON extra fields to merge into the status object,
/// or the settings patch; empty when the command takes no argument.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchCommand {
    /// What to do
    pub kind: OrchCommandKind,
    /// JSON argument, possibly empty
    pub payload: PayloadString,
}

impl OrchCommand {
    /// Command without an argument.
    pub fn bare(kind: OrchCommandKind) -> Self {
        Self {
            kind,
            payload: PayloadString::new(),
        }
    }

    /// Command carrying a JSON argument, truncated to the payload capacity.
    pub fn with_payload(kind: OrchCommandKind, json: &str) -> Self {
        Self {
            kind,
            payload: clipped(json),
        }
    }
}

/// Unified event stream the orchestrator consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// From the comms pump
    Comms(CommsEvent),
    /// From the sampler or aggregator
    Worker(WorkerEvent),
    /// From the UI
    Ui(UiEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clipped_truncates_on_char_boundary() {
        let k: KeyString = clipped("conductivity");
        assert_eq!(k.as_str(), "conduct");

        // A multi-byte char that would straddle the capacity is dropped
        // whole: "conduc" is 6 bytes, "°" needs 2 more than the 7 allowed.
        let k: KeyString = clipped("conduc°x");
        assert_eq!(k.as_str(), "conduc");
    }

    #[test]
    fn clipped_keeps_short_input() {
        let k: KeyString = clipped("temp");
        assert_eq!(k.as_str(), "temp");
    }

    #[test]
    fn device_event_is_bounded() {
        // Every variant is inline storage; the whole stream stays heap-free.
        assert!(core::mem::size_of::<DeviceEvent>() <= 512);
    }

    #[test]
    fn bare_command_has_empty_payload() {
        let cmd = OrchCommand::bare(OrchCommandKind::PublishConfig);
        assert!(cmd.payload.is_empty());
    }
}
