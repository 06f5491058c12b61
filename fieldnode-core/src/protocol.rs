//! Wire Protocol Codec: Topics, Inbound Commands, Outbound Payloads
//!
//! ## Topic Scheme
//!
//! `<prefix>/<nodeId>/<postfix>` with `prefix = "hastigNode"` and
//! `postfix` one of `cmd`, `cfg`, `data`, `status`. The node id is the
//! configured device name, or the hardware-derived hex id when unset.
//!
//! ## Inbound
//!
//! `cmd` payloads are JSON objects with a `type` field; optional fields ride
//! alongside (`sleepSeconds`, `samplingInterval`, `aggPeriodS`, `sessionID`).
//! Malformed JSON decodes to `None` and is dropped upstream without
//! refreshing the activity timer. An unrecognized `type` decodes to
//! [`CommandKind::Unknown`] so the orchestrator can log it.
//!
//! ## Outbound
//!
//! All outbound payload builders live here so every producer formats values
//! the same way: aggregates and one-shot results round to 2 decimals, except
//! channels named `"temp"` which round to 1 (the backend plots them that
//! way).

use serde_json::{json, Map, Value};

use crate::events::{Aggregate, Sample, SessionIdString, TopicString};

/// Inbound command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Server heartbeat: keep the sampling session alive
    KeepSampling,
    /// Enter Sampling, optionally overriding cadence/session id
    StartSampling,
    /// Return to Aware
    StopSampling,
    /// Publish the configuration snapshot
    GetConfig,
    /// Hibernate, optionally for `sleepSeconds`
    Hibernate,
    /// Activity-refresh no-op
    Nudge,
    /// Take a single sample outside any session
    OneShotSample,
    /// Clear PMIC min/max statistics
    ResetBatteryStatistics,
    /// Restore and persist default settings
    FactoryReset,
    /// Unrecognized `type` value
    Unknown,
}

/// Decoded inbound command with its optional fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Verb
    pub kind: CommandKind,
    /// Hibernate duration override
    pub sleep_seconds: Option<u32>,
    /// Sample period override (ms; clamped upstream)
    pub sampling_interval: Option<u32>,
    /// Aggregation window override
    pub agg_period_s: Option<u32>,
    /// Server-assigned session id
    pub session_id: Option<SessionIdString>,
}

fn kind_from_str(s: &str) -> CommandKind {
    match s {
        "keepSampling" => CommandKind::KeepSampling,
        "startSampling" => CommandKind::StartSampling,
        "stopSampling" => CommandKind::StopSampling,
        "getConfig" => CommandKind::GetConfig,
        "hibernate" => CommandKind::Hibernate,
        "nudge" => CommandKind::Nudge,
        "oneShotSample" => CommandKind::OneShotSample,
        "resetBatteryStatistics" => CommandKind::ResetBatteryStatistics,
        "factoryReset" => CommandKind::FactoryReset,
        _ => CommandKind::Unknown,
    }
}

fn opt_u32(doc: &Value, key: &str) -> Option<u32> {
    doc.get(key)
        .and_then(Value::as_u64)
        .filter(|n| *n <= u32::MAX as u64)
        .map(|n| n as u32)
}

/// Decode a `cmd` payload. `None` means the JSON itself was invalid.
pub fn decode_command(payload: &str) -> Option<Command> {
    let doc: Value = serde_json::from_str(payload).ok()?;
    let kind = kind_from_str(doc.get("type").and_then(Value::as_str).unwrap_or(""));

    let session_id = doc
        .get("sessionID")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(crate::events::clipped);

    Some(Command {
        kind,
        sleep_seconds: opt_u32(&doc, "sleepSeconds"),
        sampling_interval: opt_u32(&doc, "samplingInterval"),
        agg_period_s: opt_u32(&doc, "aggPeriodS"),
        session_id,
    })
}

/// Build `"<prefix>/<nodeId>/<postfix>"`, or `None` when it would not fit
/// the topic capacity.
pub fn build_topic(prefix: &str, node_id: &str, postfix: &str) -> Option<TopicString> {
    let full = format!("{prefix}/{node_id}/{postfix}");
    if full.len() > 63 {
        return None;
    }
    Some(crate::events::clipped(&full))
}

/// True when `topic` ends with `"/<postfix>"`.
pub fn topic_has_postfix(topic: &str, postfix: &str) -> bool {
    topic
        .strip_suffix(postfix)
        .map(|head| head.ends_with('/'))
        .unwrap_or(false)
}

/// Round for publication: 1 decimal for `"temp"` channels, 2 otherwise.
fn round_for_key(key: &str, v: f32) -> f64 {
    let mul = if key == "temp" { 10.0 } else { 100.0 };
    ((v as f64) * mul).round() / mul
}

/// `f32` to JSON without the widening noise (2.8f32 would otherwise
/// serialize as 2.799999952316284). Three decimals cover every field that
/// takes this path.
pub fn json_f32(v: f32) -> Value {
    json!(((v as f64) * 1000.0).round() / 1000.0)
}

/// Extra fields appended to a `hibernating` status message.
pub fn encode_hibernating_extra(reason: &str, expected_duration_s: u32) -> Value {
    json!({
        "reason": reason,
        "expectedDuration": expected_duration_s,
    })
}

/// `modeChange` payload for non-hibernate transitions.
pub fn encode_mode_change(mode: &str, previous_mode: &str) -> Value {
    json!({
        "type": "modeChange",
        "mode": mode,
        "previousMode": previous_mode,
    })
}

/// `modeChange` payload for transitions into hibernate.
pub fn encode_hibernate_mode_change(
    previous_mode: &str,
    reason: &str,
    expected_duration_s: u32,
) -> Value {
    json!({
        "type": "modeChange",
        "mode": "hibernate",
        "previousMode": previous_mode,
        "reason": reason,
        "expectedDuration": expected_duration_s,
    })
}

/// Battery fields merged into a periodic status message.
pub fn encode_battery_fields(snapshot: &crate::hal::BatterySnapshot) -> Value {
    json!({
        "batteryVoltage": json_f32(snapshot.voltage),
        "minimumVoltage": json_f32(snapshot.minimum_voltage),
        "batteryCurrent": json_f32(snapshot.current),
        "averageCurrent": json_f32(snapshot.average_current),
    })
}

/// `alert` payload published when the emergency timer is armed.
pub fn encode_low_battery_alert(mode: &str, minimum_voltage: f32) -> Value {
    json!({
        "type": "alert",
        "message": "Critically low battery detected. Emergency hibernate soon.",
        "mode": mode,
        "minimumVoltage": json_f32(minimum_voltage),
    })
}

/// `data` payload for one aggregate window.
pub fn encode_aggregate(a: &Aggregate) -> Value {
    let mut doc = Map::new();
    doc.insert("type".into(), json!("data"));
    doc.insert("t0".into(), json!(a.rel_start_ms));
    doc.insert("t1".into(), json!(a.rel_end_ms));
    doc.insert("n".into(), json!(a.n));
    doc.insert("ok".into(), json!(if a.ok { 1 } else { 0 }));

    let k0 = a.k0.as_str();
    doc.insert(format!("{k0}Avg"), json!(round_for_key(k0, a.v0_avg)));
    doc.insert(format!("{k0}Min"), json!(round_for_key(k0, a.v0_min)));
    doc.insert(format!("{k0}Max"), json!(round_for_key(k0, a.v0_max)));

    if !a.k1.is_empty() {
        let k1 = a.k1.as_str();
        doc.insert(format!("{k1}Avg"), json!(round_for_key(k1, a.v1_avg)));
        doc.insert(format!("{k1}Min"), json!(round_for_key(k1, a.v1_min)));
        doc.insert(format!("{k1}Max"), json!(round_for_key(k1, a.v1_max)));
    }

    Value::Object(doc)
}

/// `data` payload for a one-shot sample result.
pub fn encode_one_shot(s: &Sample) -> Value {
    let mut doc = Map::new();
    doc.insert("type".into(), json!("oneShotSampleResult"));
    doc.insert("t".into(), json!(s.rel_ms));
    doc.insert("ok".into(), json!(if s.ok { 1 } else { 0 }));
    doc.insert(s.k0.as_str().to_string(), json!(round_for_key(s.k0.as_str(), s.v0)));
    if !s.k1.is_empty() {
        doc.insert(s.k1.as_str().to_string(), json!(round_for_key(s.k1.as_str(), s.v1)));
    }
    Value::Object(doc)
}
