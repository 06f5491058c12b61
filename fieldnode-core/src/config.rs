//! Compile-time configuration: mailbox depths, topic scheme, timing limits
//!
//! Centralizing the tunables keeps the wiring reviewable in one place and
//! makes the power budget assumptions explicit.

/// Mailbox depth: sampler to aggregator data path
pub const QUEUE_DEPTH_SENSOR_TO_AGG: usize = 32;
/// Mailbox depth: one-shot sample results (sampler to comms)
pub const QUEUE_DEPTH_ONE_SHOT: usize = 4;
/// Mailbox depth: aggregator to comms data path
pub const QUEUE_DEPTH_AGG_TO_COMMS: usize = 16;
/// Mailbox depth: UI events to orchestrator
pub const QUEUE_DEPTH_UI_TO_ORCH: usize = 16;
/// Mailbox depth: comms events to orchestrator
pub const QUEUE_DEPTH_COMMS_TO_ORCH: usize = 16;
/// Mailbox depth: worker telemetry to orchestrator
pub const QUEUE_DEPTH_WORKER_TO_ORCH: usize = 8;
/// Mailbox depth: orchestrator commands to comms
pub const QUEUE_DEPTH_ORCH_TO_COMMS: usize = 16;

/// First topic segment for every node on the broker
pub const MQTT_TOPIC_PREFIX: &str = "hastigNode";
/// Inbound command topic postfix
pub const MQTT_TOPIC_POSTFIX_CMD: &str = "cmd";
/// Inbound configuration topic postfix
pub const MQTT_TOPIC_POSTFIX_CFG: &str = "cfg";
/// Outbound aggregate data topic postfix
pub const MQTT_TOPIC_POSTFIX_DATA: &str = "data";
/// Outbound status topic postfix
pub const MQTT_TOPIC_POSTFIX_STATUS: &str = "status";

/// Hard floor for the sample period. Shorter requests are clamped silently.
pub const MIN_SAMPLE_PERIOD_MS: u32 = 200;

/// Largest JSON payload a single MQTT publish may carry. The client buffer
/// is 512 bytes and must also hold topic and packet header.
pub const MAX_PUBLISH_PAYLOAD_BYTES: usize = 320;

/// Grace window after a hibernate request during which the comms pump keeps
/// running so the final status and queued publishes can egress.
pub const HIBERNATE_STATUS_GRACE_MS: u32 = 1500;

/// If MQTT has not come up this long after boot, give up and hibernate.
pub const MQTT_CONNECT_TIMEOUT_MS: u32 = 120_000;
/// Hibernate duration applied when the no-network gate fires.
pub const NO_NETWORK_HIBERNATE_S: u32 = 900;

/// Shortest standby the power manager will arm.
pub const MIN_SLEEP_S: u32 = 5;
/// Longest standby the power manager will arm (12 h safety cap).
pub const MAX_SLEEP_S: u32 = 43_200;

/// Orchestrator event-poll slice; also its timer resolution.
pub const ORCH_TICK_MS: u32 = 20;
/// Aggregator mailbox wait slice; bounds window-boundary latency.
pub const AGG_POLL_MS: u32 = 50;
/// How long the power manager waits for each activity thread to finish.
pub const THREAD_STOP_WAIT_MS: u32 = 250;
