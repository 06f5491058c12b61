//! Orchestrator: Top-Level State Machine and Hibernate Policy
//!
//! ## States
//!
//! - **Aware**: connected and idle; periodic battery/status publishes, no
//!   sampling.
//! - **Sampling**: sampler and aggregator enabled; aggregates flow to the
//!   broker; the server acknowledges with `keepSampling`.
//! - **Hibernating**: producers disabled, final status queued; the power
//!   manager finishes the job from the main context.
//!
//! The initial state is Aware, entered immediately after the activity
//! starts.
//!
//! ## Timers
//!
//! Each ~20 ms tick, after the prioritized event poll:
//!
//! 1. No-network gate: MQTT never up within 120 s of boot fires exactly one
//!    hibernate request (reason `noNetwork`, 900 s).
//! 2. Status cadence (Aware/Sampling): battery read + status publish.
//! 3. Low-battery arming at the status read; disarm when voltage recovers.
//! 4. Emergency fire once the armed delay elapses.
//! 5. Inactivity hibernate after `awareTimeoutS` without any event.
//! 6. Unacked-aggregate limit (Sampling): too many publish attempts without
//!    a `keepSampling` drops back to Aware.
//!
//! Any received event refreshes the activity clock; a malformed server
//! command does not.

use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::{json, Map, Value};

use crate::bus::{ActivityGate, CancelToken, EventBus};
use crate::config::{
    MIN_SAMPLE_PERIOD_MS, MQTT_CONNECT_TIMEOUT_MS, NO_NETWORK_HIBERNATE_S, ORCH_TICK_MS,
};
use crate::egress::CommsEgress;
use crate::events::{CommsEvent, DeviceEvent};
use crate::hal::BatteryGauge;
use crate::power::{RestartReason, SleepControl};
use crate::protocol::{self, Command, CommandKind};
use crate::settings::SettingsManager;
use crate::time::{delta_ms, Clock, SessionClock};

/// Orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Connected, idle, awaiting commands
    Aware,
    /// Measuring and publishing
    Sampling,
    /// Shutdown requested; standby executed by the power manager
    Hibernating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HibernateReason {
    Inactivity,
    Forced,
    EmergencyPowerSave,
    NoNetwork,
}

impl HibernateReason {
    fn as_str(self) -> &'static str {
        match self {
            HibernateReason::Inactivity => "inactivity",
            HibernateReason::Forced => "forced",
            HibernateReason::EmergencyPowerSave => "lowPower",
            HibernateReason::NoNetwork => "noNetwork",
        }
    }
}

fn mode_str(state: State) -> &'static str {
    match state {
        State::Aware => "aware",
        State::Sampling => "sampling",
        State::Hibernating => "hibernate",
    }
}

/// The orchestrator activity.
pub struct Orchestrator {
    bus: EventBus,
    egress: CommsEgress,
    settings: Arc<SettingsManager>,
    session: Arc<SessionClock>,
    sampler: ActivityGate,
    aggregator: ActivityGate,
    sleep: SleepControl,
    battery: Box<dyn BatteryGauge>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,

    state: State,
    boot_ms: u32,
    mqtt_up_ms: Option<u32>,
    no_network_requested: bool,
    last_activity_ms: u32,
    last_status_ms: Option<u32>,
    unacked_aggregates: u32,
    emergency_armed_at_ms: Option<u32>,
    emergency_delay_ms: u32,
    hibernate_reason: HibernateReason,
    hibernate_duration_s: u32,
}

impl Orchestrator {
    /// Wire up the activity. Call [`run`](Self::run) on its own thread, or
    /// [`start`](Self::start) + [`tick`](Self::tick) to drive it manually.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: EventBus,
        egress: CommsEgress,
        settings: Arc<SettingsManager>,
        session: Arc<SessionClock>,
        sampler: ActivityGate,
        aggregator: ActivityGate,
        sleep: SleepControl,
        battery: Box<dyn BatteryGauge>,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
    ) -> Self {
        let boot_ms = clock.now_ms();
        Self {
            bus,
            egress,
            settings,
            session,
            sampler,
            aggregator,
            sleep,
            battery,
            clock,
            cancel,
            state: State::Aware,
            boot_ms,
            mqtt_up_ms: None,
            no_network_requested: false,
            last_activity_ms: boot_ms,
            last_status_ms: None,
            unacked_aggregates: 0,
            emergency_armed_at_ms: None,
            emergency_delay_ms: 0,
            hibernate_reason: HibernateReason::Inactivity,
            hibernate_duration_s: 0,
        }
    }

    /// Current state (for tests and the UI).
    pub fn state(&self) -> State {
        self.state
    }

    /// Activity main loop; returns when cancelled.
    pub fn run(mut self) {
        info!(target: "orch", "orchestrator started");
        self.start();
        while !self.cancel.is_cancelled() {
            self.tick(ORCH_TICK_MS);
        }
        info!(target: "orch", "orchestrator stopped");
    }

    /// Reset boot bookkeeping and enter the initial state.
    pub fn start(&mut self) {
        let now = self.clock.now_ms();
        self.boot_ms = now;
        self.last_activity_ms = now;
        self.last_status_ms = None;
        self.enter_state(State::Aware);
    }

    /// One scheduling slice: no-network gate, prioritized event poll
    /// (bounded by `poll_timeout_ms`), then the timer ladder.
    pub fn tick(&mut self, poll_timeout_ms: u32) {
        let now = self.clock.now_ms();

        // Give up on a network that never came: request hibernate once and
        // stay quiet until the power manager completes the transition.
        if !self.no_network_requested
            && self.state != State::Hibernating
            && self.mqtt_up_ms.is_none()
            && delta_ms(now, self.boot_ms) > MQTT_CONNECT_TIMEOUT_MS
        {
            self.no_network_requested = true;
            warn!(
                target: "orch",
                "no network/MQTT within timeout, hibernating for {NO_NETWORK_HIBERNATE_S} s"
            );
            self.hibernate_reason = HibernateReason::NoNetwork;
            self.hibernate_duration_s = NO_NETWORK_HIBERNATE_S;
            self.sleep
                .request_sleep(RestartReason::NoNetwork, NO_NETWORK_HIBERNATE_S);
            self.enter_state(State::Hibernating);
        }

        if let Some(event) = self.bus.try_get_next(poll_timeout_ms) {
            self.handle_event(event);
        }

        self.check_timeouts();
    }

    fn enter_state(&mut self, next: State) {
        let prev_mode = mode_str(self.state);
        let next_mode = mode_str(next);
        let is_mode_change = prev_mode != next_mode;

        self.state = next;
        let now = self.clock.now_ms();
        self.last_activity_ms = now;

        match next {
            State::Aware => {
                info!(target: "orch", "state=aware");
                self.sampler.set_enabled(false);
                self.aggregator.set_enabled(false);
                self.unacked_aggregates = 0;
                if is_mode_change {
                    let _ = self.egress.publish_mode_change("aware", prev_mode);
                } else {
                    let _ = self.egress.publish_awake();
                }
            }
            State::Sampling => {
                info!(target: "orch", "state=sampling");
                self.unacked_aggregates = 0;
                self.sampler.set_enabled(true);
                self.aggregator.set_enabled(true);
                if is_mode_change {
                    let _ = self.egress.publish_mode_change("sampling", prev_mode);
                }
            }
            State::Hibernating => {
                info!(
                    target: "orch",
                    "state=hibernating reason={} duration={}s",
                    self.hibernate_reason.as_str(),
                    self.hibernate_duration_s
                );
                self.sampler.set_enabled(false);
                self.aggregator.set_enabled(false);

                let reason = self.hibernate_reason.as_str();
                if is_mode_change {
                    let _ = self.egress.publish_hibernate_mode_change(
                        prev_mode,
                        reason,
                        self.hibernate_duration_s,
                    );
                } else {
                    let _ = self
                        .egress
                        .publish_hibernating(reason, self.hibernate_duration_s);
                }
            }
        }
    }

    fn handle_event(&mut self, event: DeviceEvent) {
        let now = self.clock.now_ms();
        match event {
            DeviceEvent::Ui(ui) => {
                self.last_activity_ms = now;
                debug!(target: "orch", "ui event {}={}", ui.topic, ui.value);
            }
            DeviceEvent::Worker(_) => {
                self.last_activity_ms = now;
            }
            DeviceEvent::Comms(comms) => match comms {
                CommsEvent::Boot => {
                    self.last_activity_ms = now;
                }
                CommsEvent::NetUp => {
                    info!(target: "orch", "net up");
                    self.last_activity_ms = now;
                }
                CommsEvent::NetDown => {
                    warn!(target: "orch", "net down");
                    self.last_activity_ms = now;
                    self.mqtt_up_ms = None;
                }
                CommsEvent::MqttUp => {
                    info!(target: "orch", "mqtt up");
                    self.last_activity_ms = now;
                    self.mqtt_up_ms = Some(now);
                }
                CommsEvent::MqttDown => {
                    warn!(target: "orch", "mqtt down");
                    self.last_activity_ms = now;
                    self.mqtt_up_ms = None;
                }
                CommsEvent::ServerCommand { topic, payload } => {
                    self.handle_server_command(topic.as_str(), payload.as_str());
                }
                CommsEvent::PublishFailed { .. } => {
                    self.last_activity_ms = now;
                }
                CommsEvent::AggregatePublishAttempted { .. } => {
                    self.last_activity_ms = now;
                    self.unacked_aggregates += 1;
                }
            },
        }
    }

    fn handle_server_command(&mut self, _topic: &str, payload: &str) {
        let Some(command) = protocol::decode_command(payload) else {
            // Malformed input does not count as activity.
            warn!(target: "orch", "bad command json");
            return;
        };
        self.last_activity_ms = self.clock.now_ms();
        self.dispatch_command(command);
    }

    fn dispatch_command(&mut self, command: Command) {
        match command.kind {
            CommandKind::Nudge => {
                // Exists only to reset the inactivity timeout.
            }
            CommandKind::KeepSampling => {
                self.unacked_aggregates = 0;
            }
            CommandKind::StartSampling => {
                let mut patch = Map::new();
                if let Some(period) = command.sampling_interval {
                    patch.insert(
                        "samplePeriodMs".into(),
                        json!(period.max(MIN_SAMPLE_PERIOD_MS)),
                    );
                }
                if let Some(window) = command.agg_period_s {
                    patch.insert("aggPeriodS".into(), json!(window));
                }

                self.session
                    .start_new_session(command.session_id.as_ref().map(|s| s.as_str()));

                if !patch.is_empty() {
                    let _ = self.egress.apply_settings_json(&Value::Object(patch));
                }
                self.enter_state(State::Sampling);
            }
            CommandKind::StopSampling => {
                self.enter_state(State::Aware);
            }
            CommandKind::OneShotSample => {
                self.sampler.request_one_shot();
            }
            CommandKind::GetConfig => {
                let _ = self.egress.publish_config();
            }
            CommandKind::Hibernate => {
                let s = self.settings.snapshot();
                let mut seconds = command.sleep_seconds.unwrap_or(0);
                if seconds == 0 {
                    seconds = s.default_sleep_s;
                }
                seconds = seconds.min(s.max_forced_sleep_s);

                self.hibernate_reason = HibernateReason::Forced;
                self.hibernate_duration_s = seconds;
                self.sleep.request_sleep(RestartReason::Forced, seconds);
                self.enter_state(State::Hibernating);
            }
            CommandKind::ResetBatteryStatistics => {
                self.battery.reset_statistics();
            }
            CommandKind::FactoryReset => {
                if let Err(e) = self.settings.factory_reset() {
                    warn!(target: "orch", "factory reset failed: {e}");
                }
            }
            CommandKind::Unknown => {
                warn!(target: "orch", "unknown command");
            }
        }
    }

    fn check_timeouts(&mut self) {
        let s = self.settings.snapshot();
        let now = self.clock.now_ms();
        let awake = matches!(self.state, State::Aware | State::Sampling);

        // Periodic battery/status report; low-battery detection rides the
        // same gauge read.
        if awake {
            let due = match self.last_status_ms {
                None => true,
                Some(last) => delta_ms(now, last) > s.status_interval_s.saturating_mul(1000),
            };
            if due {
                let snapshot = self.battery.snapshot();
                let mode = mode_str(self.state);
                let _ = self.egress.publish_status(&snapshot, mode);
                self.last_status_ms = Some(now);

                if snapshot.minimum_voltage < s.low_batt_min_v {
                    if self.emergency_armed_at_ms.is_none() {
                        self.emergency_armed_at_ms = Some(now);
                        self.emergency_delay_ms = s.emergency_delay_s.saturating_mul(1000);
                        let _ = self.egress.publish_low_battery_alert(&snapshot, mode);
                        warn!(
                            target: "orch",
                            "low battery armed: min {}V < {}V",
                            snapshot.minimum_voltage, s.low_batt_min_v
                        );
                    }
                } else {
                    self.emergency_armed_at_ms = None;
                }
            }
        }

        // Armed emergency fires regardless of state once the delay elapses.
        if let Some(armed_at) = self.emergency_armed_at_ms {
            if delta_ms(now, armed_at) >= self.emergency_delay_ms {
                warn!(target: "orch", "emergency power save hibernate");
                self.emergency_armed_at_ms = None;
                self.hibernate_reason = HibernateReason::EmergencyPowerSave;
                self.hibernate_duration_s = s.emergency_sleep_s;
                self.sleep
                    .request_sleep(RestartReason::EmergencyPowerSave, s.emergency_sleep_s);
                self.enter_state(State::Hibernating);
                return;
            }
        }

        // Inactivity hibernate.
        if awake && delta_ms(now, self.last_activity_ms) > s.aware_timeout_s.saturating_mul(1000) {
            info!(
                target: "orch",
                "inactivity, hibernating for {} s", s.default_sleep_s
            );
            self.hibernate_reason = HibernateReason::Inactivity;
            self.hibernate_duration_s = s.default_sleep_s;
            self.sleep
                .request_sleep(RestartReason::LowPowerWakeup, s.default_sleep_s);
            self.enter_state(State::Hibernating);
            return;
        }

        // Too many aggregates without a server ack: stop burning power on
        // publishes nobody hears.
        if self.state == State::Sampling && self.unacked_aggregates >= s.max_unacked_packets.max(1)
        {
            warn!(target: "orch", "unacked aggregate limit, back to aware");
            self.enter_state(State::Aware);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{event_stream, mailbox, EventSender, MailboxReceiver};
    use crate::events::{clipped, Aggregate, OrchCommand, OrchCommandKind};
    use crate::hal::BatterySnapshot;
    use crate::settings::MemoryStore;
    use crate::time::FixedClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeGauge {
        snapshot: Arc<Mutex<BatterySnapshot>>,
        resets: Arc<AtomicU32>,
    }

    impl BatteryGauge for FakeGauge {
        fn snapshot(&mut self) -> BatterySnapshot {
            *self.snapshot.lock().unwrap()
        }

        fn reset_statistics(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Rig {
        orch: Orchestrator,
        events: EventSender,
        cmd_rx: MailboxReceiver<OrchCommand>,
        _agg_rx: MailboxReceiver<Aggregate>,
        sampler_gate: ActivityGate,
        sleep: SleepControl,
        clock: Arc<FixedClock>,
        settings: Arc<SettingsManager>,
        session: Arc<SessionClock>,
        battery: Arc<Mutex<BatterySnapshot>>,
        battery_resets: Arc<AtomicU32>,
    }

    fn rig() -> Rig {
        let (events, bus) = event_stream();
        let (cmd_tx, cmd_rx) = mailbox("orch->comms", 16);
        let (agg_tx, agg_rx) = mailbox("agg->comms", 16);
        let egress = CommsEgress::new(cmd_tx, agg_tx);
        let settings = Arc::new(SettingsManager::new(Box::new(MemoryStore::default())));
        let clock = Arc::new(FixedClock::new(50_000));
        let session = Arc::new(SessionClock::new(clock.clone() as Arc<dyn Clock>));
        let sampler_gate = ActivityGate::new();
        let aggregator_gate = ActivityGate::new();
        let sleep = SleepControl::new();
        let battery = Arc::new(Mutex::new(BatterySnapshot {
            voltage: 3.9,
            minimum_voltage: 3.6,
            current: -10.0,
            average_current: -9.0,
        }));
        let battery_resets = Arc::new(AtomicU32::new(0));

        let mut orch = Orchestrator::new(
            bus,
            egress,
            settings.clone(),
            session.clone(),
            sampler_gate.clone(),
            aggregator_gate,
            sleep.clone(),
            Box::new(FakeGauge {
                snapshot: Arc::clone(&battery),
                resets: Arc::clone(&battery_resets),
            }),
            clock.clone() as Arc<dyn Clock>,
            CancelToken::new(),
        );
        orch.start();

        Rig {
            orch,
            events,
            cmd_rx,
            _agg_rx: agg_rx,
            sampler_gate,
            sleep,
            clock,
            settings,
            session,
            battery,
            battery_resets,
        }
    }

    fn server_command(rig: &Rig, json: &str) {
        rig.events
            .publish_comms(CommsEvent::ServerCommand {
                topic: clipped("hastigNode/node1/cmd"),
                payload: clipped(json),
            })
            .unwrap();
    }

    fn drain_cmds(rig: &Rig) -> Vec<OrchCommand> {
        std::iter::from_fn(|| rig.cmd_rx.try_get()).collect()
    }

    #[test]
    fn boots_into_aware_and_publishes_awake() {
        let r = rig();
        assert_eq!(r.orch.state(), State::Aware);
        let cmds = drain_cmds(&r);
        // Same mode at boot: plain awake status, not a mode change.
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].kind, OrchCommandKind::PublishAwake);
        assert!(cmds[0].payload.is_empty());
        assert!(!r.sampler_gate.is_enabled());
    }

    #[test]
    fn start_sampling_with_overrides() {
        let mut r = rig();
        drain_cmds(&r);
        server_command(
            &r,
            r#"{"type":"startSampling","samplingInterval":500,"aggPeriodS":2,"sessionID":"S1"}"#,
        );
        r.orch.tick(10);

        assert_eq!(r.orch.state(), State::Sampling);
        assert!(r.sampler_gate.is_enabled());
        assert_eq!(r.session.session_id().as_str(), "S1");

        let cmds = drain_cmds(&r);
        let patch = cmds
            .iter()
            .find(|c| c.kind == OrchCommandKind::ApplySettingsJson)
            .expect("settings patch sent");
        let doc: Value = serde_json::from_str(patch.payload.as_str()).unwrap();
        assert_eq!(doc["samplePeriodMs"], 500); // 500 >= floor, not clamped
        assert_eq!(doc["aggPeriodS"], 2);

        let mode = cmds
            .iter()
            .find(|c| c.kind == OrchCommandKind::PublishAwake && !c.payload.is_empty())
            .expect("mode change published");
        assert!(mode.payload.contains("modeChange"));
        assert!(mode.payload.contains("sampling"));
    }

    #[test]
    fn sampling_interval_below_floor_is_clamped() {
        let mut r = rig();
        drain_cmds(&r);
        server_command(&r, r#"{"type":"startSampling","samplingInterval":50}"#);
        r.orch.tick(10);
        let cmds = drain_cmds(&r);
        let patch = cmds
            .iter()
            .find(|c| c.kind == OrchCommandKind::ApplySettingsJson)
            .unwrap();
        let doc: Value = serde_json::from_str(patch.payload.as_str()).unwrap();
        assert_eq!(doc["samplePeriodMs"], 200);
    }

    #[test]
    fn start_without_session_id_generates_one() {
        let mut r = rig();
        server_command(&r, r#"{"type":"startSampling"}"#);
        r.orch.tick(10);
        let id = r.session.session_id();
        assert_ne!(id.as_str(), "none");
        assert!(!id.is_empty());
    }

    #[test]
    fn stop_sampling_returns_to_aware_with_mode_change() {
        let mut r = rig();
        server_command(&r, r#"{"type":"startSampling"}"#);
        r.orch.tick(10);
        drain_cmds(&r);

        server_command(&r, r#"{"type":"stopSampling"}"#);
        r.orch.tick(10);
        assert_eq!(r.orch.state(), State::Aware);
        assert!(!r.sampler_gate.is_enabled());

        let cmds = drain_cmds(&r);
        assert!(cmds
            .iter()
            .any(|c| c.payload.contains("modeChange") && c.payload.contains("\"aware\"")));
    }

    #[test]
    fn forced_hibernate_clamps_and_requests_sleep() {
        let mut r = rig();
        drain_cmds(&r);
        server_command(&r, r#"{"type":"hibernate","sleepSeconds":120}"#);
        r.orch.tick(10);

        assert_eq!(r.orch.state(), State::Hibernating);
        let req = r.sleep.peek().expect("sleep requested");
        assert_eq!(req.reason, RestartReason::Forced);
        assert_eq!(req.duration_s, 120);

        let cmds = drain_cmds(&r);
        let hib = cmds
            .iter()
            .find(|c| c.kind == OrchCommandKind::PublishHibernating)
            .expect("hibernating publish");
        let doc: Value = serde_json::from_str(hib.payload.as_str()).unwrap();
        assert_eq!(doc["type"], "modeChange");
        assert_eq!(doc["mode"], "hibernate");
        assert_eq!(doc["reason"], "forced");
        assert_eq!(doc["expectedDuration"], 120);
    }

    #[test]
    fn forced_hibernate_without_seconds_uses_default() {
        let mut r = rig();
        server_command(&r, r#"{"type":"hibernate"}"#);
        r.orch.tick(10);
        let req = r.sleep.peek().unwrap();
        assert_eq!(req.duration_s, 3600);
    }

    #[test]
    fn forced_hibernate_caps_at_max_forced() {
        let mut r = rig();
        r.settings
            .apply_json(r#"{"maxForcedSleepS":600}"#, false)
            .unwrap();
        server_command(&r, r#"{"type":"hibernate","sleepSeconds":9999}"#);
        r.orch.tick(10);
        assert_eq!(r.sleep.peek().unwrap().duration_s, 600);
    }

    #[test]
    fn no_network_gate_fires_exactly_once() {
        let mut r = rig();
        drain_cmds(&r);
        r.clock.advance(MQTT_CONNECT_TIMEOUT_MS + 1000);
        r.orch.tick(0);
        assert_eq!(r.orch.state(), State::Hibernating);
        let req = r.sleep.peek().expect("one sleep request");
        assert_eq!(req.reason, RestartReason::NoNetwork);
        assert_eq!(req.duration_s, NO_NETWORK_HIBERNATE_S);

        // Further ticks do not re-request.
        let taken = r.sleep.begin_transaction().unwrap();
        r.sleep.end_transaction();
        assert_eq!(taken.reason, RestartReason::NoNetwork);
        r.clock.advance(10_000);
        r.orch.tick(0);
        assert!(r.sleep.peek().is_none());
    }

    #[test]
    fn mqtt_up_disarms_no_network_gate() {
        let mut r = rig();
        r.events.publish_comms(CommsEvent::MqttUp).unwrap();
        r.orch.tick(10);
        r.clock.advance(MQTT_CONNECT_TIMEOUT_MS + 60_000);
        // Keep activity fresh so the inactivity timer stays out of the way.
        r.events.publish_comms(CommsEvent::Boot).unwrap();
        r.orch.tick(10);
        assert_eq!(r.orch.state(), State::Aware);
        assert!(r.sleep.peek().is_none());
    }

    #[test]
    fn inactivity_hibernates_with_default_duration() {
        let mut r = rig();
        // Keep the no-network gate out of the way.
        r.events.publish_comms(CommsEvent::MqttUp).unwrap();
        r.orch.tick(10);
        drain_cmds(&r);

        // awareTimeoutS default 600; cross it with no further events.
        r.clock.advance(601_000);
        r.orch.tick(0);

        assert_eq!(r.orch.state(), State::Hibernating);
        let req = r.sleep.peek().unwrap();
        assert_eq!(req.reason, RestartReason::LowPowerWakeup);
        assert_eq!(req.duration_s, 3600);
    }

    #[test]
    fn status_published_on_cadence() {
        let mut r = rig();
        // First timer pass publishes the first status (MqttUp tick).
        r.events.publish_comms(CommsEvent::MqttUp).unwrap();
        r.orch.tick(10);
        let first: Vec<_> = drain_cmds(&r)
            .into_iter()
            .filter(|c| c.payload.contains("batteryVoltage"))
            .collect();
        assert_eq!(first.len(), 1);

        // Within the interval: quiet.
        r.orch.tick(0);
        r.orch.tick(0);
        assert!(drain_cmds(&r)
            .iter()
            .all(|c| !c.payload.contains("batteryVoltage")));

        // statusIntervalS is pinned to 120 on load.
        r.clock.advance(121_000);
        r.orch.tick(0);
        let second: Vec<_> = drain_cmds(&r)
            .into_iter()
            .filter(|c| c.payload.contains("batteryVoltage"))
            .collect();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn low_battery_arms_alerts_then_fires_emergency() {
        let mut r = rig();
        r.events.publish_comms(CommsEvent::MqttUp).unwrap();
        r.orch.tick(10); // first status at healthy battery
        drain_cmds(&r);

        r.battery.lock().unwrap().minimum_voltage = 2.5; // below 2.8 default
        r.clock.advance(121_000);
        r.orch.tick(0); // status read arms the emergency
        let cmds = drain_cmds(&r);
        assert!(cmds.iter().any(|c| c.payload.contains("\"alert\"")));
        assert!(r.sleep.peek().is_none()); // not yet

        // emergencyDelayS default 60.
        r.clock.advance(61_000);
        r.orch.tick(0);
        assert_eq!(r.orch.state(), State::Hibernating);
        let req = r.sleep.peek().unwrap();
        assert_eq!(req.reason, RestartReason::EmergencyPowerSave);
        assert_eq!(req.duration_s, 43_200);
    }

    #[test]
    fn battery_recovery_disarms_emergency() {
        let mut r = rig();
        r.events.publish_comms(CommsEvent::MqttUp).unwrap();
        r.orch.tick(10);

        r.battery.lock().unwrap().minimum_voltage = 2.5;
        r.clock.advance(121_000);
        r.orch.tick(0); // arm

        r.battery.lock().unwrap().minimum_voltage = 3.5;
        r.clock.advance(121_000);
        r.orch.tick(0); // status read disarms before the delay elapses

        r.clock.advance(61_000);
        // Refresh activity so only the emergency path could hibernate.
        r.events.publish_comms(CommsEvent::Boot).unwrap();
        r.orch.tick(10);
        assert_eq!(r.orch.state(), State::Aware);
        assert!(r.sleep.peek().is_none());
    }

    #[test]
    fn unacked_limit_returns_to_aware() {
        let mut r = rig();
        r.events.publish_comms(CommsEvent::MqttUp).unwrap();
        r.orch.tick(10);
        server_command(&r, r#"{"type":"startSampling"}"#);
        r.orch.tick(10);
        assert_eq!(r.orch.state(), State::Sampling);

        // maxUnackedPackets default 10.
        for _ in 0..10 {
            r.events
                .publish_comms(CommsEvent::AggregatePublishAttempted { ok: true })
                .unwrap();
            r.orch.tick(10);
        }
        assert_eq!(r.orch.state(), State::Aware);
    }

    #[test]
    fn keep_sampling_resets_unacked_counter() {
        let mut r = rig();
        r.events.publish_comms(CommsEvent::MqttUp).unwrap();
        r.orch.tick(10);
        server_command(&r, r#"{"type":"startSampling"}"#);
        r.orch.tick(10);

        for _ in 0..9 {
            r.events
                .publish_comms(CommsEvent::AggregatePublishAttempted { ok: true })
                .unwrap();
            r.orch.tick(10);
        }
        assert_eq!(r.orch.state(), State::Sampling);

        server_command(&r, r#"{"type":"keepSampling"}"#);
        r.orch.tick(10);

        for _ in 0..9 {
            r.events
                .publish_comms(CommsEvent::AggregatePublishAttempted { ok: false })
                .unwrap();
            r.orch.tick(10);
        }
        assert_eq!(r.orch.state(), State::Sampling);
    }

    #[test]
    fn malformed_command_does_not_refresh_activity() {
        let mut r = rig();
        r.events.publish_comms(CommsEvent::MqttUp).unwrap();
        r.orch.tick(10);

        r.clock.advance(599_000); // just under the inactivity timeout
        server_command(&r, "{definitely not json");
        r.orch.tick(10);
        r.clock.advance(2_000); // would be saved by a refresh
        r.orch.tick(0);
        assert_eq!(r.orch.state(), State::Hibernating);
    }

    #[test]
    fn reset_battery_statistics_reaches_gauge() {
        let mut r = rig();
        server_command(&r, r#"{"type":"resetBatteryStatistics"}"#);
        r.orch.tick(10);
        assert_eq!(r.battery_resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn factory_reset_restores_defaults() {
        let mut r = rig();
        r.settings
            .apply_json(r#"{"deviceName":"custom"}"#, false)
            .unwrap();
        server_command(&r, r#"{"type":"factoryReset"}"#);
        r.orch.tick(10);
        assert!(r.settings.snapshot().device_name.is_empty());
    }

    #[test]
    fn one_shot_command_pulses_sampler_gate() {
        let mut r = rig();
        server_command(&r, r#"{"type":"oneShotSample"}"#);
        r.orch.tick(10);
        assert!(r.sampler_gate.take_one_shot());
    }
}
