//! System Context: One-Shot Wiring of the Whole Node
//!
//! Construct every mailbox and service in one place, hand each activity
//! exactly what it needs, and spawn the threads. There are no globals - the
//! context owns the pump and the power manager (both main-context-only), and
//! everything else lives on its own thread behind a handle.
//!
//! A typical firmware entry point:
//!
//! ```ignore
//! let mut ctx = SystemContext::start(deps);
//! ctx.run_main_loop(); // returns only if standby failed
//! ```

use std::sync::Arc;

use log::info;

use crate::bus::{event_stream, mailbox, ActivityGate, CancelToken, EventSender};
use crate::config::{
    ORCH_TICK_MS, QUEUE_DEPTH_AGG_TO_COMMS, QUEUE_DEPTH_ONE_SHOT, QUEUE_DEPTH_ORCH_TO_COMMS,
    QUEUE_DEPTH_SENSOR_TO_AGG,
};
use crate::aggregator::Aggregator;
use crate::egress::CommsEgress;
use crate::hal::{BatteryGauge, SensorRail, Standby};
use crate::link::{CellularModem, MqttLink};
use crate::orchestrator::Orchestrator;
use crate::power::{ActivityHandle, ActivitySet, PowerManager, RestartReason, RestartReasonStore, SleepControl};
use crate::pump::CommsPump;
use crate::sampler::Sampler;
use crate::sensor::SensorFactory;
use crate::settings::{SettingsManager, SettingsStore};
use crate::time::{Clock, SessionClock};

/// Everything the board and environment must supply.
pub struct NodeDeps {
    /// Monotonic clock
    pub clock: Arc<dyn Clock>,
    /// Cellular modem driver
    pub modem: Box<dyn CellularModem>,
    /// MQTT client implementation
    pub mqtt: Box<dyn MqttLink>,
    /// Sensor driver factory
    pub sensor_factory: Box<dyn SensorFactory>,
    /// Sensor/RS485 power rail
    pub rail: Box<dyn SensorRail>,
    /// Battery gauge
    pub battery: Box<dyn BatteryGauge>,
    /// Settings persistence
    pub settings_store: Box<dyn SettingsStore>,
    /// Restart reason persistence
    pub reason_store: Box<dyn RestartReasonStore>,
    /// Deep-standby primitive
    pub standby: Box<dyn Standby>,
    /// Stable hardware-derived hex id
    pub hardware_id: String,
    /// GPIO wake pin
    pub wake_pin: u8,
}

/// The running node: main-context services plus activity handles.
pub struct SystemContext {
    /// Shared settings owner
    pub settings: Arc<SettingsManager>,
    /// Session reference time and id
    pub session: Arc<SessionClock>,
    /// Producer handle for UI (and other embedder) events
    pub events: EventSender,
    /// Sleep request handle
    pub sleep: SleepControl,
    /// The comms pump; poll from the main loop only
    pub pump: CommsPump,
    /// The power manager; service from the main loop only
    pub power: PowerManager,
    /// Activity threads and producer gates
    pub activities: ActivitySet,
    clock: Arc<dyn Clock>,
}

impl SystemContext {
    /// Wire everything and spawn the activities. The pump is initialized
    /// and wants a connection when this returns.
    pub fn start(deps: NodeDeps) -> Self {
        let NodeDeps {
            clock,
            modem,
            mqtt,
            sensor_factory,
            rail,
            battery,
            settings_store,
            mut reason_store,
            standby,
            hardware_id,
            wake_pin,
        } = deps;

        let settings = Arc::new(SettingsManager::new(settings_store));
        let session = Arc::new(SessionClock::new(clock.clone()));

        // Until a controlled hibernate says otherwise, the next boot is an
        // unexpected one.
        reason_store.write(RestartReason::UnexpectedReboot);

        let (sample_tx, sample_rx) = mailbox("sensor->agg", QUEUE_DEPTH_SENSOR_TO_AGG);
        let (one_shot_tx, one_shot_rx) = mailbox("one-shot", QUEUE_DEPTH_ONE_SHOT);
        let (agg_tx, agg_rx) = mailbox("agg->comms", QUEUE_DEPTH_AGG_TO_COMMS);
        let (cmd_tx, cmd_rx) = mailbox("orch->comms", QUEUE_DEPTH_ORCH_TO_COMMS);
        let (events, event_bus) = event_stream();
        let egress = CommsEgress::new(cmd_tx, agg_tx);

        let sampler_gate = ActivityGate::new();
        let aggregator_gate = ActivityGate::new();

        let mut pump = CommsPump::new(
            cmd_rx,
            agg_rx,
            one_shot_rx,
            events.clone(),
            settings.clone(),
            clock.clone(),
            modem,
            mqtt,
            hardware_id,
        );
        pump.begin();

        let power = PowerManager::new(reason_store, standby, clock.clone(), wake_pin);
        let sleep = power.sleep_control();

        let sampler_cancel = CancelToken::new();
        let sampler = Sampler::new(
            sample_tx,
            one_shot_tx,
            events.clone(),
            settings.clone(),
            session.clone(),
            clock.clone(),
            sampler_gate.clone(),
            sampler_cancel.clone(),
            sensor_factory,
            rail,
        );
        let sampler_join = std::thread::Builder::new()
            .name("sens".into())
            .spawn(move || sampler.run())
            .expect("spawn sampling activity");

        let aggregator_cancel = CancelToken::new();
        let aggregator = Aggregator::new(
            sample_rx,
            egress.clone(),
            events.clone(),
            settings.clone(),
            session.clone(),
            clock.clone(),
            aggregator_gate.clone(),
            aggregator_cancel.clone(),
        );
        let aggregator_join = std::thread::Builder::new()
            .name("agg".into())
            .spawn(move || aggregator.run())
            .expect("spawn aggregation activity");

        let orchestrator_cancel = CancelToken::new();
        let orchestrator = Orchestrator::new(
            event_bus,
            egress,
            settings.clone(),
            session.clone(),
            sampler_gate.clone(),
            aggregator_gate.clone(),
            sleep.clone(),
            battery,
            clock.clone(),
            orchestrator_cancel.clone(),
        );
        let orchestrator_join = std::thread::Builder::new()
            .name("orch".into())
            .spawn(move || orchestrator.run())
            .expect("spawn orchestrator");

        info!(target: "node", "startup complete");

        Self {
            settings,
            session,
            events,
            sleep,
            pump,
            power,
            activities: ActivitySet {
                ui: None,
                orchestrator: Some(ActivityHandle::new(
                    "orchestrator",
                    orchestrator_cancel,
                    orchestrator_join,
                )),
                aggregator: Some(ActivityHandle::new(
                    "aggregator",
                    aggregator_cancel,
                    aggregator_join,
                )),
                sampler: Some(ActivityHandle::new("sampler", sampler_cancel, sampler_join)),
                sampler_gate,
                aggregator_gate,
            },
            clock,
        }
    }

    /// Cooperative main loop: pump comms, service sleep requests, pace at
    /// ~20 ms. Returns only if a standby attempt failed.
    pub fn run_main_loop(&mut self) {
        loop {
            self.pump.loop_once();
            if self.power.service(&mut self.pump, &mut self.activities) {
                return;
            }
            self.clock.sleep_ms(ORCH_TICK_MS);
        }
    }

    /// One main-loop iteration without pacing (test harness hook).
    pub fn main_loop_once(&mut self) -> bool {
        self.pump.loop_once();
        self.power.service(&mut self.pump, &mut self.activities)
    }
}
