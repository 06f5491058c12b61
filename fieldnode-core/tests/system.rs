//! Whole-node integration: SystemContext wiring, from inbound command to
//! deep standby.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::*;
use fieldnode_core::context::{NodeDeps, SystemContext};
use fieldnode_core::link::Inbound;
use fieldnode_core::power::RestartReason;
use fieldnode_core::settings::MemoryStore;
use fieldnode_core::time::{Clock, FixedClock, MonotonicClock};

const HW_ID: &str = "00DEADBEEF00";

struct World {
    ctx: SystemContext,
    mqtt: Arc<Mutex<MqttState>>,
    modem: Arc<Mutex<ModemState>>,
    standby: Arc<Mutex<Option<fieldnode_core::hal::WakeConfig>>>,
    reason: Arc<Mutex<RestartReason>>,
    rail: Arc<Mutex<bool>>,
}

/// A frozen clock keeps the hibernate-path tests instant; the data-path
/// test runs on real time so the sampler paces itself.
fn world_with_clock(clock: Arc<dyn Clock>) -> World {
    let mqtt = Arc::new(Mutex::new(MqttState::default()));
    let modem = Arc::new(Mutex::new(ModemState::default()));
    let standby = Arc::new(Mutex::new(None));
    let reason = Arc::new(Mutex::new(RestartReason::BrownOut));
    let rail = Arc::new(Mutex::new(false));
    let (gauge, _battery) = FakeGauge::healthy();

    let ctx = SystemContext::start(NodeDeps {
        clock,
        modem: Box::new(FakeModem(Arc::clone(&modem))),
        mqtt: Box::new(FakeMqtt(Arc::clone(&mqtt))),
        sensor_factory: Box::new(RampFactory {
            start: 100.0,
            step: 1.0,
        }),
        rail: Box::new(FakeRail(Arc::clone(&rail))),
        battery: Box::new(gauge),
        settings_store: Box::new(MemoryStore::default()),
        reason_store: Box::new(SharedReasonStore(Arc::clone(&reason))),
        standby: Box::new(FakeStandby(Arc::clone(&standby))),
        hardware_id: HW_ID.into(),
        wake_pin: 0,
    });

    World {
        ctx,
        mqtt,
        modem,
        standby,
        reason,
        rail,
    }
}

fn world() -> World {
    world_with_clock(Arc::new(FixedClock::new(250_000)))
}

fn inject_command(w: &World, payload: &str) {
    w.mqtt.lock().unwrap().inbound.push_back(Inbound {
        topic: format!("hastigNode/{HW_ID}/cmd"),
        payload: payload.as_bytes().to_vec(),
    });
}

#[test]
fn startup_bootstraps_restart_reason_and_connects() {
    let mut w = world();
    assert_eq!(*w.reason.lock().unwrap(), RestartReason::UnexpectedReboot);

    assert!(!w.ctx.main_loop_once());
    assert!(w.ctx.pump.mqtt_connected());
    assert!(w.modem.lock().unwrap().up);

    // Shut the activities down so the world tears down promptly.
    w.ctx.sleep.request_sleep(RestartReason::Forced, 60);
    while !w.ctx.main_loop_once() {}
}

#[test]
fn server_hibernate_drives_node_into_standby() {
    let mut w = world();
    assert!(!w.ctx.main_loop_once()); // link up

    inject_command(&w, r#"{"type":"hibernate","sleepSeconds":300}"#);

    // Keep the main loop turning while the orchestrator thread picks the
    // command up and arms the sleep transaction.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut slept = false;
    while Instant::now() < deadline {
        if w.ctx.main_loop_once() {
            slept = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(slept, "sleep transaction never ran");

    // Standby armed with the requested duration; reason persisted.
    let wake = w.standby.lock().unwrap().expect("standby entered");
    assert_eq!(wake.duration_s, 300);
    assert_eq!(*w.reason.lock().unwrap(), RestartReason::Forced);

    // The final hibernating status made it out before teardown.
    let docs: Vec<serde_json::Value> = w
        .mqtt
        .lock()
        .unwrap()
        .published
        .iter()
        .map(|(_, p)| serde_json::from_slice(p).unwrap())
        .collect();
    assert!(docs
        .iter()
        .any(|d| d["type"] == "modeChange" && d["mode"] == "hibernate"));

    // Hibernate-safe teardown and a cold sensor rail.
    assert_eq!(w.mqtt.lock().unwrap().disconnects, 0);
    assert_eq!(w.modem.lock().unwrap().ended, 0);
    assert!(!*w.rail.lock().unwrap());
}

#[test]
fn start_sampling_produces_data_on_the_wire() {
    // Real time here: the sampler paces itself off this clock.
    let mut w = world_with_clock(Arc::new(MonotonicClock::new()));
    assert!(!w.ctx.main_loop_once());

    // Short cadence so the window closes quickly.
    w.ctx
        .settings
        .apply_json(r#"{"sensorWarmupMs":50,"samplePeriodMs":200,"aggPeriodS":1}"#, false)
        .unwrap();

    inject_command(&w, r#"{"type":"startSampling","sessionID":"FIELD-7"}"#);

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut saw_data = false;
    while Instant::now() < deadline && !saw_data {
        let _ = w.ctx.main_loop_once();
        saw_data = w
            .mqtt
            .lock()
            .unwrap()
            .published
            .iter()
            .any(|(t, _)| t.ends_with("/data"));
        std::thread::sleep(Duration::from_millis(20));
    }

    assert!(saw_data, "no aggregate reached the broker");
    assert_eq!(w.ctx.session.session_id().as_str(), "FIELD-7");
    assert!(w.ctx.activities.sampler_gate.is_enabled());

    // Wind the world down.
    w.ctx.sleep.request_sleep(RestartReason::Forced, 60);
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if w.ctx.main_loop_once() {
            break;
        }
    }
}
