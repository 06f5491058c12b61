//! Shared scripted collaborators for integration and scenario tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use fieldnode_core::hal::{BatteryGauge, BatterySnapshot, SensorRail, Standby, WakeConfig};
use fieldnode_core::link::{CellularModem, Inbound, LinkError, MqttLink, MqttSessionConfig, NetConfig};
use fieldnode_core::power::{RestartReason, RestartReasonStore};
use fieldnode_core::sensor::{Reading, Sensor, SensorError, SensorFactory};
use fieldnode_core::settings::Settings;

/// Modem that attaches instantly (optionally failing the next N attempts).
#[derive(Default)]
pub struct ModemState {
    pub up: bool,
    pub fail_next: u32,
    pub attempts: u32,
    pub resets: u32,
    pub ended: u32,
}

pub struct FakeModem(pub Arc<Mutex<ModemState>>);

impl CellularModem for FakeModem {
    fn bring_up(&mut self, _cfg: &NetConfig) -> Result<(), LinkError> {
        let mut st = self.0.lock().unwrap();
        st.attempts += 1;
        if st.fail_next > 0 {
            st.fail_next -= 1;
            return Err(LinkError::Attach);
        }
        st.up = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.0.lock().unwrap().resets += 1;
    }

    fn end(&mut self) {
        let mut st = self.0.lock().unwrap();
        st.ended += 1;
        st.up = false;
    }

    fn is_up(&self) -> bool {
        self.0.lock().unwrap().up
    }
}

/// Broker-in-a-box: records publishes, scripts inbound traffic.
#[derive(Default)]
pub struct MqttState {
    pub connected: bool,
    pub connect_fail_next: u32,
    pub stalled: bool,
    pub subs: Vec<String>,
    pub published: Vec<(String, Vec<u8>)>,
    pub inbound: VecDeque<Inbound>,
    pub disconnects: u32,
    pub transport_stops: u32,
}

pub struct FakeMqtt(pub Arc<Mutex<MqttState>>);

impl MqttLink for FakeMqtt {
    fn connect(&mut self, _cfg: &MqttSessionConfig) -> Result<(), LinkError> {
        let mut st = self.0.lock().unwrap();
        if st.connect_fail_next > 0 {
            st.connect_fail_next -= 1;
            return Err(LinkError::Connect);
        }
        st.connected = true;
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        self.0.lock().unwrap().subs.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        let mut st = self.0.lock().unwrap();
        if !st.connected || st.stalled {
            return Err(LinkError::NotConnected);
        }
        st.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<Inbound>, LinkError> {
        Ok(self.0.lock().unwrap().inbound.pop_front())
    }

    fn connected(&self) -> bool {
        let st = self.0.lock().unwrap();
        st.connected && !st.stalled
    }

    fn disconnect(&mut self) {
        let mut st = self.0.lock().unwrap();
        st.disconnects += 1;
        st.connected = false;
    }

    fn stop_transport(&mut self) {
        let mut st = self.0.lock().unwrap();
        st.transport_stops += 1;
        st.connected = false;
    }
}

/// Gauge with a scriptable snapshot.
pub struct FakeGauge {
    pub snapshot: Arc<Mutex<BatterySnapshot>>,
    pub resets: Arc<AtomicU32>,
}

impl FakeGauge {
    pub fn healthy() -> (Self, Arc<Mutex<BatterySnapshot>>) {
        let snapshot = Arc::new(Mutex::new(BatterySnapshot {
            voltage: 3.9,
            minimum_voltage: 3.6,
            current: -10.0,
            average_current: -9.0,
        }));
        (
            Self {
                snapshot: Arc::clone(&snapshot),
                resets: Arc::new(AtomicU32::new(0)),
            },
            snapshot,
        )
    }
}

impl BatteryGauge for FakeGauge {
    fn snapshot(&mut self) -> BatterySnapshot {
        *self.snapshot.lock().unwrap()
    }

    fn reset_statistics(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Rail that remembers its state.
pub struct FakeRail(pub Arc<Mutex<bool>>);

impl SensorRail for FakeRail {
    fn set_power(&mut self, on: bool) {
        *self.0.lock().unwrap() = on;
    }
}

/// Standby primitive that records the armed wake config instead of
/// sleeping.
pub struct FakeStandby(pub Arc<Mutex<Option<WakeConfig>>>);

impl Standby for FakeStandby {
    fn enter(&mut self, wake: &WakeConfig) {
        *self.0.lock().unwrap() = Some(*wake);
    }
}

/// Restart reason store observable from the test.
pub struct SharedReasonStore(pub Arc<Mutex<RestartReason>>);

impl RestartReasonStore for SharedReasonStore {
    fn read(&self) -> RestartReason {
        *self.0.lock().unwrap()
    }

    fn write(&mut self, reason: RestartReason) {
        *self.0.lock().unwrap() = reason;
    }
}

/// Sensor producing a fixed ramp of conductivity values.
pub struct RampSensor {
    pub next: f32,
    pub step: f32,
}

impl Sensor for RampSensor {
    fn name(&self) -> &'static str {
        "ramp"
    }

    fn begin(&mut self, _s: &Settings) -> Result<(), SensorError> {
        Ok(())
    }

    fn sample(&mut self) -> Result<Reading, SensorError> {
        let v = self.next;
        self.next += self.step;
        Ok(Reading {
            k0: fieldnode_core::events::clipped("cond"),
            v0: v,
            k1: fieldnode_core::events::clipped("temp"),
            v1: 20.0,
            ok: true,
        })
    }

    fn end(&mut self) {}
}

/// Factory handing out ramp sensors.
pub struct RampFactory {
    pub start: f32,
    pub step: f32,
}

impl SensorFactory for RampFactory {
    fn create(&mut self, _s: &Settings) -> Box<dyn Sensor> {
        Box::new(RampSensor {
            next: self.start,
            step: self.step,
        })
    }
}
