//! Node Settings: Snapshot Store, JSON Patching, Flash Persistence
//!
//! ## Overview
//!
//! Settings are read-mostly. Readers take a value snapshot
//! ([`SettingsManager::snapshot`]) so a publish or aggregation cycle never
//! races a concurrent patch; writers hold the internal mutex across the patch
//! and the flash save so persisted state matches RAM.
//!
//! ## Persistence Format
//!
//! The blob written to the backing store is:
//!
//! ```text
//! [ magic: u32 LE = 0x53455453 ][ crc32: u32 LE ][ JSON settings payload ]
//! ```
//!
//! The CRC covers exactly the payload bytes. A missing blob, wrong magic, or
//! CRC mismatch falls back to defaults (and the node is marked unpersisted
//! until the next successful save). The store is read as an explicit byte
//! block and validated - never aliased in place.
//!
//! ## Inbound Patches
//!
//! `cfg` topic payloads are partial patches: known keys are applied with
//! type checking, unknown keys are ignored, and `samplePeriodMs` is clamped
//! to the 200 ms floor on every write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::config::MIN_SAMPLE_PERIOD_MS;

/// Magic marker leading the persisted blob (`"SETS"`).
pub const SETTINGS_MAGIC: u32 = 0x5345_5453;

/// Settings subsystem failures.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Patch payload was not valid JSON.
    #[error("settings patch is not valid JSON: {0}")]
    BadPatch(#[from] serde_json::Error),
    /// The backing store rejected the write.
    #[error("settings store write failed: {0}")]
    StoreWrite(String),
}

/// Byte-blob persistence contract (flash sector, file, RAM in tests).
pub trait SettingsStore: Send {
    /// Read the whole stored blob, or `None` when nothing was ever saved.
    fn load(&mut self) -> Option<Vec<u8>>;
    /// Replace the stored blob.
    fn save(&mut self, blob: &[u8]) -> Result<(), SettingsError>;
}

/// In-memory store: default for tests and hosts without flash.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blob: Option<Vec<u8>>,
}

impl SettingsStore for MemoryStore {
    fn load(&mut self) -> Option<Vec<u8>> {
        self.blob.clone()
    }

    fn save(&mut self, blob: &[u8]) -> Result<(), SettingsError> {
        self.blob = Some(blob.to_vec());
        Ok(())
    }
}

/// All persisted node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Blob schema version
    pub version: u32,

    /// Modbus slave address of the sensor
    pub sensor_addr: u8,
    /// RS485 baud rate
    pub sensor_baud: u32,
    /// Rail-on to first-poll delay
    pub sensor_warmup_ms: u32,
    /// Driver selector: 0 fake, 1 Seametrics CT2X, 2 PT12
    pub sensor_type: u32,

    /// Sampling cadence (floor 200 ms)
    pub sample_period_ms: u32,
    /// Aggregation window length
    pub agg_period_s: u32,

    /// SIM PIN
    pub sim_pin: String,
    /// Cellular APN
    pub apn: String,
    /// APN username
    pub apn_user: String,
    /// APN password
    pub apn_pass: String,

    /// MQTT broker host
    pub mqtt_host: String,
    /// MQTT broker port
    pub mqtt_port: u16,
    /// MQTT username
    pub mqtt_user: String,
    /// MQTT password
    pub mqtt_pass: String,
    /// MQTT client identifier
    pub mqtt_client_id: String,

    /// Human-readable node name; topic id when non-empty
    pub device_name: String,

    /// Inactivity window before hibernating
    pub aware_timeout_s: u32,
    /// Hibernate duration when none is specified
    pub default_sleep_s: u32,
    /// Status publish cadence
    pub status_interval_s: u32,
    /// Low-battery threshold (minimum cell voltage)
    pub low_batt_min_v: f32,
    /// Charger current limit (mA)
    pub max_charging_current: u16,
    /// Charger voltage limit (V)
    pub max_charging_voltage: f32,
    /// Delay between low-battery alert and emergency hibernate
    pub emergency_delay_s: u32,
    /// Emergency hibernate duration
    pub emergency_sleep_s: u32,
    /// Cap applied to server-requested hibernate durations
    pub max_forced_sleep_s: u32,
    /// Unacked aggregate publishes tolerated before leaving Sampling
    pub max_unacked_packets: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: 1,
            sensor_addr: 1,
            sensor_baud: 9600,
            sensor_warmup_ms: 4000,
            sensor_type: 1,
            sample_period_ms: 1000,
            agg_period_s: 15,
            sim_pin: "0000".into(),
            apn: "telenor.smart".into(),
            apn_user: String::new(),
            apn_pass: String::new(),
            mqtt_host: "mqtt.vamotech.no".into(),
            mqtt_port: 1883,
            mqtt_user: "guest".into(),
            mqtt_pass: "guest".into(),
            mqtt_client_id: "FieldnodeClient".into(),
            device_name: String::new(),
            aware_timeout_s: 600,
            default_sleep_s: 3600,
            status_interval_s: 120,
            low_batt_min_v: 2.8,
            max_charging_current: 1000,
            max_charging_voltage: 3.64,
            emergency_delay_s: 60,
            emergency_sleep_s: 43_200,
            max_forced_sleep_s: 43_200,
            max_unacked_packets: 10,
        }
    }
}

/// Sections of the published configuration snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSection {
    /// Everything in one object
    All,
    /// APN and SIM credentials
    Network,
    /// Broker coordinates and credentials
    Mqtt,
    /// Node name and sensor wiring
    Device,
    /// Sampling, aggregation, and status cadences
    Schedule,
    /// Battery thresholds and sleep caps
    Power,
}

fn mask_if_set(v: &str) -> &str {
    if v.is_empty() {
        ""
    } else {
        "***"
    }
}

impl Settings {
    /// Masked key/value view of one section, for the config snapshot.
    /// Secrets (`simPin`, `apnUser`, `apnPass`, `mqttUser`, `mqttPass`)
    /// appear as `"***"` when set.
    pub fn masked_fields(&self, section: ConfigSection) -> Map<String, Value> {
        let mut out = Map::new();

        let network = |out: &mut Map<String, Value>| {
            out.insert("apn".into(), json!(self.apn));
            out.insert("simPin".into(), json!(mask_if_set(&self.sim_pin)));
            out.insert("apnUser".into(), json!(mask_if_set(&self.apn_user)));
            out.insert("apnPass".into(), json!(mask_if_set(&self.apn_pass)));
        };
        let mqtt = |out: &mut Map<String, Value>| {
            out.insert("mqttHost".into(), json!(self.mqtt_host));
            out.insert("mqttPort".into(), json!(self.mqtt_port));
            out.insert("mqttClientId".into(), json!(self.mqtt_client_id));
            out.insert("mqttUser".into(), json!(mask_if_set(&self.mqtt_user)));
            out.insert("mqttPass".into(), json!(mask_if_set(&self.mqtt_pass)));
        };
        let device = |out: &mut Map<String, Value>| {
            out.insert("deviceName".into(), json!(self.device_name));
            out.insert("sensorAddress".into(), json!(self.sensor_addr));
            out.insert("sensorBaudrate".into(), json!(self.sensor_baud));
            out.insert("sensorWarmupMs".into(), json!(self.sensor_warmup_ms));
            out.insert("sensorType".into(), json!(self.sensor_type));
        };
        let schedule = |out: &mut Map<String, Value>| {
            out.insert("samplePeriodMs".into(), json!(self.sample_period_ms));
            out.insert("aggPeriodS".into(), json!(self.agg_period_s));
            out.insert("awareTimeoutS".into(), json!(self.aware_timeout_s));
            out.insert("defaultSleepS".into(), json!(self.default_sleep_s));
            out.insert("statusIntervalS".into(), json!(self.status_interval_s));
        };
        let power = |out: &mut Map<String, Value>| {
            out.insert(
                "lowBattMinV".into(),
                crate::protocol::json_f32(self.low_batt_min_v),
            );
            out.insert("maxChargingCurrent".into(), json!(self.max_charging_current));
            out.insert(
                "maxChargingVoltage".into(),
                crate::protocol::json_f32(self.max_charging_voltage),
            );
            out.insert("emergencyDelayS".into(), json!(self.emergency_delay_s));
            out.insert("emergencySleepS".into(), json!(self.emergency_sleep_s));
            out.insert("maxForcedSleepS".into(), json!(self.max_forced_sleep_s));
            out.insert("maxUnackedPackets".into(), json!(self.max_unacked_packets));
        };

        match section {
            ConfigSection::All => {
                network(&mut out);
                mqtt(&mut out);
                device(&mut out);
                schedule(&mut out);
                power(&mut out);
            }
            ConfigSection::Network => network(&mut out),
            ConfigSection::Mqtt => mqtt(&mut out),
            ConfigSection::Device => device(&mut out),
            ConfigSection::Schedule => schedule(&mut out),
            ConfigSection::Power => power(&mut out),
        }
        out
    }
}

/// Reflected CRC-32 (poly 0xEDB88320) over the settings payload.
fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

fn encode_blob(settings: &Settings) -> Vec<u8> {
    let payload = serde_json::to_vec(settings).expect("settings serialize cannot fail");
    let mut blob = Vec::with_capacity(8 + payload.len());
    blob.extend_from_slice(&SETTINGS_MAGIC.to_le_bytes());
    blob.extend_from_slice(&crc32(&payload).to_le_bytes());
    blob.extend_from_slice(&payload);
    blob
}

fn decode_blob(blob: &[u8]) -> Option<Settings> {
    if blob.len() < 8 {
        return None;
    }
    let magic = u32::from_le_bytes(blob[0..4].try_into().ok()?);
    if magic != SETTINGS_MAGIC {
        return None;
    }
    let stored_crc = u32::from_le_bytes(blob[4..8].try_into().ok()?);
    let payload = &blob[8..];
    if crc32(payload) != stored_crc {
        return None;
    }
    serde_json::from_slice(payload).ok()
}

/// Thread-safe settings owner with snapshot reads and persisted writes.
pub struct SettingsManager {
    current: Mutex<Settings>,
    store: Mutex<Box<dyn SettingsStore>>,
    persisted: AtomicBool,
}

impl SettingsManager {
    /// Load from the store, falling back to defaults on a missing or invalid
    /// blob, then apply the load-time sanity clamps.
    pub fn new(store: Box<dyn SettingsStore>) -> Self {
        let mut store = store;
        let (mut settings, persisted) = match store.load().and_then(|b| decode_blob(&b)) {
            Some(s) => (s, true),
            None => {
                warn!(target: "settings", "no valid stored settings, using defaults");
                (Settings::default(), false)
            }
        };

        // Sanity clamps, also covering blobs written by older firmware.
        if settings.aware_timeout_s < 60 {
            settings.aware_timeout_s = 600;
        }
        if settings.default_sleep_s < 60 {
            settings.default_sleep_s = 3600;
        }
        // Status cadence is pinned for backend consumption stability.
        settings.status_interval_s = 120;
        if settings.sample_period_ms < MIN_SAMPLE_PERIOD_MS {
            settings.sample_period_ms = MIN_SAMPLE_PERIOD_MS;
        }

        info!(
            target: "settings",
            "loaded: apn={} mqtt={}:{} sample_ms={} agg_s={}",
            settings.apn, settings.mqtt_host, settings.mqtt_port,
            settings.sample_period_ms, settings.agg_period_s
        );

        let manager = Self {
            current: Mutex::new(settings),
            store: Mutex::new(store),
            persisted: AtomicBool::new(persisted),
        };
        if !persisted {
            // Best effort: defaults land in flash on first boot.
            if manager.save().is_err() {
                warn!(target: "settings", "initial save failed, running unpersisted");
            }
        }
        manager
    }

    /// Value snapshot of the current settings.
    pub fn snapshot(&self) -> Settings {
        self.current.lock().expect("settings poisoned").clone()
    }

    /// True when the current settings match the backing store.
    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::Relaxed)
    }

    /// Apply a partial JSON patch. Unknown keys are ignored; known keys are
    /// type-checked and clamped. With `persist`, the result is saved while
    /// the patch lock is still held.
    pub fn apply_json(&self, patch: &str, persist: bool) -> Result<(), SettingsError> {
        let doc: Value = serde_json::from_str(patch)?;
        let obj = match doc.as_object() {
            Some(obj) => obj,
            None => {
                warn!(target: "settings", "patch is not a JSON object");
                return Ok(());
            }
        };

        {
            let mut s = self.current.lock().expect("settings poisoned");
            apply_patch(&mut s, obj);
        }

        if persist {
            self.save()?;
        }
        Ok(())
    }

    /// Persist the current settings to the backing store.
    pub fn save(&self) -> Result<(), SettingsError> {
        let blob = {
            let s = self.current.lock().expect("settings poisoned");
            encode_blob(&s)
        };
        let mut store = self.store.lock().expect("settings store poisoned");
        match store.save(&blob) {
            Ok(()) => {
                self.persisted.store(true, Ordering::Relaxed);
                info!(target: "settings", "saved ({} bytes)", blob.len());
                Ok(())
            }
            Err(e) => {
                self.persisted.store(false, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Restore factory defaults and persist them.
    pub fn factory_reset(&self) -> Result<(), SettingsError> {
        {
            let mut s = self.current.lock().expect("settings poisoned");
            *s = Settings::default();
        }
        self.save()
    }

    /// Masked view of one config section from a consistent snapshot.
    pub fn masked_fields(&self, section: ConfigSection) -> Map<String, Value> {
        self.snapshot().masked_fields(section)
    }
}

fn set_u32(dst: &mut u32, v: &Value) {
    if let Some(n) = v.as_u64() {
        if n <= u32::MAX as u64 {
            *dst = n as u32;
        }
    }
}

fn set_string(dst: &mut String, v: &Value) {
    if let Some(s) = v.as_str() {
        *dst = s.to_string();
    }
}

fn apply_patch(s: &mut Settings, obj: &Map<String, Value>) {
    for (key, v) in obj {
        match key.as_str() {
            "sensorAddress" => {
                if let Some(n) = v.as_u64() {
                    if n <= u8::MAX as u64 {
                        s.sensor_addr = n as u8;
                    }
                }
            }
            "sensorBaudrate" => set_u32(&mut s.sensor_baud, v),
            "sensorWarmupMs" => set_u32(&mut s.sensor_warmup_ms, v),
            "sensorType" => set_u32(&mut s.sensor_type, v),
            "samplePeriodMs" => {
                set_u32(&mut s.sample_period_ms, v);
                if s.sample_period_ms < MIN_SAMPLE_PERIOD_MS {
                    s.sample_period_ms = MIN_SAMPLE_PERIOD_MS;
                }
            }
            "aggPeriodS" => set_u32(&mut s.agg_period_s, v),
            "simPin" => set_string(&mut s.sim_pin, v),
            "apn" => set_string(&mut s.apn, v),
            "apnUser" => set_string(&mut s.apn_user, v),
            "apnPass" => set_string(&mut s.apn_pass, v),
            "mqttHost" => set_string(&mut s.mqtt_host, v),
            "mqttPort" => {
                if let Some(n) = v.as_u64() {
                    if n <= u16::MAX as u64 {
                        s.mqtt_port = n as u16;
                    }
                }
            }
            "mqttUser" => set_string(&mut s.mqtt_user, v),
            "mqttPass" => set_string(&mut s.mqtt_pass, v),
            "mqttClientId" => set_string(&mut s.mqtt_client_id, v),
            "deviceName" => set_string(&mut s.device_name, v),
            "awareTimeoutS" => set_u32(&mut s.aware_timeout_s, v),
            "defaultSleepS" => set_u32(&mut s.default_sleep_s, v),
            "statusIntervalS" => set_u32(&mut s.status_interval_s, v),
            "lowBattMinV" => {
                if let Some(f) = v.as_f64() {
                    s.low_batt_min_v = f as f32;
                }
            }
            "maxChargingCurrent" => {
                if let Some(n) = v.as_u64() {
                    if n <= u16::MAX as u64 {
                        s.max_charging_current = n as u16;
                    }
                }
            }
            "maxChargingVoltage" => {
                if let Some(f) = v.as_f64() {
                    s.max_charging_voltage = f as f32;
                }
            }
            "emergencyDelayS" => set_u32(&mut s.emergency_delay_s, v),
            "emergencySleepS" => set_u32(&mut s.emergency_sleep_s, v),
            "maxForcedSleepS" => set_u32(&mut s.max_forced_sleep_s, v),
            "maxUnackedPackets" => set_u32(&mut s.max_unacked_packets, v),
            _ => {} // unknown keys ignored
        }
    }
}
