//! Sensor Drivers
//!
//! A sensor is a small `begin`/`sample`/`end` contract selected at runtime
//! from the configured `sensorType`:
//!
//! | type | driver | channels |
//! |------|--------|----------|
//! | 0 | [`FakeSensor`] | cond, temp (synthetic) |
//! | 1 | [`SeametricsCt2x`] | cond, temp over Modbus-RTU |
//! | 2 | [`Pt12Sensor`] | level, temp |
//!
//! Unknown values fall back to the fake driver so a bad config still
//! produces a observable data path in the field.
//!
//! The CT2X driver speaks through a [`ModbusClient`] contract; the RS485
//! transport itself belongs to the board.

use log::{error, info};
use thiserror::Error;

use crate::events::{clipped, KeyString};
use crate::settings::Settings;

/// Sensor subsystem failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SensorError {
    /// Settings reject initialization (baud/address out of range)
    #[error("invalid sensor config: {0}")]
    InvalidConfig(&'static str),
    /// The bus transport failed to initialize
    #[error("sensor transport init failed")]
    TransportInit,
    /// A register read failed or returned garbage
    #[error("sensor read failed")]
    ReadFailed,
    /// `sample` called before a successful `begin`
    #[error("sensor not started")]
    NotStarted,
}

/// Modbus register table selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterTable {
    /// Holding registers (function 0x03)
    Holding,
    /// Input registers (function 0x04)
    Input,
}

/// Modbus-RTU transport contract (external RS485 driver).
pub trait ModbusClient: Send {
    /// Open the serial transport at `baud`.
    fn begin(&mut self, baud: u32) -> Result<(), SensorError>;
    /// Close the serial transport.
    fn end(&mut self);
    /// Read `out.len()` consecutive registers from `start` on unit `unit`.
    fn read_registers(
        &mut self,
        table: RegisterTable,
        unit: u8,
        start: u16,
        out: &mut [u16],
    ) -> Result<(), SensorError>;
}

/// One decoded reading: channel keys and values, plus a quality flag.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// First channel name
    pub k0: KeyString,
    /// First channel value
    pub v0: f32,
    /// Second channel name (empty when single-channel)
    pub k1: KeyString,
    /// Second channel value
    pub v1: f32,
    /// Quality flag
    pub ok: bool,
}

/// Sensor driver contract.
pub trait Sensor: Send {
    /// Driver name for logs.
    fn name(&self) -> &'static str;
    /// Initialize after power/warmup.
    fn begin(&mut self, settings: &Settings) -> Result<(), SensorError>;
    /// Take one reading.
    fn sample(&mut self) -> Result<Reading, SensorError>;
    /// Deinitialize before the rail goes down.
    fn end(&mut self);
}

/// Creates the driver matching the configured `sensorType`.
pub trait SensorFactory: Send {
    /// Build a fresh driver instance for this enable cycle.
    fn create(&mut self, settings: &Settings) -> Box<dyn Sensor>;
}

/// Factory wiring the real driver set: fake, CT2X over an injected Modbus
/// transport, PT12.
pub struct StandardSensorFactory {
    modbus: Box<dyn FnMut() -> Box<dyn ModbusClient> + Send>,
}

impl StandardSensorFactory {
    /// Factory with a builder for fresh Modbus transports.
    pub fn new(modbus: Box<dyn FnMut() -> Box<dyn ModbusClient> + Send>) -> Self {
        Self { modbus }
    }
}

impl SensorFactory for StandardSensorFactory {
    fn create(&mut self, settings: &Settings) -> Box<dyn Sensor> {
        match settings.sensor_type {
            1 => Box::new(SeametricsCt2x::new((self.modbus)())),
            2 => Box::new(Pt12Sensor::default()),
            0 => Box::new(FakeSensor::default()),
            other => {
                error!(target: "sens", "unknown sensor type {other}, using fake");
                Box::new(FakeSensor::default())
            }
        }
    }
}

/// Synthetic conductivity/temperature source for bench bring-up.
#[derive(Debug)]
pub struct FakeSensor {
    rng: u32,
}

impl Default for FakeSensor {
    fn default() -> Self {
        Self { rng: 0x2545_7A2B }
    }
}

impl FakeSensor {
    fn next_u32(&mut self) -> u32 {
        // xorshift; plenty for plausible bench data
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 17;
        self.rng ^= self.rng << 5;
        self.rng
    }

    fn gen_range(&mut self, min: f32, max: f32) -> f32 {
        let unit = (self.next_u32() >> 8) as f32 / 16_777_216.0;
        min + unit * (max - min)
    }
}

impl Sensor for FakeSensor {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn begin(&mut self, _settings: &Settings) -> Result<(), SensorError> {
        Ok(())
    }

    fn sample(&mut self) -> Result<Reading, SensorError> {
        Ok(Reading {
            k0: clipped("cond"),
            v0: self.gen_range(50.0, 500.0),
            k1: clipped("temp"),
            v1: self.gen_range(10.0, 40.0),
            ok: true,
        })
    }

    fn end(&mut self) {}
}

/// Seametrics CT2X conductivity/temperature probe over Modbus-RTU.
pub struct SeametricsCt2x {
    modbus: Box<dyn ModbusClient>,
    unit: u8,
    started: bool,
}

impl SeametricsCt2x {
    /// Telemetry block: temperature then conductivity, two registers each.
    const TELEMETRY_START_REG: u16 = 62_592;
    const TELEMETRY_REG_COUNT: usize = 4;

    /// Driver over the given transport; `begin` opens it.
    pub fn new(modbus: Box<dyn ModbusClient>) -> Self {
        Self {
            modbus,
            unit: 1,
            started: false,
        }
    }

    fn registers_to_f32(hi: u16, lo: u16) -> f32 {
        f32::from_bits(((hi as u32) << 16) | lo as u32)
    }
}

impl Sensor for SeametricsCt2x {
    fn name(&self) -> &'static str {
        "seametricsCT2X"
    }

    fn begin(&mut self, settings: &Settings) -> Result<(), SensorError> {
        if self.started {
            return Ok(());
        }
        if settings.sensor_baud == 0 {
            return Err(SensorError::InvalidConfig("baud is 0"));
        }
        if settings.sensor_addr == 0 || settings.sensor_addr > 247 {
            return Err(SensorError::InvalidConfig("modbus unit out of range"));
        }

        self.modbus.begin(settings.sensor_baud)?;
        self.unit = settings.sensor_addr;
        info!(
            target: "sens",
            "seametrics up: baud={} unit={}",
            settings.sensor_baud, self.unit
        );
        self.started = true;
        Ok(())
    }

    fn sample(&mut self) -> Result<Reading, SensorError> {
        if !self.started {
            return Err(SensorError::NotStarted);
        }

        let mut regs = [0u16; Self::TELEMETRY_REG_COUNT];
        // Some firmware revisions expose the block as holding registers,
        // others as input registers.
        if self
            .modbus
            .read_registers(
                RegisterTable::Holding,
                self.unit,
                Self::TELEMETRY_START_REG,
                &mut regs,
            )
            .is_err()
        {
            self.modbus.read_registers(
                RegisterTable::Input,
                self.unit,
                Self::TELEMETRY_START_REG,
                &mut regs,
            )?;
        }

        let temp = Self::registers_to_f32(regs[0], regs[1]);
        let cond = Self::registers_to_f32(regs[2], regs[3]);
        let ok = cond.is_finite() && temp.is_finite();
        if !ok {
            return Err(SensorError::ReadFailed);
        }

        Ok(Reading {
            k0: clipped("cond"),
            v0: cond,
            k1: clipped("temp"),
            v1: temp,
            ok,
        })
    }

    fn end(&mut self) {
        self.modbus.end();
        self.started = false;
    }
}

/// PT12 pressure/level probe. Driver skeleton pending hardware.
#[derive(Debug, Default)]
pub struct Pt12Sensor;

impl Sensor for Pt12Sensor {
    fn name(&self) -> &'static str {
        "PT12"
    }

    fn begin(&mut self, _settings: &Settings) -> Result<(), SensorError> {
        Ok(())
    }

    fn sample(&mut self) -> Result<Reading, SensorError> {
        Ok(Reading {
            k0: clipped("level"),
            v0: 3.14,
            k1: clipped("temp"),
            v1: 3.14,
            ok: true,
        })
    }

    fn end(&mut self) {}
}
