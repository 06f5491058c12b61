//! Board Collaborator Contracts
//!
//! The control plane never touches hardware directly; the board supplies
//! implementations of these traits. Policy stays out of here - a gauge reads
//! the battery, it does not decide when to hibernate.

/// Point-in-time battery gauge reading.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatterySnapshot {
    /// Cell voltage (V)
    pub voltage: f32,
    /// Lowest voltage seen since the statistics were last reset (V)
    pub minimum_voltage: f32,
    /// Instantaneous current (mA, negative when discharging)
    pub current: f32,
    /// Averaged current (mA)
    pub average_current: f32,
}

/// PMIC battery gauge.
pub trait BatteryGauge: Send {
    /// Read the current gauge values.
    fn snapshot(&mut self) -> BatterySnapshot;
    /// Clear the tracked min/max statistics.
    fn reset_statistics(&mut self);
}

/// External sensor/RS485 power rail.
pub trait SensorRail: Send {
    /// Switch the rail on or off.
    fn set_power(&mut self, on: bool);
}

/// Wake sources armed before standby.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeConfig {
    /// GPIO wake pin (pulled up, active-low)
    pub wake_pin: u8,
    /// RTC alarm offset in seconds (already clamped to [5 s, 12 h])
    pub duration_s: u32,
}

/// Deep-standby primitive.
///
/// `enter` cuts peripheral rails, arms wake-on-pin and the RTC alarm, and
/// enters standby. On real hardware control does not return; if it does, the
/// caller treats it as a failed transition.
pub trait Standby: Send {
    /// Enter deep standby with the given wake sources armed.
    fn enter(&mut self, wake: &WakeConfig);
}
