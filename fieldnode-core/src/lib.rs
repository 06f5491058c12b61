//! Fieldnode Core - Control Plane for a Battery-Powered Field Telemetry Node
//!
//! ## Overview
//!
//! Fieldnode Core implements the tightly coupled control plane of a cellular
//! telemetry node: sample an RS485/Modbus-RTU sensor on a cadence, reduce the
//! samples into fixed-duration min/avg/max windows, publish the results over
//! MQTT, and spend the rest of the time in deep standby so a single battery
//! lasts a field season.
//!
//! ## Architecture
//!
//! Five cooperating activities communicate exclusively through bounded typed
//! mailboxes:
//!
//! ```text
//! Sampling ──samples──► Aggregation ──aggregates──► Comms Pump ──► MQTT
//!     ▲                     ▲                            │ ▲
//!     │ enable              │ enable          events ────┘ │ commands
//!     └────────── Orchestrator ◄───────────────────────────┘
//!                      │
//!                      ▼ sleep request
//!                 Power Manager ──► deep standby
//! ```
//!
//! Data flows one way (sampling → aggregation → comms); control flows through
//! the orchestrator, which owns the Aware / Sampling / Hibernating state
//! machine and every hibernate decision. The power manager executes the
//! "sleep transaction": quiesce producers, drain egress during a short grace
//! window, persist the restart reason, and enter standby.
//!
//! ## Design Principles
//!
//! ### 1. Bounded Everything
//! Every mailbox has a fixed depth and a single consumer. A full mailbox is a
//! counted, logged drop - never a stall. Message payloads use inline
//! fixed-capacity strings so nothing in the data path allocates per message.
//!
//! ### 2. Never Block the Pump
//! The cellular driver is only safe from the cooperative main context, so the
//! comms pump is polled (`loop_once`) rather than threaded, and no activity
//! may hold it up for more than a few milliseconds.
//!
//! ### 3. Power Safety First
//! Hibernate is a transaction with a defined order and bounded waits at every
//! step. Activities are cancelled cooperatively - a token checked at every
//! mailbox wait and sleep slice - so a wedged sensor cannot keep the board
//! out of standby.
//!
//! ### 4. Collaborators Behind Traits
//! The modem, MQTT transport, Modbus client, battery gauge, flash store, and
//! standby primitive are trait contracts. Hardware supplies real
//! implementations; tests supply scripted fakes.
//!
//! ## Wrapping Time
//!
//! All timestamps are `u32` milliseconds and every delta is computed with
//! `wrapping_sub`, so behavior across the ~49.7 day rollover is identical on
//! host and target.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod accumulator;
pub mod aggregator;
pub mod bus;
pub mod config;
pub mod context;
pub mod egress;
pub mod events;
pub mod hal;
pub mod link;
pub mod orchestrator;
pub mod power;
pub mod protocol;
pub mod pump;
pub mod sampler;
pub mod sensor;
pub mod settings;
pub mod time;

// Public API
pub use accumulator::AggregateAccumulator;
pub use bus::{BusError, CancelToken, EventBus, EventSender};
pub use context::{NodeDeps, SystemContext};
pub use events::{Aggregate, CommsEvent, DeviceEvent, OrchCommand, Sample, UiEvent, WorkerEvent};
pub use orchestrator::{Orchestrator, State};
pub use power::{PowerManager, RestartReason, SleepControl};
pub use pump::CommsPump;
pub use settings::{Settings, SettingsManager};
pub use time::{Clock, MonotonicClock, SessionClock};

/// Fieldnode Core library version
///
/// Useful for runtime version checks and telemetry
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_exists() {
        assert!(!VERSION.is_empty());
    }
}
