//! Power Manager: the Sleep Transaction
//!
//! ## Overview
//!
//! The orchestrator *requests* sleep; the main context *executes* it. The
//! transaction runs from the cooperative main loop (the only place the
//! cellular stack may be touched) in a fixed order:
//!
//! 1. Block new comms connects (`prepare_hibernate`).
//! 2. Grace window (1500 ms) pumping `loop_once` so the final `hibernating`
//!    status and queued publishes egress.
//! 3. Disable the sample/aggregate producers.
//! 4. Stop activity threads: UI, orchestrator, aggregation, sampling -
//!    cooperative cancel, then a bounded wait for each.
//! 5. Final comms teardown without a modem END.
//! 6. Persist the restart reason (written even if step 4 was partial).
//! 7. Flush the console and enter deep standby with wake-on-pin and the RTC
//!    alarm armed. Control does not return on success.
//!
//! ## One-Shot Arming
//!
//! Duplicate `request_sleep` calls while one is pending or in progress are
//! ignored - the transaction runs once, with the parameters of the first
//! accepted request. Durations are clamped to [5 s, 12 h].

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::bus::{ActivityGate, CancelToken};
use crate::config::{HIBERNATE_STATUS_GRACE_MS, MAX_SLEEP_S, MIN_SLEEP_S, THREAD_STOP_WAIT_MS};
use crate::hal::{Standby, WakeConfig};
use crate::pump::CommsPump;
use crate::time::{delta_ms, Clock};

/// Why the node restarted, persisted across standby in backup-domain
/// storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RestartReason {
    /// Power-on or watchdog without a controlled hibernate
    UnexpectedReboot = 1,
    /// Ordinary scheduled or inactivity hibernate
    LowPowerWakeup = 2,
    /// Gave up waiting for the network
    NoNetwork = 3,
    /// Server-commanded hibernate
    Forced = 4,
    /// Battery dropped below the emergency threshold
    EmergencyPowerSave = 5,
    /// Brown-out detector tripped
    BrownOut = 6,
}

impl RestartReason {
    /// Stored 32-bit code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Decode a stored code; unknown values read as `UnexpectedReboot`.
    pub fn from_code(code: u32) -> Self {
        match code {
            2 => RestartReason::LowPowerWakeup,
            3 => RestartReason::NoNetwork,
            4 => RestartReason::Forced,
            5 => RestartReason::EmergencyPowerSave,
            6 => RestartReason::BrownOut,
            _ => RestartReason::UnexpectedReboot,
        }
    }
}

/// Backup-domain restart reason storage.
pub trait RestartReasonStore: Send {
    /// Last stored reason.
    fn read(&self) -> RestartReason;
    /// Persist a reason.
    fn write(&mut self, reason: RestartReason);
}

/// Volatile store for hosts without backup registers (and for tests).
#[derive(Debug)]
pub struct RamReasonStore {
    reason: RestartReason,
}

impl Default for RamReasonStore {
    fn default() -> Self {
        Self {
            reason: RestartReason::UnexpectedReboot,
        }
    }
}

impl RestartReasonStore for RamReasonStore {
    fn read(&self) -> RestartReason {
        self.reason
    }

    fn write(&mut self, reason: RestartReason) {
        self.reason = reason;
    }
}

/// An accepted sleep request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepRequest {
    /// Reason to persist before standby
    pub reason: RestartReason,
    /// Standby duration, already clamped
    pub duration_s: u32,
}

#[derive(Debug, Default)]
struct SleepInner {
    pending: Mutex<Option<SleepRequest>>,
    in_progress: AtomicBool,
}

/// Cheap cloneable handle for requesting sleep and observing the
/// transaction state.
#[derive(Debug, Clone, Default)]
pub struct SleepControl {
    inner: Arc<SleepInner>,
}

impl SleepControl {
    /// Fresh control with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a sleep request. Ignored while another request is pending or a
    /// transaction is in progress; the duration is clamped to [5 s, 12 h].
    pub fn request_sleep(&self, reason: RestartReason, duration_s: u32) {
        if self.inner.in_progress.load(Ordering::SeqCst) {
            return;
        }
        let mut pending = self.inner.pending.lock().expect("sleep control poisoned");
        if pending.is_some() {
            return;
        }
        *pending = Some(SleepRequest {
            reason,
            duration_s: duration_s.clamp(MIN_SLEEP_S, MAX_SLEEP_S),
        });
    }

    /// The pending request, if any, without consuming it.
    pub fn peek(&self) -> Option<SleepRequest> {
        *self.inner.pending.lock().expect("sleep control poisoned")
    }

    /// Claim the pending request and mark the transaction in progress.
    pub fn begin_transaction(&self) -> Option<SleepRequest> {
        let request = self
            .inner
            .pending
            .lock()
            .expect("sleep control poisoned")
            .take()?;
        self.inner.in_progress.store(true, Ordering::SeqCst);
        Some(request)
    }

    /// Mark the transaction finished (only reachable when standby failed).
    pub fn end_transaction(&self) {
        self.inner.in_progress.store(false, Ordering::SeqCst);
    }

    /// True while the sleep transaction is executing.
    pub fn is_in_progress(&self) -> bool {
        self.inner.in_progress.load(Ordering::SeqCst)
    }
}

/// A spawned activity: its cancellation token and join handle.
pub struct ActivityHandle {
    name: &'static str,
    cancel: CancelToken,
    join: Option<JoinHandle<()>>,
}

impl ActivityHandle {
    /// Track a spawned activity.
    pub fn new(name: &'static str, cancel: CancelToken, join: JoinHandle<()>) -> Self {
        Self {
            name,
            cancel,
            join: Some(join),
        }
    }

    /// Cancel the activity and wait up to `wait_ms` for it to finish.
    /// Best effort: a thread that does not come down in time is left
    /// detached and reported.
    pub fn stop(&mut self, wait_ms: u32) {
        self.cancel.cancel();
        let Some(join) = self.join.take() else {
            return;
        };

        let deadline = Instant::now() + Duration::from_millis(wait_ms as u64);
        while Instant::now() < deadline {
            if join.is_finished() {
                let _ = join.join();
                info!(target: "power", "{} stopped", self.name);
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        warn!(target: "power", "{} still running after {wait_ms} ms", self.name);
    }
}

/// The activity threads and producer gates the sleep transaction quiesces.
pub struct ActivitySet {
    /// UI activity, when the board has one
    pub ui: Option<ActivityHandle>,
    /// Orchestrator activity
    pub orchestrator: Option<ActivityHandle>,
    /// Aggregation activity
    pub aggregator: Option<ActivityHandle>,
    /// Sampling activity
    pub sampler: Option<ActivityHandle>,
    /// Sampling producer gate
    pub sampler_gate: ActivityGate,
    /// Aggregation producer gate
    pub aggregator_gate: ActivityGate,
}

/// Executes the sleep transaction from the cooperative main context.
pub struct PowerManager {
    sleep: SleepControl,
    reason_store: Box<dyn RestartReasonStore>,
    standby: Box<dyn Standby>,
    clock: Arc<dyn Clock>,
    wake_pin: u8,
}

impl PowerManager {
    /// Wire up the manager. `reason_store` should already have been
    /// bootstrapped with `UnexpectedReboot` at startup.
    pub fn new(
        reason_store: Box<dyn RestartReasonStore>,
        standby: Box<dyn Standby>,
        clock: Arc<dyn Clock>,
        wake_pin: u8,
    ) -> Self {
        Self {
            sleep: SleepControl::new(),
            reason_store,
            standby,
            clock,
            wake_pin,
        }
    }

    /// Handle for requesting sleep (given to the orchestrator).
    pub fn sleep_control(&self) -> SleepControl {
        self.sleep.clone()
    }

    /// Called frequently from the main loop. Runs the sleep transaction
    /// when one is armed; returns true when a request was handled (control
    /// only comes back here when standby failed).
    pub fn service(&mut self, comms: &mut CommsPump, activities: &mut ActivitySet) -> bool {
        let Some(request) = self.sleep.begin_transaction() else {
            return false;
        };

        info!(
            target: "power",
            "sleep requested: reason={:?} duration={} s", request.reason, request.duration_s
        );

        // 1. No new connects; keep the established session for the flush.
        comms.prepare_hibernate();

        // 2. Grace window: let the final status and queued publishes out.
        let grace_start = self.clock.now_ms();
        while delta_ms(self.clock.now_ms(), grace_start) < HIBERNATE_STATUS_GRACE_MS {
            comms.loop_once();
            self.clock.sleep_ms(20);
        }

        // 3. Producers first, so nothing refills the mailboxes.
        info!(target: "power", "sleep step: disable producers");
        activities.sampler_gate.set_enabled(false);
        activities.aggregator_gate.set_enabled(false);

        // 4. Activity threads, in order.
        info!(target: "power", "sleep step: stop activities");
        for handle in [
            activities.ui.as_mut(),
            activities.orchestrator.as_mut(),
            activities.aggregator.as_mut(),
            activities.sampler.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            handle.stop(THREAD_STOP_WAIT_MS);
        }

        // 5. Final teardown; the rails are about to be cut, skip the modem END.
        info!(target: "power", "sleep step: shutdown comms");
        comms.shutdown_for_hibernate();

        // 6. Reason goes to backup storage even if an activity hung above.
        info!(target: "power", "sleep step: persist restart reason");
        self.reason_store.write(request.reason);

        // 7. Standby. On hardware this does not return.
        info!(
            target: "power",
            "sleep step: entering standby for {} s", request.duration_s
        );
        let _ = std::io::stdout().flush();
        self.standby.enter(&WakeConfig {
            wake_pin: self.wake_pin,
            duration_s: request.duration_s,
        });

        error!(target: "power", "returned from standby");
        self.sleep.end_transaction();
        true
    }
}
