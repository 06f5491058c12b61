//! Sampling Activity
//!
//! Single-threaded actor that powers the sensor rail, warms the probe up,
//! polls it on the configured cadence, and feeds the data path. Driven by an
//! event-flag word: a wake bit (enable state changed) and a one-shot bit
//! (single powered sample requested outside a session).
//!
//! ## Power Discipline
//!
//! The rail is only on while a cycle runs. Disable (or cancellation) drains
//! to a safe point: `sensor.end()`, driver dropped, rail off. A failed
//! `begin` powers the rail back off and retries on the next enable.
//!
//! ## One-Shot Behavior
//!
//! One-shot requests are serialized on this activity. While continuous
//! sampling runs, a pending one-shot is satisfied by routing the next
//! successful reading to the one-shot mailbox as well, so it neither
//! disturbs the cadence nor waits for the session to end.

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::bus::{ActivityGate, CancelToken, EventSender, MailboxSender, FLAG_ONE_SHOT};
use crate::config::MIN_SAMPLE_PERIOD_MS;
use crate::events::{Sample, WorkerEvent, WorkerEventKind};
use crate::sensor::SensorFactory;
use crate::settings::SettingsManager;
use crate::time::{Clock, SessionClock};

/// The sampling activity. Construct, then hand to a thread via
/// [`run`](Self::run).
pub struct Sampler {
    out: MailboxSender<Sample>,
    one_shot_out: MailboxSender<Sample>,
    events: EventSender,
    settings: Arc<SettingsManager>,
    session: Arc<SessionClock>,
    clock: Arc<dyn Clock>,
    gate: ActivityGate,
    cancel: CancelToken,
    factory: Box<dyn SensorFactory>,
    rail: Box<dyn crate::hal::SensorRail>,
}

impl Sampler {
    /// Wire up the activity.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        out: MailboxSender<Sample>,
        one_shot_out: MailboxSender<Sample>,
        events: EventSender,
        settings: Arc<SettingsManager>,
        session: Arc<SessionClock>,
        clock: Arc<dyn Clock>,
        gate: ActivityGate,
        cancel: CancelToken,
        factory: Box<dyn SensorFactory>,
        rail: Box<dyn crate::hal::SensorRail>,
    ) -> Self {
        Self {
            out,
            one_shot_out,
            events,
            settings,
            session,
            clock,
            gate,
            cancel,
            factory,
            rail,
        }
    }

    /// Activity main loop; returns when cancelled.
    pub fn run(mut self) {
        info!(target: "sens", "sampling activity started");
        while !self.cancel.is_cancelled() {
            let fired = self.gate.wait(100);
            let one_shot = fired & FLAG_ONE_SHOT != 0;
            if !self.gate.is_enabled() && !one_shot {
                continue;
            }
            self.cycle(one_shot);
        }
        info!(target: "sens", "sampling activity stopped");
    }

    /// One powered cycle: rail up, warmup, begin, poll until disabled (or
    /// once for a one-shot), end, rail down.
    fn cycle(&mut self, one_shot_only: bool) {
        let settings = self.settings.snapshot();

        self.rail.set_power(true);
        self.sleep_sliced(settings.sensor_warmup_ms, true);
        if self.cancel.is_cancelled() {
            self.rail.set_power(false);
            return;
        }

        info!(target: "sens", "creating sensor type={}", settings.sensor_type);
        let mut sensor = self.factory.create(&settings);
        if let Err(e) = sensor.begin(&settings) {
            error!(target: "sens", "sensor begin failed ({}): {e}", sensor.name());
            sensor.end();
            self.rail.set_power(false);
            return;
        }

        let period_ms = settings.sample_period_ms.max(MIN_SAMPLE_PERIOD_MS);

        let mut one_shot_pending = one_shot_only;
        while (self.gate.is_enabled() || one_shot_pending) && !self.cancel.is_cancelled() {
            // A one-shot arriving mid-session piggybacks on the next reading.
            one_shot_pending = one_shot_pending || self.gate.take_one_shot();

            let rel_ms = self.session.rel_ms();
            match sensor.sample() {
                Ok(reading) => {
                    let sample = Sample {
                        rel_ms,
                        k0: reading.k0,
                        v0: reading.v0,
                        k1: reading.k1,
                        v1: reading.v1,
                        ok: reading.ok,
                    };
                    debug!(
                        target: "sens",
                        "sample t={} {}={:.2} {}={:.2} ok={}",
                        sample.rel_ms, sample.k0, sample.v0, sample.k1, sample.v1, sample.ok
                    );

                    if one_shot_pending {
                        let _ = self.one_shot_out.publish(sample.clone());
                        one_shot_pending = false;
                    }
                    let published = if one_shot_only {
                        true // the one-shot mailbox was the destination
                    } else {
                        self.out.publish(sample.clone()).is_ok()
                    };
                    if published {
                        let _ = self.events.publish_worker(WorkerEvent {
                            kind: WorkerEventKind::SampleTaken,
                            ts_ms: self.clock.now_ms(),
                            rel_ms,
                            n: 1,
                            ok: sample.ok,
                        });
                    }
                }
                Err(e) => warn!(target: "sens", "sample failed: {e}"),
            }

            if one_shot_only {
                break;
            }
            self.sleep_sliced(period_ms, false);
        }

        sensor.end();
        self.rail.set_power(false);
    }

    /// Sleep in short slices so cancellation (and, unless `ignore_disable`,
    /// a disable) takes effect promptly.
    fn sleep_sliced(&self, total_ms: u32, ignore_disable: bool) {
        let mut remaining = total_ms;
        while remaining > 0 {
            if self.cancel.is_cancelled() {
                return;
            }
            if !ignore_disable && !self.gate.is_enabled() {
                return;
            }
            let slice = remaining.min(50);
            self.clock.sleep_ms(slice);
            remaining -= slice;
        }
    }
}
