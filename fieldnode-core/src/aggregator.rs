//! Aggregation Activity
//!
//! Drives the [`AggregateAccumulator`] by wall clock: snapshot the window
//! length on enable, fold samples as they arrive, and emit when the window
//! elapses. Windows are wall-clock bounded, not sample-count bounded - a
//! 15 s window at a 1 s period yields n close to 15, and missed samples
//! shrink `n` without stretching the window.
//!
//! The mailbox wait is capped at 50 ms so window-boundary latency (and
//! cancellation latency) stays bounded.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::accumulator::AggregateAccumulator;
use crate::bus::{ActivityGate, CancelToken, EventSender, MailboxReceiver};
use crate::config::AGG_POLL_MS;
use crate::egress::CommsEgress;
use crate::events::{Sample, WorkerEvent, WorkerEventKind};
use crate::settings::SettingsManager;
use crate::time::{delta_ms, Clock, SessionClock};

/// The aggregation activity. Construct, then hand to a thread via
/// [`run`](Self::run).
pub struct Aggregator {
    samples: MailboxReceiver<Sample>,
    egress: CommsEgress,
    events: EventSender,
    settings: Arc<SettingsManager>,
    session: Arc<SessionClock>,
    clock: Arc<dyn Clock>,
    gate: ActivityGate,
    cancel: CancelToken,
}

impl Aggregator {
    /// Wire up the activity.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        samples: MailboxReceiver<Sample>,
        egress: CommsEgress,
        events: EventSender,
        settings: Arc<SettingsManager>,
        session: Arc<SessionClock>,
        clock: Arc<dyn Clock>,
        gate: ActivityGate,
        cancel: CancelToken,
    ) -> Self {
        Self {
            samples,
            egress,
            events,
            settings,
            session,
            clock,
            gate,
            cancel,
        }
    }

    /// Activity main loop; returns when cancelled.
    pub fn run(self) {
        info!(target: "agg", "aggregation activity started");
        while !self.cancel.is_cancelled() {
            if !self.gate.is_enabled() {
                self.gate.wait(100);
                continue;
            }
            self.window();
        }
        info!(target: "agg", "aggregation activity stopped");
    }

    /// One aggregation window: fold until the window elapses or the
    /// activity is disabled, then emit and forward.
    fn window(&self) {
        let settings = self.settings.snapshot();
        let window_ms = settings.agg_period_s.saturating_mul(1000);

        let mut acc = AggregateAccumulator::new(self.session.rel_ms());
        let start_wall = self.clock.now_ms();

        while self.gate.is_enabled() && !self.cancel.is_cancelled() {
            if let Some(sample) = self.samples.try_get_for(AGG_POLL_MS) {
                debug!(target: "agg", "consumed sample t={}", sample.rel_ms);
                acc.add(&sample);
            }
            if delta_ms(self.clock.now_ms(), start_wall) >= window_ms {
                break;
            }
        }

        // An empty window (sensor down, just enabled) starts over right away.
        let Some(aggregate) = acc.emit() else {
            return;
        };

        if self.egress.send_aggregate(&aggregate).is_err() {
            warn!(target: "agg", "aggregate dropped: egress full");
            return;
        }

        info!(
            target: "agg",
            "aggregate {}/{} n={} ok={}",
            aggregate.k0, aggregate.k1, aggregate.n, aggregate.ok
        );

        let _ = self.events.publish_worker(WorkerEvent {
            kind: WorkerEventKind::AggregateReady,
            ts_ms: self.clock.now_ms(),
            rel_ms: aggregate.rel_end_ms,
            n: aggregate.n,
            ok: aggregate.ok,
        });
    }
}
