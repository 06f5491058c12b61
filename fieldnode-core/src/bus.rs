//! Bounded Typed Mailbox Fabric
//!
//! ## Overview
//!
//! All inter-activity communication goes through bounded, typed mailboxes
//! with exactly one consumer each. The contract is deliberately narrow:
//!
//! - **Publish never blocks.** A full mailbox is a [`BusError::Full`] - the
//!   drop is logged at warn level and counted, and the producer moves on.
//!   Samples and aggregates are intentionally lossy under backpressure.
//! - **Consume is single-owner.** Receivers are not cloneable; the slot is
//!   reclaimed when the message is dropped.
//! - **Orchestrator view is prioritized.** [`EventBus::try_get_next`] polls
//!   comms, then worker, then UI. Server commands and network state changes
//!   must preempt UI chatter - the ordering is load-bearing.
//!
//! ## Why Not Blocking Sends
//!
//! A blocking send from the sampler could stall the data path behind a wedged
//! publisher, and a blocking send from the pump would violate the "nothing
//! holds the pump for more than a few ms" rule. Dropping at the producer
//! keeps worst-case latency bounded everywhere.
//!
//! This module also hosts the two small synchronization primitives the
//! activities share: a cooperative [`CancelToken`] and an [`EventFlags`] word
//! used to park disabled activities.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::warn;
use thiserror::Error;

use crate::events::{CommsEvent, DeviceEvent, UiEvent, WorkerEvent};

/// Bus failure modes.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// Destination mailbox had no free slot; the message was dropped.
    #[error("mailbox '{0}' full, message dropped")]
    Full(&'static str),
    /// The consumer side is gone (activity shut down).
    #[error("mailbox '{0}' disconnected")]
    Disconnected(&'static str),
}

/// Producer handle for one mailbox. Cloneable; sends never block.
pub struct MailboxSender<T> {
    name: &'static str,
    tx: Sender<T>,
    dropped: Arc<AtomicU32>,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> MailboxSender<T> {
    /// Publish without blocking. Full mailbox drops the message, counts it,
    /// and warns.
    pub fn publish(&self, msg: T) -> Result<(), BusError> {
        use crossbeam::channel::TrySendError;
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(target: "bus", "mailbox '{}' full, dropping", self.name);
                Err(BusError::Full(self.name))
            }
            Err(TrySendError::Disconnected(_)) => Err(BusError::Disconnected(self.name)),
        }
    }

    /// Messages dropped because the mailbox was full.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer handle for one mailbox. Single owner by construction.
pub struct MailboxReceiver<T> {
    name: &'static str,
    rx: Receiver<T>,
}

impl<T> MailboxReceiver<T> {
    /// Non-blocking receive.
    pub fn try_get(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Receive, waiting at most `timeout_ms`.
    pub fn try_get_for(&self, timeout_ms: u32) -> Option<T> {
        self.rx
            .recv_timeout(Duration::from_millis(timeout_ms as u64))
            .ok()
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Mailbox name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Create a bounded mailbox with a fixed depth.
pub fn mailbox<T>(name: &'static str, depth: usize) -> (MailboxSender<T>, MailboxReceiver<T>) {
    let (tx, rx) = bounded(depth);
    (
        MailboxSender {
            name,
            tx,
            dropped: Arc::new(AtomicU32::new(0)),
        },
        MailboxReceiver { name, rx },
    )
}

/// Cloneable producer side of the orchestrator event stream.
pub struct EventSender {
    comms: MailboxSender<CommsEvent>,
    worker: MailboxSender<WorkerEvent>,
    ui: MailboxSender<UiEvent>,
}

impl Clone for EventSender {
    fn clone(&self) -> Self {
        Self {
            comms: self.comms.clone(),
            worker: self.worker.clone(),
            ui: self.ui.clone(),
        }
    }
}

impl EventSender {
    /// Publish a comms-originated event.
    pub fn publish_comms(&self, evt: CommsEvent) -> Result<(), BusError> {
        self.comms.publish(evt)
    }

    /// Publish a worker telemetry event.
    pub fn publish_worker(&self, evt: WorkerEvent) -> Result<(), BusError> {
        self.worker.publish(evt)
    }

    /// Publish a UI event.
    pub fn publish_ui(&self, evt: UiEvent) -> Result<(), BusError> {
        self.ui.publish(evt)
    }
}

/// Consumer side: the orchestrator's unified, prioritized event stream.
pub struct EventBus {
    comms: MailboxReceiver<CommsEvent>,
    worker: MailboxReceiver<WorkerEvent>,
    ui: MailboxReceiver<UiEvent>,
}

impl EventBus {
    /// Next event in priority order (comms, worker, UI), waiting at most
    /// `timeout_ms` when all three mailboxes are empty.
    pub fn try_get_next(&self, timeout_ms: u32) -> Option<DeviceEvent> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            if let Some(evt) = self.comms.try_get() {
                return Some(DeviceEvent::Comms(evt));
            }
            if let Some(evt) = self.worker.try_get() {
                return Some(DeviceEvent::Worker(evt));
            }
            if let Some(evt) = self.ui.try_get() {
                return Some(DeviceEvent::Ui(evt));
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Build the orchestrator event stream and its producer handle.
pub fn event_stream() -> (EventSender, EventBus) {
    let (comms_tx, comms_rx) = mailbox("comms->orch", crate::config::QUEUE_DEPTH_COMMS_TO_ORCH);
    let (worker_tx, worker_rx) = mailbox("worker->orch", crate::config::QUEUE_DEPTH_WORKER_TO_ORCH);
    let (ui_tx, ui_rx) = mailbox("ui->orch", crate::config::QUEUE_DEPTH_UI_TO_ORCH);
    (
        EventSender {
            comms: comms_tx,
            worker: worker_tx,
            ui: ui_tx,
        },
        EventBus {
            comms: comms_rx,
            worker: worker_rx,
            ui: ui_rx,
        },
    )
}

/// Cooperative cancellation token.
///
/// Activities check it at every mailbox wait and sleep slice; the power
/// manager sets it during the sleep transaction and then waits for the
/// thread to finish.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Event-flag word: set bits wake any waiter; waits clear the bits they
/// consumed.
#[derive(Debug, Default)]
pub struct EventFlags {
    state: Mutex<u32>,
    cond: Condvar,
}

impl EventFlags {
    /// Empty flag word.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `bits` and wake all waiters.
    pub fn set(&self, bits: u32) {
        let mut state = self.state.lock().expect("event flags poisoned");
        *state |= bits;
        self.cond.notify_all();
    }

    /// Clear and return whichever bits in `mask` are currently set, without
    /// waiting.
    pub fn take(&self, mask: u32) -> u32 {
        let mut state = self.state.lock().expect("event flags poisoned");
        let hit = *state & mask;
        *state &= !hit;
        hit
    }

    /// Wait until any bit in `mask` is set or `timeout_ms` elapses. The
    /// satisfied bits are cleared and returned (0 on timeout).
    pub fn wait_any_timeout(&self, mask: u32, timeout_ms: u32) -> u32 {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut state = self.state.lock().expect("event flags poisoned");
        loop {
            let hit = *state & mask;
            if hit != 0 {
                *state &= !hit;
                return hit;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let (next, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .expect("event flags poisoned");
            state = next;
        }
    }
}

/// Enable/disable gate shared between an activity and its controllers.
///
/// `set_enabled` flips the flag and pulses the wake bit so a parked activity
/// re-evaluates immediately.
#[derive(Clone, Debug)]
pub struct ActivityGate {
    inner: Arc<GateInner>,
}

#[derive(Debug)]
struct GateInner {
    enabled: AtomicBool,
    flags: EventFlags,
}

/// Wake bit: enable state changed.
pub const FLAG_WAKE: u32 = 1 << 0;
/// Wake bit: one-shot work requested.
pub const FLAG_ONE_SHOT: u32 = 1 << 1;

impl ActivityGate {
    /// New gate, disabled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                enabled: AtomicBool::new(false),
                flags: EventFlags::new(),
            }),
        }
    }

    /// Enable or disable the activity and wake it.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        self.inner.flags.set(FLAG_WAKE);
    }

    /// Current enable state.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Request one cycle of work regardless of the enable state.
    pub fn request_one_shot(&self) {
        self.inner.flags.set(FLAG_ONE_SHOT);
    }

    /// Park until woken or `timeout_ms` elapses; returns the consumed bits.
    pub fn wait(&self, timeout_ms: u32) -> u32 {
        self.inner
            .flags
            .wait_any_timeout(FLAG_WAKE | FLAG_ONE_SHOT, timeout_ms)
    }

    /// Consume a pending one-shot request without waiting.
    pub fn take_one_shot(&self) -> bool {
        self.inner.flags.take(FLAG_ONE_SHOT) != 0
    }
}

impl Default for ActivityGate {
    fn default() -> Self {
        Self::new()
    }
}
