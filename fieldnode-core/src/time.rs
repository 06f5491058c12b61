//! Time Sources and the Session Clock
//!
//! ## Overview
//!
//! The node has no battery-backed RTC and no wall-clock sync; everything runs
//! on monotonic uptime. Timestamps are `u32` milliseconds, which wrap after
//! ~49.7 days - every consumer computes deltas with [`delta_ms`] /
//! `wrapping_sub` so a rollover mid-deployment is a non-event.
//!
//! ## Time Sources
//!
//! [`Clock`] abstracts "now" plus a sleep primitive:
//!
//! - [`MonotonicClock`]: host/target uptime, the production source
//! - [`FixedClock`]: manually advanced, for deterministic tests; its
//!   `sleep_ms` advances the clock instead of stalling the test
//!
//! ## Session Time
//!
//! Published data is stamped relative to the start of the current sampling
//! session, not to boot. [`SessionClock`] owns that reference point and the
//! session id: the server may hand one down with `startSampling`, otherwise a
//! local pseudo-random hex id is generated. Ids are diagnostic labels, not
//! secrets - the generator is a hash mix, not a CSPRNG.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::events::{clipped, SessionIdString};

/// Milliseconds of uptime, wrapping at `u32::MAX`.
pub type Millis = u32;

/// Wrapping delta between two uptime stamps (`now - earlier`).
#[inline]
pub fn delta_ms(now: Millis, earlier: Millis) -> u32 {
    now.wrapping_sub(earlier)
}

/// Monotonic time source with a cooperative sleep primitive.
pub trait Clock: Send + Sync {
    /// Current uptime in milliseconds (wrapping).
    fn now_ms(&self) -> Millis;

    /// Sleep for `ms`. Test clocks advance time instead of blocking.
    fn sleep_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Production clock backed by [`Instant`], truncated to wrapping `u32`.
#[derive(Debug)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    /// Clock whose zero is the moment of construction.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> Millis {
        self.start.elapsed().as_millis() as Millis
    }
}

/// Manually driven clock for tests.
///
/// `sleep_ms` advances time, so code paths that pace themselves with the
/// clock run instantly under test while still observing the passage of time.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicU32,
}

impl FixedClock {
    /// Clock starting at `start_ms`.
    pub fn new(start_ms: Millis) -> Self {
        Self {
            now: AtomicU32::new(start_ms),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, ms: Millis) {
        self.now.store(ms, Ordering::SeqCst);
    }

    /// Advance by `ms` (wrapping).
    pub fn advance(&self, ms: u32) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u32) {
        self.advance(ms);
    }
}

/// 32-bit hash mix for local session id generation.
fn mix32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

/// Process-wide entropy counter so back-to-back sessions differ even with a
/// frozen test clock.
static SESSION_NONCE: AtomicU32 = AtomicU32::new(0x1234_5678);

struct SessionState {
    ref_ms: Millis,
    session_id: SessionIdString,
}

/// Session reference time plus session id, shared across activities.
pub struct SessionClock {
    clock: std::sync::Arc<dyn Clock>,
    state: Mutex<SessionState>,
}

impl SessionClock {
    /// New session clock; reference is "now", id is `"none"` until the first
    /// session starts.
    pub fn new(clock: std::sync::Arc<dyn Clock>) -> Self {
        let ref_ms = clock.now_ms();
        Self {
            clock,
            state: Mutex::new(SessionState {
                ref_ms,
                session_id: clipped("none"),
            }),
        }
    }

    /// Start a new session: reset the reference time and adopt the server's
    /// id, or generate a local one when none is given.
    pub fn start_new_session(&self, server_id: Option<&str>) {
        let mut st = self.state.lock().expect("session clock poisoned");
        st.ref_ms = self.clock.now_ms();
        st.session_id = match server_id {
            Some(id) if !id.is_empty() => clipped(id),
            _ => Self::generate_local_id(st.ref_ms),
        };
    }

    /// Current session id.
    pub fn session_id(&self) -> SessionIdString {
        self.state
            .lock()
            .expect("session clock poisoned")
            .session_id
            .clone()
    }

    /// Milliseconds since the session reference (wrapping).
    pub fn rel_ms(&self) -> u32 {
        let st = self.state.lock().expect("session clock poisoned");
        delta_ms(self.clock.now_ms(), st.ref_ms)
    }

    fn generate_local_id(seed_ms: u32) -> SessionIdString {
        let nonce = SESSION_NONCE.fetch_add(0x9e37_79b9, Ordering::Relaxed);
        let a = mix32(seed_ms ^ nonce);
        let b = mix32(a ^ 0x1234_5678);
        let c = mix32(b ^ nonce.rotate_left(13));
        let d = mix32(c ^ a);
        let id = format!("{a:08x}-{b:08x}-{c:08x}-{d:08x}");
        clipped(&id)
    }
}
