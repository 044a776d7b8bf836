//! # Rate Gate
//!
//! A token-bucket throttle that limits how many documents a bulk job may touch
//! per time unit (one second in practice).
//!
//! ## Discrete Refill
//!
//! The bucket refills to full capacity at each time-unit boundary. It does not
//! leak continuously:
//!
//! ```text
//! capacity = 3, time unit = 1s
//!
//! t=0.0s  ███  take 3 → empty
//! t=0.5s       nothing refilled
//! t=1.0s  ███  full again; a burst of 3 is allowed right at the boundary
//! ```
//!
//! A job throttled to K ops/s therefore runs in bursts of K at each second
//! boundary. That is intended: the first burst is free, so M documents take at
//! least ⌈M/K⌉ - 1 seconds.
//!
//! ## Two Ways to Acquire
//!
//! - [`RateGate::try_acquire`] never blocks. Merged commands call it on the
//!   writer thread, before every document, and stop when it says no.
//! - [`RateGate::wait_to_proceed`] / [`RateGate::acquire_timeout`] sleep until
//!   the next refill. The orchestrator calls them between resubmissions, off
//!   the writer thread.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Token-bucket throttle with a full refill at every time-unit boundary.
#[derive(Debug)]
pub struct RateGate {
    occurrences: u32,
    time_unit: Duration,
    state: Mutex<GateState>,
}

#[derive(Debug)]
struct GateState {
    /// Permits left in the current window.
    available: u32,
    /// When the current window ends and the bucket refills.
    window_end: Instant,
}

impl RateGate {
    /// Creates a gate allowing `occurrences` permits per `time_unit`.
    ///
    /// The bucket starts full.
    ///
    /// # Errors
    ///
    /// `Error::InvalidConfiguration` if either argument is zero.
    pub fn new(occurrences: u32, time_unit: Duration) -> Result<Self> {
        if occurrences == 0 {
            return Err(Error::InvalidConfiguration(
                "rate gate occurrences must be positive".into(),
            ));
        }
        if time_unit.is_zero() {
            return Err(Error::InvalidConfiguration(
                "rate gate time unit must be positive".into(),
            ));
        }

        Ok(Self {
            occurrences,
            time_unit,
            state: Mutex::new(GateState {
                available: occurrences,
                window_end: Instant::now() + time_unit,
            }),
        })
    }

    /// Creates a gate allowing `occurrences` permits per second.
    pub fn per_second(occurrences: u32) -> Result<Self> {
        Self::new(occurrences, Duration::from_secs(1))
    }

    /// Permits granted per time unit.
    pub fn occurrences(&self) -> u32 {
        self.occurrences
    }

    /// Permits left in the current window.
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.available
    }

    /// Takes a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.take_or_next_refill(Instant::now()).is_ok()
    }

    /// Waits until a permit is available, then takes it.
    pub async fn wait_to_proceed(&self) {
        loop {
            match self.take_or_next_refill(Instant::now()) {
                Ok(()) => return,
                Err(refill_at) => tokio::time::sleep_until(refill_at).await,
            }
        }
    }

    /// Waits up to `timeout` for a permit.
    ///
    /// Returns `true` if a permit was taken. A zero timeout behaves like
    /// [`RateGate::try_acquire`].
    pub async fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            match self.take_or_next_refill(Instant::now()) {
                Ok(()) => return true,
                Err(refill_at) if refill_at <= deadline => {
                    tokio::time::sleep_until(refill_at).await
                }
                Err(_) => {
                    tokio::time::sleep_until(deadline).await;
                    return self.try_acquire();
                }
            }
        }
    }

    /// Takes a permit, or returns when the next refill happens.
    fn take_or_next_refill(&self, now: Instant) -> std::result::Result<(), Instant> {
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.available > 0 {
            state.available -= 1;
            Ok(())
        } else {
            Err(state.window_end)
        }
    }

    fn refill(&self, state: &mut GateState, now: Instant) {
        if now < state.window_end {
            return;
        }

        // Windows stay aligned to the gate's creation time, however long the
        // gate sat idle.
        let behind = (now - state.window_end).as_nanos();
        let unit = self.time_unit.as_nanos();
        let into_window = Duration::from_nanos((behind % unit) as u64);

        state.available = self.occurrences;
        state.window_end = now + (self.time_unit - into_window);
    }
}

// =============================================================================
// Tests
// =============================================================================
