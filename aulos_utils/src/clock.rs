//! Millisecond tick sources.
//!
//! Timestamps exchanged on the wire are 32-bit millisecond ticks that wrap
//! around every ~49.7 days, so all arithmetic on them must be modular.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

/// A monotonic millisecond clock.
pub trait Clock {
    /// The current tick. Wraps around on overflow.
    fn now_ms(&self) -> u32;

    /// Suspends the calling thread for about `ms` milliseconds.
    fn sleep_ms(&self, ms: u32);
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline(always)]
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }

    #[inline(always)]
    fn sleep_ms(&self, ms: u32) {
        (**self).sleep_ms(ms)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline(always)]
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }

    #[inline(always)]
    fn sleep_ms(&self, ms: u32) {
        (**self).sleep_ms(ms)
    }
}

/// Ticks since the clock was created, backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: std::time::Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    #[inline(always)]
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    #[inline(always)]
    fn now_ms(&self) -> u32 {
        // truncation is the wraparound
        self.origin.elapsed().as_millis() as u32
    }

    #[inline(always)]
    fn sleep_ms(&self, ms: u32) {
        std::thread::sleep(core::time::Duration::from_millis(ms.into()));
    }
}

/// A clock that only moves when told to. Sleeping advances it instantly.
///
/// Used to drive the timing logic deterministically in tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    #[inline(always)]
    pub const fn new(start_ms: u32) -> Self {
        Self {
            now: AtomicU32::new(start_ms),
        }
    }

    #[inline(always)]
    pub fn advance(&self, ms: u32) {
        // fetch_add wraps on overflow
        self.now.fetch_add(ms, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn set(&self, now_ms: u32) {
        self.now.store(now_ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    #[inline(always)]
    fn now_ms(&self) -> u32 {
        self.now.load(Ordering::Acquire)
    }

    #[inline(always)]
    fn sleep_ms(&self, ms: u32) {
        self.advance(ms);
    }
}
