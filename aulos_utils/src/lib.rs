//! Utilities for building predictable, low-latency, allocation-conscious data pipelines.
//!
//! This crate provides the small primitives the audio and control paths are
//! built from:
//!
//! - [`clock`]: a millisecond tick source, real or simulated,
//! - [`queue`]: a bounded single-producer single-consumer queue with timed
//!   waits, for handing frames from a network thread to a playout thread,
//! - [`pool`]: a fixed set of preallocated buffers cycling between two threads,
//! - [`Cancel`] and [`IdleTimer`] for driving worker loops.

pub mod clock;
pub mod pool;
pub mod queue;

pub use rtrb;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// A cooperative cancellation flag shared between a worker loop and its owner.
///
/// Worker loops check [`is_cancelled`](Self::is_cancelled) at every suspension
/// point, and all their waits are bounded, so a cancelled loop exits within one
/// polling period.
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    #[inline(always)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests every loop holding a clone of this token to stop.
    #[inline(always)]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Tracks the time elapsed since the last reset, in [`clock`] ticks.
///
/// Typically used to detect inactivity: a stream that hasn't received data
/// for a while, or a peer that stopped answering.
///
/// ```ignore
/// let mut timer = IdleTimer::new(clock.now_ms());
///
/// // we have received something.
/// timer.reset(clock.now_ms());
///
/// if timer.elapsed(clock.now_ms()) > TIMEOUT_MS {
///     // consider the stream idle
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTimer(u32);

impl IdleTimer {
    #[inline(always)]
    pub const fn new(now_ms: u32) -> Self {
        Self(now_ms)
    }

    #[inline(always)]
    pub const fn reset(&mut self, now_ms: u32) {
        self.0 = now_ms;
    }

    /// Milliseconds since the last reset. Tolerates tick wraparound.
    #[inline(always)]
    pub const fn elapsed(&self, now_ms: u32) -> u32 {
        now_ms.wrapping_sub(self.0)
    }
}
