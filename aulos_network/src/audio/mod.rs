//! The audio delivery pipeline.
//!
//! ```text
//!            UDP                    frame queue
//! AudioSender ──► AudioReceiver ─────────────────► Playout ──► PlaybackDevice
//!     ▲                │   ▲                          │
//!     └── clock sync ──┘   └──── pooled buffers ──────┘
//! ```
//!
//! The [`sender`] batches PCM into encrypted datagrams, paced by a token
//! bucket. The [`receiver`] decrypts them into pooled buffers, translates
//! their timestamps into the local clock domain, and hands them to the
//! [`playout`] loop, which schedules them against the wall clock and
//! stretches or shrinks buffers by a few frames to follow the sender's clock.

pub mod crypto;
pub mod playout;
pub mod receiver;
pub mod sender;

use aulos_utils::queue::Weighted;
use core::sync::atomic::{AtomicU64, Ordering};

/// Decoded PCM, interleaved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// When the first frame should be heard, in local clock ticks. `None` for
    /// best effort, back-to-back playback.
    pub timestamp: Option<u32>,
    pub channels: u16,
    pub rate: u32,
    /// Never grows past its capacity, which is the pool's block size.
    pub samples: Vec<i16>,
}

impl AudioFrame {
    /// Number of frames, a frame holding one sample per channel.
    #[inline(always)]
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    /// Frames that can be added without reallocating.
    #[inline(always)]
    pub fn headroom(&self) -> usize {
        (self.samples.capacity() - self.samples.len()) / usize::from(self.channels.max(1))
    }

    /// Removes up to `n` frames from the end, returning how many were removed.
    pub fn trim(&mut self, n: usize) -> usize {
        let n = n.min(self.frames());
        let frames = self.frames() - n;
        self.samples.truncate(frames * usize::from(self.channels));
        n
    }

    /// Repeats the last frame up to `n` times, within the headroom, returning
    /// how many frames were added.
    pub fn pad(&mut self, n: usize) -> usize {
        let n = n.min(self.headroom());
        let channels = usize::from(self.channels);

        let Some(start) = self.samples.len().checked_sub(channels) else {
            return 0;
        };

        for _ in 0..n {
            self.samples.extend_from_within(start..start + channels);
        }

        n
    }
}

impl Weighted for AudioFrame {
    #[inline(always)]
    fn weight(&self) -> usize {
        self.frames()
    }
}

/// Why a frame never made it to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Undecodable datagram, or missing fields.
    Malformed,
    Decrypt,
    /// The buffer pool was empty.
    NoBuffer,
    /// The frame queue was full.
    QueueFull,
    /// Due too long ago, or too far in the future.
    Late,
}

impl DropReason {
    pub const ALL: [Self; 5] = [
        Self::Malformed,
        Self::Decrypt,
        Self::NoBuffer,
        Self::QueueFull,
        Self::Late,
    ];
}

/// Counters of one audio stream, shared between its threads.
#[derive(Debug, Default)]
pub struct Stats {
    received: AtomicU64,
    queued: AtomicU64,
    played: AtomicU64,
    dropped: [AtomicU64; DropReason::ALL.len()],
}

impl Stats {
    #[inline(always)]
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_played(&self) {
        self.played.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_drop(&self, reason: DropReason) {
        self.dropped[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Datagrams received, whatever became of them.
    #[inline(always)]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn played(&self) -> u64 {
        self.played.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped[reason as usize].load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        DropReason::ALL.iter().map(|&r| self.dropped(r)).sum()
    }
}
