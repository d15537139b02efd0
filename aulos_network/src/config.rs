//! Tunables of every stateful component.
//!
//! All structs implement `serde`'s traits, so applications can load them from
//! whatever configuration format they use. Missing fields take their default.

use serde::{Deserialize, Serialize};

/// Probe gating of the clock sync engine. All values in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Re-probe once no response has arrived for this long.
    pub grace_ms: u32,
    /// Minimum spacing between two probes.
    pub cooldown_ms: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            grace_ms: 100,
            cooldown_ms: 50,
        }
    }
}

/// Scheduling thresholds of the playout loop.
///
/// Unless stated otherwise, values are in milliseconds, relative to the time
/// at which a frame is due to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayoutConfig {
    /// Maximum wait for the next frame before checking for underruns.
    pub poll_ms: u32,
    pub sleep_threshold_ms: u32,
    /// Wake up this early before a frame is due.
    pub sleep_margin_ms: u32,
    /// Frames later than this are dropped.
    pub drop_late_ms: u32,
    /// Frames due further in the future than this are considered bogus and dropped.
    pub implausible_ms: u32,
    /// Frames later than this get their tail trimmed right away.
    pub trim_threshold_ms: u32,
    /// Frames trimmed from a late frame.
    pub late_trim_frames: u32,
    /// Frames this short are never trimmed.
    pub late_trim_min_frames: u32,
    /// Timing errors within this window are left alone.
    pub deadband_ms: u32,
    /// Upper bound of frames synthesized per buffer.
    pub max_pad_per_buffer: u32,
    pub underrun_after_ms: u32,
    /// Untimed streams are padded when fewer than `rate / low_water_divisor`
    /// frames are queued.
    pub low_water_divisor: u32,
    /// Frames padded when an untimed stream runs low.
    pub low_water_pad: u32,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            poll_ms: 100,
            sleep_threshold_ms: 25,
            sleep_margin_ms: 10,
            drop_late_ms: 25,
            implausible_ms: 500,
            trim_threshold_ms: 3,
            late_trim_frames: 4,
            late_trim_min_frames: 10,
            deadband_ms: 1,
            max_pad_per_buffer: 4,
            underrun_after_ms: 200,
            low_water_divisor: 50,
            low_water_pad: 44,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Capacity of the frame queue between the receiver and the playout loop.
    pub queue_frames: usize,
    /// Capacity, in samples, of every pooled frame buffer.
    pub block_samples: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            queue_frames: 64,
            block_samples: 4096,
        }
    }
}

/// Pacing of the audio sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Maximum frames per datagram.
    pub batch_frames: usize,
    /// Token bucket capacity, in batches.
    pub bucket_batches: usize,
    pub refill_interval_ms: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            batch_frames: 330,
            bucket_batches: 20,
            refill_interval_ms: 10,
        }
    }
}

impl SenderConfig {
    /// Token bucket capacity, in frames.
    #[inline(always)]
    pub const fn bucket_frames(&self) -> usize {
        self.batch_frames * self.bucket_batches
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Readiness wait timeout, bounding the reaction time to cancellation.
    pub poll_ms: u32,
    /// Messages declaring a larger total length close the connection.
    pub max_message_len: usize,
    /// Maximum bytes handed to the transport per write.
    pub write_chunk_len: usize,
    /// Longest delay before a message queued on an idle connection is written.
    pub queue_check_ms: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            poll_ms: 100,
            max_message_len: 1 << 20,
            write_chunk_len: 4096,
            queue_check_ms: 5,
        }
    }
}
