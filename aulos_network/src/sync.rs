//! Clock synchronization between two independently clocked peers.
//!
//! The receiving end of an audio stream ([`ClockSyncClient`]) periodically
//! probes the sending end ([`ClockSyncServer`]) with its own clock, translated
//! into the sender's domain using its current estimate. The sender answers
//! with its clock at response time, from which the client derives a fresh
//! offset sample, NTP style, assuming symmetric network delays:
//!
//! ```text
//!   client            server
//!   T1  ──request──►  T2
//!   T4  ◄──response── T3 (= T2)
//!
//!   sample = ((T2 - T1) + (T3 - T4)) / 2
//! ```
//!
//! Samples are residuals: since T1 and T4 are already translated with the
//! current estimate, a sample of 0 means the estimate is right.
//!
//! Timestamps are wrapping 32-bit millisecond ticks, and so is the offset.

use arrayvec::ArrayVec;
use aulos_proto::{Message, MessageType, Tag, Tlv, TlvList};

use crate::config::SyncConfig;

/// Signed difference of two wrapping ticks.
#[inline(always)]
fn tick_diff(a: u32, b: u32) -> i64 {
    a.wrapping_sub(b) as i32 as i64
}

/// The probing half of a clock sync exchange.
///
/// `WINDOW` is the number of recent samples averaged per update, at least 1.
#[derive(Debug, Clone)]
pub struct ClockSyncClient<const WINDOW: usize = 1> {
    config: SyncConfig,
    valid: bool,
    last_probe: u32,
    last_response: u32,
    /// `local - peer`.
    offset: u32,
    samples: ArrayVec<i64, WINDOW>,
    cursor: usize,
    probes: u32,
}

impl<const WINDOW: usize> ClockSyncClient<WINDOW> {
    const NON_EMPTY_WINDOW: () = assert!(WINDOW > 0, "the sample window can't be empty");

    pub fn new(config: SyncConfig) -> Self {
        let () = Self::NON_EMPTY_WINDOW;

        Self {
            config,
            valid: false,
            last_probe: 0,
            last_response: 0,
            offset: 0,
            samples: ArrayVec::new(),
            cursor: 0,
            probes: 0,
        }
    }

    /// Returns `true` once at least one response has been processed.
    ///
    /// Timestamps must not be translated before that.
    #[inline(always)]
    pub const fn has_valid_estimate(&self) -> bool {
        self.valid
    }

    #[inline(always)]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The current offset estimate, `local - peer`.
    #[inline(always)]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    #[inline(always)]
    pub const fn to_local(&self, peer_time: u32) -> u32 {
        peer_time.wrapping_add(self.offset)
    }

    #[inline(always)]
    pub const fn to_peer(&self, local_time: u32) -> u32 {
        local_time.wrapping_sub(self.offset)
    }

    /// Returns `true` if responses have stopped arriving and the last probe
    /// is old enough to send another one.
    #[inline(always)]
    pub const fn is_due(&self, now: u32) -> bool {
        now.wrapping_sub(self.last_response) > self.config.grace_ms
            && now.wrapping_sub(self.last_probe) > self.config.cooldown_ms
    }

    /// Builds a probe, optionally carrying the number of frames queued
    /// locally for the peer's information.
    pub fn probe(&mut self, now: u32, buffered: Option<u32>) -> Message {
        self.last_probe = now;
        self.probes = self.probes.wrapping_add(1);

        let mut msg = Message::new(MessageType::AUDIO_SYNC_REQ)
            .with_id(self.probes)
            .with(Tlv::integer(Tag::CLIENT_CLOCK, self.to_peer(now)));

        if let Some(buffered) = buffered {
            msg.push(Tlv::integer(Tag::AUDIO_BUFFERED_SAMPLES, buffered));
        }

        log::trace!("clock sync probe at {now}");

        msg
    }

    /// Returns a probe if one [is due](Self::is_due).
    #[inline(always)]
    pub fn poll(&mut self, now: u32, buffered: Option<u32>) -> Option<Message> {
        self.is_due(now).then(|| self.probe(now, buffered))
    }

    /// Refines the estimate with a response received at `now`.
    ///
    /// Returns `false`, leaving the estimate untouched, if `response` isn't a
    /// well-formed sync response.
    pub fn handle_response(&mut self, response: &Message, now: u32) -> bool {
        if response.ty() != MessageType::AUDIO_SYNC_RSP {
            return false;
        }

        let tlvs = response.tlvs();
        let (Some(t1), Some(t2)) = (tlvs.int(Tag::CLIENT_CLOCK), tlvs.int(Tag::SERVER_CLOCK))
        else {
            log::warn!("clock sync response without clocks");
            return false;
        };

        let t3 = t2;
        let t4 = self.to_peer(now);

        let sample = (tick_diff(t2, t1) + tick_diff(t3, t4)) / 2;
        self.push_sample(sample);

        let mean = self.samples.iter().sum::<i64>() / self.samples.len() as i64;

        // samples are relative to the estimate they were taken with, keep them so
        self.offset = self.offset.wrapping_sub(mean as u32);
        self.samples.iter_mut().for_each(|s| *s -= mean);

        if !self.valid {
            log::debug!("clock sync estimate established, offset {}", self.offset as i32);
        }

        self.valid = true;
        self.last_response = now;

        true
    }

    fn push_sample(&mut self, sample: i64) {
        if self.samples.is_full() {
            self.samples[self.cursor] = sample;
        } else {
            self.samples.push(sample);
        }

        self.cursor = (self.cursor + 1) % WINDOW;
    }
}

impl<const WINDOW: usize> Default for ClockSyncClient<WINDOW> {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}

/// The answering half of a clock sync exchange.
#[derive(Debug, Clone, Default)]
pub struct ClockSyncServer {
    peer_buffered: Option<u32>,
}

impl ClockSyncServer {
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            peer_buffered: None,
        }
    }

    /// Frames the peer last reported as queued on its side, if it ever did.
    #[inline(always)]
    pub const fn peer_buffered(&self) -> Option<u32> {
        self.peer_buffered
    }

    /// Answers a sync request received at `now`.
    ///
    /// Returns `None` for anything but a sync request carrying a client clock.
    pub fn handle_request(&mut self, request: &Message, now: u32) -> Option<Message> {
        if request.ty() != MessageType::AUDIO_SYNC_REQ {
            return None;
        }

        let tlvs = request.tlvs();
        let client_clock = tlvs.int(Tag::CLIENT_CLOCK)?;

        if let Some(buffered) = tlvs.int(Tag::AUDIO_BUFFERED_SAMPLES) {
            self.peer_buffered = Some(buffered);
        }

        request.create_response().map(|rsp| {
            rsp.with(Tlv::integer(Tag::CLIENT_CLOCK, client_clock))
                .with(Tlv::integer(Tag::SERVER_CLOCK, now))
        })
    }
}
