//! Paced playout of queued frames.
//!
//! For every timed frame, the playout loop computes its *time to play*: how
//! long until it is due, minus what the device will play before it
//! (already-buffered frames and the output latency). Depending on that value,
//! the frame is delayed, dropped, trimmed, or played as is while scheduling a
//! gradual correction, see [`schedule`].
//!
//! Gradual corrections are applied by a [`DriftCorrector`], which pads or
//! trims every buffer by at most ~0.5% of its length. Padding repeats the last
//! frame, which is inaudible at these amounts.

use aulos_utils::{Cancel, IdleTimer, clock::Clock};
use core::time::Duration;
use std::io;

use super::{AudioFrame, DropReason, receiver::FrameSource};
use crate::config::PlayoutConfig;

/// The audio output.
pub trait PlaybackDevice {
    /// Prepares the device for a new stream format.
    fn configure(&mut self, channels: u16, rate: u32) -> io::Result<()>;

    /// Queues interleaved samples for output.
    fn write(&mut self, samples: &[i16]) -> io::Result<()>;

    /// Frames written but not played yet.
    fn buffered_frames(&self) -> u32;

    /// Output latency past the device buffer, in milliseconds.
    fn latency_ms(&self) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    NoData,
    /// Frames arrived, playback hasn't started yet.
    Buffering,
    Playing,
    /// Nothing arrived for a while.
    Underrun,
}

/// What to do with a timed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Too late, or implausibly early.
    Drop,
    /// Wait this many milliseconds, then play.
    Sleep(u32),
    /// Cut this many frames off the end right away, and cancel the pending
    /// correction.
    TrimNow(u32),
    /// Replace the pending correction with this many frames, positive to pad.
    Correct(i32),
    /// On time: cancel the pending correction.
    Cancel,
    /// Close enough: leave the pending correction alone.
    OnTime,
}

/// Decides how to play a frame of `frames` frames at `rate`, due in `ttp`
/// milliseconds.
pub fn schedule(ttp: i32, frames: usize, rate: u32, config: &PlayoutConfig) -> Schedule {
    let ms = |v: u32| i32::try_from(v).unwrap_or(i32::MAX);

    if ttp < -ms(config.drop_late_ms) || ttp > ms(config.implausible_ms) {
        return Schedule::Drop;
    }

    if ttp > ms(config.sleep_threshold_ms) {
        return Schedule::Sleep(ttp.saturating_sub(ms(config.sleep_margin_ms)).max(0) as u32);
    }

    if ttp < -ms(config.trim_threshold_ms) {
        let n = if frames > config.late_trim_min_frames as usize {
            config.late_trim_frames
        } else {
            0
        };
        return Schedule::TrimNow(n);
    }

    if ttp.unsigned_abs() > config.deadband_ms {
        return Schedule::Correct((i64::from(ttp) * i64::from(rate) / 1000) as i32);
    }

    if ttp == 0 {
        Schedule::Cancel
    } else {
        Schedule::OnTime
    }
}

/// Amortizes a timing correction over successive buffers.
#[derive(Debug, Clone, Default)]
pub struct DriftCorrector {
    /// Frames still to add (positive) or remove (negative).
    outstanding: i32,
    max_pad: usize,
}

impl DriftCorrector {
    #[inline(always)]
    pub fn new(max_pad_per_buffer: u32) -> Self {
        Self {
            outstanding: 0,
            max_pad: max_pad_per_buffer as usize,
        }
    }

    #[inline(always)]
    pub const fn outstanding(&self) -> i32 {
        self.outstanding
    }

    /// Replaces the pending correction.
    #[inline(always)]
    pub fn set(&mut self, frames: i32) {
        self.outstanding = frames;
    }

    #[inline(always)]
    pub fn cancel(&mut self) {
        self.outstanding = 0;
    }

    /// Most frames a buffer of `frames` frames may be stretched or shrunk by.
    #[inline(always)]
    pub fn per_buffer_cap(frames: usize) -> usize {
        (frames / 200).max(1)
    }

    /// Applies as much of the pending correction to `frame` as allowed,
    /// returning the change in frames.
    pub fn adjust(&mut self, frame: &mut AudioFrame) -> i32 {
        let frames = frame.frames();
        let cap = Self::per_buffer_cap(frames);

        let applied = match self.outstanding.signum() {
            1 => {
                let n = cap.min(self.outstanding as usize).min(self.max_pad);
                frame.pad(n) as i32
            }
            -1 => {
                // keep at least one frame
                let n = cap
                    .min(self.outstanding.unsigned_abs() as usize)
                    .min(frames.saturating_sub(1));
                -(frame.trim(n) as i32)
            }
            _ => 0,
        };

        self.outstanding -= applied;

        if applied != 0 {
            log::trace!("drift correction {applied:+}, {} outstanding", self.outstanding);
        }

        applied
    }
}

/// The playout loop of one stream.
pub struct Playout<D, C> {
    source: FrameSource,
    device: D,
    clock: C,
    config: PlayoutConfig,
    corrector: DriftCorrector,
    state: StreamState,
    format: Option<(u16, u32)>,
    idle: IdleTimer,
}

impl<D: PlaybackDevice, C: Clock> Playout<D, C> {
    pub fn new(source: FrameSource, device: D, clock: C, config: PlayoutConfig) -> Self {
        let idle = IdleTimer::new(clock.now_ms());
        Self {
            source,
            device,
            clock,
            corrector: DriftCorrector::new(config.max_pad_per_buffer),
            config,
            state: StreamState::NoData,
            format: None,
            idle,
        }
    }

    /// Current state. Frames queued before playback starts read as
    /// [`StreamState::Buffering`].
    #[inline(always)]
    pub fn state(&self) -> StreamState {
        match self.state {
            StreamState::NoData if !self.source.frames.is_empty() => StreamState::Buffering,
            state => state,
        }
    }

    #[inline(always)]
    pub const fn corrector(&self) -> &DriftCorrector {
        &self.corrector
    }

    #[inline(always)]
    pub const fn device(&self) -> &D {
        &self.device
    }

    #[inline(always)]
    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    fn set_state(&mut self, state: StreamState) {
        if self.state != state {
            log::debug!("audio stream {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    #[inline(always)]
    fn recycle(&mut self, frame: AudioFrame) {
        if self.source.recycle.give_back(frame.samples).is_err() {
            log::debug!("frame buffer not from our pool, freeing it");
        }
    }

    /// Waits for the next frame and plays it.
    ///
    /// Returns `false` if no frame arrived within the polling period.
    pub fn step(&mut self) -> io::Result<bool> {
        let timeout = Duration::from_millis(self.config.poll_ms.into());

        if let Some(frame) = self.source.frames.recv_timeout(timeout) {
            self.play(frame)?;
            return Ok(true);
        }

        let idle = self.idle.elapsed(self.clock.now_ms());
        if self.state == StreamState::Playing && idle > self.config.underrun_after_ms {
            log::debug!("no audio for {idle} ms");
            self.set_state(StreamState::Underrun);
        }

        Ok(false)
    }

    /// Schedules, corrects and plays one frame.
    ///
    /// The stream stays [`StreamState::Buffering`] until a frame reaches the
    /// device.
    pub fn play(&mut self, mut frame: AudioFrame) -> io::Result<()> {
        let now = self.clock.now_ms();
        self.idle.reset(now);

        if self.state == StreamState::NoData {
            self.set_state(StreamState::Buffering);
        }

        let format = (frame.channels, frame.rate);
        if self.format != Some(format) {
            log::debug!("audio format {} ch, {} Hz", format.0, format.1);
            self.format = None;

            if let Err(e) = self.device.configure(format.0, format.1) {
                self.recycle(frame);
                return Err(e);
            }

            self.format = Some(format);
            self.corrector.cancel();
        }

        if let Some(ts) = frame.timestamp {
            let rate = u64::from(frame.rate.max(1));
            let buffered_ms = u64::from(self.device.buffered_frames()) * 1000 / rate;

            let ttp = i64::from(ts.wrapping_sub(now) as i32)
                - buffered_ms as i64
                - i64::from(self.device.latency_ms());
            let ttp = ttp.clamp(i32::MIN.into(), i32::MAX.into()) as i32;

            match schedule(ttp, frame.frames(), frame.rate, &self.config) {
                Schedule::Drop => {
                    log::trace!("dropping frame due in {ttp} ms");
                    self.source.stats.record_drop(DropReason::Late);
                    self.recycle(frame);
                    return Ok(());
                }
                Schedule::Sleep(ms) => {
                    log::trace!("frame due in {ttp} ms, sleeping {ms} ms");
                    self.clock.sleep_ms(ms);
                }
                Schedule::TrimNow(n) => {
                    log::trace!("frame {} ms late, trimming {n} frames", -ttp);
                    frame.trim(n as usize);
                    self.corrector.cancel();
                }
                Schedule::Correct(n) => self.corrector.set(n),
                Schedule::Cancel => self.corrector.cancel(),
                Schedule::OnTime => {}
            }
        } else {
            let low_water = frame.rate / self.config.low_water_divisor.max(1);
            if self.source.queued_frames() < low_water as usize {
                self.corrector.set(self.config.low_water_pad as i32);
            }
        }

        self.corrector.adjust(&mut frame);

        let res = self.device.write(&frame.samples);
        self.recycle(frame);
        res?;

        self.source.stats.record_played();
        self.set_state(StreamState::Playing);

        Ok(())
    }

    /// Flushes every queued frame and returns to [`StreamState::NoData`].
    pub fn stop(&mut self) {
        let mut flushed = 0;

        for frame in self.source.frames.flush() {
            flushed += 1;
            if self.source.recycle.give_back(frame.samples).is_err() {
                log::debug!("frame buffer not from our pool, freeing it");
            }
        }

        if flushed > 0 {
            log::debug!("flushed {flushed} queued frames");
        }

        self.corrector.cancel();
        self.set_state(StreamState::NoData);
    }

    /// Plays frames until cancelled.
    ///
    /// Device errors are logged, and the offending frame skipped.
    pub fn run(mut self, cancel: Cancel) {
        while !cancel.is_cancelled() {
            if let Err(e) = self.step() {
                log::error!("playback device error: {e}");
            }
        }

        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Stats;
    use aulos_utils::{clock::ManualClock, pool, queue};
    use core::num::NonZeroUsize;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::sync::Arc;

    const RATE: u32 = 48_000;

    #[derive(Debug, Default)]
    struct Recorder {
        formats: Vec<(u16, u32)>,
        /// Frames per write.
        writes: Vec<usize>,
        channels: u16,
        buffered: u32,
        latency: u32,
    }

    impl PlaybackDevice for Recorder {
        fn configure(&mut self, channels: u16, rate: u32) -> io::Result<()> {
            self.formats.push((channels, rate));
            self.channels = channels;
            Ok(())
        }

        fn write(&mut self, samples: &[i16]) -> io::Result<()> {
            self.writes.push(samples.len() / usize::from(self.channels));
            Ok(())
        }

        fn buffered_frames(&self) -> u32 {
            self.buffered
        }

        fn latency_ms(&self) -> u32 {
            self.latency
        }
    }

    fn frame(frames: usize, timestamp: Option<u32>) -> AudioFrame {
        let mut samples = Vec::with_capacity(frames * 2 + 16);
        samples.extend((0..frames * 2).map(|i| i as i16));
        AudioFrame {
            timestamp,
            channels: 2,
            rate: RATE,
            samples,
        }
    }

    fn playout(
        clock: &Arc<ManualClock>,
    ) -> (Playout<Recorder, Arc<ManualClock>>, queue::Tx<AudioFrame>) {
        let (tx, rx) = queue::bounded(NonZeroUsize::new(8).unwrap());
        let (_pool, recycle) = pool::recycler((0..8).map(|_| Vec::new()));

        let source = FrameSource {
            frames: rx,
            recycle,
            stats: Arc::new(Stats::default()),
        };

        let config = PlayoutConfig {
            poll_ms: 1,
            ..Default::default()
        };

        (Playout::new(source, Recorder::default(), clock.clone(), config), tx)
    }

    #[test]
    fn schedule_thresholds() {
        let c = PlayoutConfig::default();
        let s = |ttp, frames| schedule(ttp, frames, RATE, &c);

        assert_eq!(s(-26, 441), Schedule::Drop);
        assert_eq!(s(501, 441), Schedule::Drop);
        assert_eq!(s(500, 441), Schedule::Sleep(490));
        assert_eq!(s(26, 441), Schedule::Sleep(16));
        assert_eq!(s(-25, 441), Schedule::TrimNow(4));
        assert_eq!(s(-4, 10), Schedule::TrimNow(0));
        assert_eq!(s(-3, 441), Schedule::Correct(-144));
        assert_eq!(s(25, 441), Schedule::Correct(1200));
        assert_eq!(s(1, 441), Schedule::OnTime);
        assert_eq!(s(-1, 441), Schedule::OnTime);
        assert_eq!(s(0, 441), Schedule::Cancel);
    }

    #[test]
    fn correction_is_capped_and_conserved() {
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..200 {
            let scheduled: i32 = rng.gen_range(-60..=60);
            let mut corrector = DriftCorrector::new(4);
            corrector.set(scheduled);

            let mut total = 0;
            for _ in 0..rng.gen_range(1..40) {
                let mut f = frame(rng.gen_range(1..2000), None);
                let before = f.frames();

                let applied = corrector.adjust(&mut f);
                let cap = DriftCorrector::per_buffer_cap(before);

                assert_eq!(f.frames() as i64 - before as i64, i64::from(applied));
                assert!(applied.unsigned_abs() as usize <= cap);
                assert!(applied <= 4);
                assert!(f.frames() >= 1);
                total += applied;
            }

            assert!(total.abs() <= scheduled.abs());
            assert!(total == 0 || total.signum() == scheduled.signum());
            assert_eq!(corrector.outstanding(), scheduled - total);
        }
    }

    #[test]
    fn padding_repeats_the_last_frame() {
        let mut f = frame(3, None);
        let mut corrector = DriftCorrector::new(4);
        corrector.set(5);
        assert_eq!(corrector.adjust(&mut f), 1);
        assert_eq!(&f.samples[4..], [4, 5, 4, 5]);
        assert_eq!(corrector.outstanding(), 4);
    }

    #[test]
    fn timed_frames_are_paced() {
        let clock = Arc::new(ManualClock::new(1000));
        let (mut p, _tx) = playout(&clock);

        // early: sleep until nearly due
        p.play(frame(441, Some(1100))).unwrap();
        assert_eq!(clock.now_ms(), 1090);
        assert_eq!(p.state(), StreamState::Playing);

        // far too late
        p.play(frame(441, Some(1050))).unwrap();
        assert_eq!(p.source().stats().dropped(DropReason::Late), 1);

        // slightly late, trimmed right away
        p.play(frame(441, Some(1085))).unwrap();

        // slightly early, padded gradually: 10 ms is 480 frames
        p.play(frame(441, Some(1100))).unwrap();
        assert_eq!(p.corrector().outstanding(), 478);

        assert_eq!(p.device().writes, [441, 437, 443]);
        assert_eq!(p.device().formats, [(2, RATE)]);
        assert_eq!(p.source().stats().played(), 3);
    }

    #[test]
    fn device_backlog_counts_as_latency() {
        let clock = Arc::new(ManualClock::new(0));
        let (mut p, _tx) = playout(&clock);

        p.device.buffered = 480;
        p.device.latency = 5;

        // due in 15 ms, but 10 + 5 ms of audio are ahead of it
        p.play(frame(441, Some(15))).unwrap();
        assert_eq!(p.corrector().outstanding(), 0);
        assert_eq!(p.device().writes, [441]);
        assert_eq!(clock.now_ms(), 0);
    }

    #[test]
    fn untimed_streams_pad_when_running_low() {
        let clock = Arc::new(ManualClock::new(0));
        let (mut p, _tx) = playout(&clock);

        p.play(frame(441, None)).unwrap();
        assert_eq!(p.device().writes, [443]);
        assert_eq!(p.corrector().outstanding(), 42);
    }

    #[test]
    fn state_machine() {
        let clock = Arc::new(ManualClock::new(0));
        let (mut p, mut tx) = playout(&clock);
        assert_eq!(p.state(), StreamState::NoData);

        tx.try_push(frame(100, None)).unwrap();
        assert_eq!(p.state(), StreamState::Buffering);
        assert!(p.step().unwrap());
        assert_eq!(p.state(), StreamState::Playing);

        clock.advance(150);
        assert!(!p.step().unwrap());
        assert_eq!(p.state(), StreamState::Playing);

        clock.advance(100);
        assert!(!p.step().unwrap());
        assert_eq!(p.state(), StreamState::Underrun);

        tx.try_push(frame(100, None)).unwrap();
        assert!(p.step().unwrap());
        assert_eq!(p.state(), StreamState::Playing);

        // a new format reconfigures the device
        let mut mono = frame(100, None);
        mono.channels = 1;
        tx.try_push(mono).unwrap();
        tx.try_push(frame(100, None)).unwrap();
        assert!(p.step().unwrap());
        assert_eq!(p.device().formats, [(2, RATE), (1, RATE)]);

        p.stop();
        assert_eq!(p.state(), StreamState::NoData);
        assert_eq!(p.source().queued_frames(), 0);
    }

    #[test]
    fn buffering_until_the_first_write() {
        let clock = Arc::new(ManualClock::new(1000));
        let (mut p, mut tx) = playout(&clock);

        tx.try_push(frame(441, Some(900))).unwrap();
        assert_eq!(p.state(), StreamState::Buffering);

        // too late, nothing reached the device yet
        assert!(p.step().unwrap());
        assert_eq!(p.source().stats().dropped(DropReason::Late), 1);
        assert_eq!(p.state(), StreamState::Buffering);

        p.play(frame(441, Some(1000))).unwrap();
        assert_eq!(p.state(), StreamState::Playing);
        assert_eq!(p.device().writes, [441]);
    }

    /// Fails the first `failures` configurations.
    #[derive(Debug, Default)]
    struct Flaky {
        failures: usize,
        inner: Recorder,
    }

    impl PlaybackDevice for Flaky {
        fn configure(&mut self, channels: u16, rate: u32) -> io::Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::other("device busy"));
            }
            self.inner.configure(channels, rate)
        }

        fn write(&mut self, samples: &[i16]) -> io::Result<()> {
            self.inner.write(samples)
        }

        fn buffered_frames(&self) -> u32 {
            0
        }

        fn latency_ms(&self) -> u32 {
            0
        }
    }

    #[test]
    fn failed_configuration_keeps_the_pool_full() {
        use crate::{
            audio::{crypto::Plaintext, receiver::AudioReceiver},
            config::{ReceiverConfig, SyncConfig},
        };
        use aulos_proto::{Message, MessageType, Tag, Tlv};

        // a single queued frame: 3 buffers in the pool
        let config = ReceiverConfig {
            queue_frames: 1,
            block_samples: 64,
        };
        let (mut rx, source) = AudioReceiver::<_, 1>::new(&config, SyncConfig::default(), [0; 32], Plaintext);

        let datagram = Message::new(MessageType::AUDIO_DATA_IND)
            .with(Tlv::integer(Tag::AUDIO_CHANNELS, 2))
            .with(Tlv::integer(Tag::AUDIO_RATE, RATE))
            .with(Tlv::integer(Tag::AUDIO_NOF_SAMPLES, 4))
            .with(Tlv::binary(Tag::AUDIO_IV, Vec::<u8>::new()))
            .with(Tlv::binary(Tag::AUDIO_DATA, [0u8; 16]))
            .encode();

        let device = Flaky {
            failures: 3,
            ..Default::default()
        };
        let config = PlayoutConfig {
            poll_ms: 1,
            ..Default::default()
        };
        let mut p = Playout::new(source, device, Arc::new(ManualClock::new(0)), config);

        for _ in 0..3 {
            rx.handle_datagram(&datagram, 0);
            assert!(p.step().is_err());
        }
        assert_eq!(p.state(), StreamState::Buffering);

        // the device recovered, and no buffer went missing
        for _ in 0..5 {
            rx.handle_datagram(&datagram, 0);
            assert!(p.step().unwrap());
        }

        assert_eq!(rx.stats().dropped(DropReason::NoBuffer), 0);
        assert_eq!(p.source().stats().played(), 5);
        assert_eq!(p.state(), StreamState::Playing);
        assert_eq!(p.device().inner.formats, [(2, RATE)]);
    }
}
