//! The sending side of an audio stream.
//!
//! PCM handed to an [`AudioSender`] is split into batches, each becoming one
//! encrypted `AUDIO_DATA_IND` datagram. Sending is paced by a token bucket
//! counted in frames: the bucket models how much audio the receiving end
//! buffers, so bursts never exceed it and, past the initial fill, frames
//! leave at the stream's sample rate.
//!
//! The sender also answers the receiver's clock sync probes, which arrive on
//! the same socket.

use aulos_proto::{Message, MessageType, Tag, Tlv};
use rand::{RngCore, SeedableRng, rngs::StdRng};
use std::{collections::VecDeque, io};

use super::crypto::{CryptoError, Encryptor, IV_LEN, Key};
use crate::{config::SenderConfig, sync::ClockSyncServer, transport::Transport};

#[derive(Debug)]
struct Batch {
    timestamp: Option<u32>,
    channels: u16,
    rate: u32,
    samples: Vec<i16>,
}

impl Batch {
    #[inline(always)]
    fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }
}

/// Milliseconds of audio in `frames` frames.
#[inline(always)]
fn frames_to_ms(frames: u64, rate: u32) -> u32 {
    (frames * 1000 / u64::from(rate.max(1))) as u32
}

pub struct AudioSender<E, R = StdRng> {
    config: SenderConfig,
    key: Key,
    encryptor: E,
    rng: R,
    fifo: VecDeque<Batch>,
    fifo_frames: usize,
    /// Rate of the most recently queued audio.
    rate: u32,
    tokens: usize,
    last_refill: Option<u32>,
    sync: ClockSyncServer,
    /// Only used to tell datagrams apart when debugging.
    next_id: u32,
    plain: Vec<u8>,
    cipher: Vec<u8>,
    rx_buf: Vec<u8>,
}

impl<E: Encryptor> AudioSender<E> {
    /// Creates a sender drawing its IVs from the operating system's entropy.
    pub fn new(config: SenderConfig, key: Key, encryptor: E) -> Self {
        Self::with_rng(config, key, encryptor, StdRng::from_entropy())
    }
}

impl<E: Encryptor, R: RngCore> AudioSender<E, R> {
    pub fn with_rng(config: SenderConfig, key: Key, encryptor: E, rng: R) -> Self {
        Self {
            config,
            key,
            encryptor,
            rng,
            fifo: VecDeque::new(),
            fifo_frames: 0,
            rate: 0,
            tokens: config.bucket_frames(),
            last_refill: None,
            sync: ClockSyncServer::new(),
            next_id: 0,
            plain: Vec::new(),
            cipher: Vec::new(),
            rx_buf: vec![0; 2048],
        }
    }

    #[inline(always)]
    pub fn sync(&self) -> &ClockSyncServer {
        &self.sync
    }

    /// Frames available in the token bucket.
    #[inline(always)]
    pub fn tokens(&self) -> usize {
        self.tokens
    }

    /// Frames queued here, plus what the receiving end is assumed to buffer.
    #[inline(always)]
    pub fn queued_frames(&self) -> usize {
        self.fifo_frames + self.config.bucket_frames()
    }

    /// Queues interleaved PCM.
    ///
    /// If `timestamp` is given, it is when the first frame should be heard, in
    /// this end's clock domain.
    pub fn enqueue(&mut self, samples: &[i16], channels: u16, rate: u32, mut timestamp: Option<u32>) {
        if channels == 0 || rate == 0 {
            log::warn!("ignoring audio with {channels} channels at {rate} Hz");
            return;
        }

        self.rate = rate;
        let ch = usize::from(channels);

        for chunk in samples.chunks(self.config.batch_frames.max(1) * ch) {
            let frames = chunk.len() / ch;
            if frames == 0 {
                continue;
            }

            self.fifo.push_back(Batch {
                timestamp,
                channels,
                rate,
                samples: chunk[..frames * ch].to_vec(),
            });
            self.fifo_frames += frames;

            timestamp = timestamp.map(|ts| ts.wrapping_add(frames_to_ms(frames as u64, rate)));
        }
    }

    /// Drops every queued batch.
    pub fn clear(&mut self) {
        self.fifo.clear();
        self.fifo_frames = 0;
    }

    fn refill(&mut self, now: u32) {
        let Some(last) = self.last_refill else {
            self.last_refill = Some(now);
            return;
        };

        let interval = self.config.refill_interval_ms.max(1);
        let elapsed = now.wrapping_sub(last);

        if elapsed < interval {
            return;
        }

        let capacity = self.config.bucket_frames();
        let per_interval = u64::from(self.rate) * u64::from(interval) / 1000;

        if per_interval == 0 {
            self.last_refill = Some(now);
            return;
        }

        let full_refill_ms = capacity as u64 * u64::from(interval) / per_interval;

        if u64::from(elapsed) > full_refill_ms {
            self.tokens = capacity;
            self.last_refill = Some(now);
            return;
        }

        let intervals = elapsed / interval;
        self.tokens = capacity.min(self.tokens + (u64::from(intervals) * per_interval) as usize);
        self.last_refill = Some(last.wrapping_add(intervals * interval));
    }

    /// Returns the next datagram to send at `now`, if pacing allows it.
    ///
    /// A batch failing to encrypt is dropped, and the error returned.
    pub fn next_datagram(&mut self, now: u32) -> Result<Option<Vec<u8>>, CryptoError> {
        self.refill(now);

        let Some(batch) = self.fifo.front() else {
            return Ok(None);
        };

        let frames = batch.frames();

        if let Some(ts) = batch.timestamp {
            let horizon = frames_to_ms(self.config.bucket_frames() as u64, batch.rate);
            if ts.wrapping_sub(now) as i32 > horizon as i32 {
                return Ok(None);
            }
        }

        if self.tokens < frames {
            return Ok(None);
        }

        let Some(batch) = self.fifo.pop_front() else {
            return Ok(None);
        };

        self.tokens -= frames;
        self.fifo_frames -= frames;

        self.encode(&batch).map(Some)
    }

    fn encode(&mut self, batch: &Batch) -> Result<Vec<u8>, CryptoError> {
        self.plain.clear();
        self.plain
            .extend(batch.samples.iter().flat_map(|s| s.to_be_bytes()));

        let mut iv = [0; IV_LEN];
        self.rng.fill_bytes(&mut iv);

        self.cipher
            .resize(self.encryptor.ciphertext_len(self.plain.len()), 0);
        let n = self
            .encryptor
            .encrypt(&self.key, &iv, &self.plain, &mut self.cipher)?;

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let mut msg = Message::new(MessageType::AUDIO_DATA_IND)
            .with_id(id)
            .with(Tlv::integer(Tag::AUDIO_CHANNELS, batch.channels.into()))
            .with(Tlv::integer(Tag::AUDIO_RATE, batch.rate))
            .with(Tlv::integer(Tag::AUDIO_NOF_SAMPLES, batch.frames() as u32));

        if let Some(ts) = batch.timestamp {
            msg.push(Tlv::integer(Tag::AUDIO_TIMESTAMP, ts));
        }

        msg.push(Tlv::binary(Tag::AUDIO_IV, iv));
        msg.push(Tlv::binary(Tag::AUDIO_DATA, &self.cipher[..n]));

        Ok(msg.encode())
    }

    /// Processes a datagram from the receiving end, returning the answer to
    /// send back, if any.
    pub fn handle_datagram(&mut self, datagram: &[u8], now: u32) -> Option<Vec<u8>> {
        let msg = match Message::decode(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("dropping malformed datagram: {e}");
                return None;
            }
        };

        let rsp = self.sync.handle_request(&msg, now);

        if rsp.is_none() {
            log::debug!("ignoring {msg} on the audio channel");
        }

        rsp.map(|rsp| rsp.encode())
    }

    /// Answers pending clock sync probes, then sends every batch pacing
    /// allows. Returns the number of audio datagrams sent.
    pub fn service<T: Transport + ?Sized>(&mut self, transport: &mut T, now: u32) -> io::Result<usize> {
        let mut buf = core::mem::take(&mut self.rx_buf);

        let res = self.answer_probes(transport, &mut buf, now);
        self.rx_buf = buf;
        res?;

        let mut sent = 0;

        loop {
            let datagram = match self.next_datagram(now) {
                Ok(Some(datagram)) => datagram,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("dropping audio batch: {e}");
                    continue;
                }
            };

            match transport.try_send(&datagram) {
                Ok(_) => sent += 1,
                Err(e) if crate::io_err_is_timeout(e.kind()) => {
                    log::trace!("socket full, audio datagram lost");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(sent)
    }

    fn answer_probes<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        buf: &mut [u8],
        now: u32,
    ) -> io::Result<()> {
        loop {
            let n = match transport.try_recv(buf) {
                // nothing more will come, but we may still send
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if crate::io_err_is_timeout(e.kind()) => return Ok(()),
                Err(e) => return Err(e),
            };

            if let Some(rsp) = self.handle_datagram(&buf[..n], now) {
                match transport.try_send(&rsp) {
                    Ok(_) => {}
                    Err(e) if crate::io_err_is_timeout(e.kind()) => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

/// Timestamps a continuous stream of chunks so they play back to back.
///
/// The first chunk is scheduled to play once everything already queued has
/// been heard, plus a small margin. Following chunks are scheduled right after
/// their predecessor, unless the stream fell behind real time, in which case
/// it is anchored again.
#[derive(Debug, Clone)]
pub struct TimestampDispatcher {
    rate: u32,
    base: Option<u32>,
    frames: u64,
}

impl TimestampDispatcher {
    const MARGIN_MS: u32 = 10;

    #[inline(always)]
    pub const fn new(rate: u32) -> Self {
        Self {
            rate,
            base: None,
            frames: 0,
        }
    }

    /// Forgets the current anchor, e.g. after a seek.
    #[inline(always)]
    pub fn reset(&mut self) {
        self.base = None;
        self.frames = 0;
    }

    /// Returns the timestamp of the next chunk, of `frames` frames, given
    /// that `highest_queued` frames are ahead of it.
    pub fn stamp(&mut self, frames: usize, now: u32, highest_queued: usize) -> u32 {
        let next = self
            .base
            .map(|base| base.wrapping_add(frames_to_ms(self.frames, self.rate)))
            .filter(|&ts| ts.wrapping_sub(now) as i32 >= 0);

        let ts = next.unwrap_or_else(|| {
            let base = now
                .wrapping_add(frames_to_ms(highest_queued as u64, self.rate))
                .wrapping_add(Self::MARGIN_MS);

            if self.base.is_some() {
                log::debug!("audio stream fell behind, re-anchoring timestamps");
            }

            self.base = Some(base);
            self.frames = 0;
            base
        });

        self.frames += frames as u64;
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::crypto::Plaintext;
    use aulos_proto::TlvList;

    const RATE: u32 = 44_100;

    fn sender() -> AudioSender<Plaintext> {
        AudioSender::with_rng(SenderConfig::default(), [0; 32], Plaintext, StdRng::seed_from_u64(1))
    }

    fn stereo(frames: usize) -> Vec<i16> {
        (0..frames * 2).map(|i| i as i16).collect()
    }

    #[test]
    fn batches_carry_every_field() {
        let mut s = sender();
        s.enqueue(&stereo(400), 2, RATE, Some(1000));
        assert_eq!(s.queued_frames(), 400 + 6600);

        let first = Message::decode(&s.next_datagram(900).unwrap().unwrap()).unwrap();
        let second = Message::decode(&s.next_datagram(900).unwrap().unwrap()).unwrap();
        assert!(s.next_datagram(900).unwrap().is_none());

        assert_eq!(first.ty(), MessageType::AUDIO_DATA_IND);
        assert_eq!((first.id(), second.id()), (Some(0), Some(1)));

        let t = first.tlvs();
        assert_eq!(t.int(Tag::AUDIO_CHANNELS), Some(2));
        assert_eq!(t.int(Tag::AUDIO_RATE), Some(RATE));
        assert_eq!(t.int(Tag::AUDIO_NOF_SAMPLES), Some(330));
        assert_eq!(t.int(Tag::AUDIO_TIMESTAMP), Some(1000));
        assert_eq!(t.bytes(Tag::AUDIO_IV).map(<[u8]>::len), Some(IV_LEN));

        let data = t.bytes(Tag::AUDIO_DATA).unwrap();
        assert_eq!(data.len(), 330 * 4);
        assert_eq!(&data[..6], [0, 0, 0, 1, 0, 2]);

        let t = second.tlvs();
        assert_eq!(t.int(Tag::AUDIO_NOF_SAMPLES), Some(70));
        // 330 frames at 44.1 kHz
        assert_eq!(t.int(Tag::AUDIO_TIMESTAMP), Some(1007));

        assert_eq!(s.queued_frames(), 6600);
    }

    #[test]
    fn untimed_batches_have_no_timestamp() {
        let mut s = sender();
        s.enqueue(&stereo(10), 2, RATE, None);
        let msg = Message::decode(&s.next_datagram(0).unwrap().unwrap()).unwrap();
        assert!(msg.get(Tag::AUDIO_TIMESTAMP).is_none());
    }

    #[test]
    fn token_bucket_paces_sending() {
        let (mut a, mut b) = crate::transport::mem::pair();
        let mut s = sender();

        s.enqueue(&stereo(330 * 30), 2, RATE, None);

        // the bucket starts full
        assert_eq!(s.service(&mut a, 0).unwrap(), 20);
        assert_eq!(s.tokens(), 0);
        assert_eq!(s.service(&mut a, 5).unwrap(), 0);

        // 441 frames per 10 ms
        assert_eq!(s.service(&mut a, 10).unwrap(), 1);
        assert_eq!(s.tokens(), 111);
        assert_eq!(s.service(&mut a, 20).unwrap(), 1);
        assert_eq!(s.tokens(), 222);

        // a long silence refills the bucket
        assert_eq!(s.service(&mut a, 10_000).unwrap(), 8);
        assert_eq!(s.queued_frames(), 6600);

        let mut buf = [0; 2048];
        let mut received = 0;
        while b.try_recv(&mut buf).is_ok() {
            received += 1;
        }
        assert_eq!(received, 30);
    }

    #[test]
    fn far_future_batches_are_held() {
        let mut s = sender();
        s.enqueue(&stereo(10), 2, RATE, Some(1000));

        // the bucket covers 149 ms of audio
        assert!(s.next_datagram(850).unwrap().is_none());
        assert!(s.next_datagram(851).unwrap().is_some());
    }

    #[test]
    fn answers_sync_probes() {
        let (mut a, mut b) = crate::transport::mem::pair();
        let mut s = sender();

        let mut client = crate::sync::ClockSyncClient::<1>::default();
        let probe = client.probe(500, Some(1234));
        b.try_send(&probe.encode()).unwrap();

        assert_eq!(s.service(&mut a, 200).unwrap(), 0);
        assert_eq!(s.sync().peer_buffered(), Some(1234));

        let mut buf = [0; 256];
        let n = b.try_recv(&mut buf).unwrap();
        let rsp = Message::decode(&buf[..n]).unwrap();
        assert!(client.handle_response(&rsp, 500));
        assert_eq!(client.offset(), 300);
    }

    #[test]
    fn timestamps_follow_each_other() {
        let mut d = TimestampDispatcher::new(1000);

        assert_eq!(d.stamp(100, 0, 50), 60);
        assert_eq!(d.stamp(100, 10, 0), 160);
        assert_eq!(d.stamp(100, 150, 0), 260);

        // fell behind: anchored again
        assert_eq!(d.stamp(100, 500, 20), 530);
        assert_eq!(d.stamp(100, 500, 20), 630);

        d.reset();
        assert_eq!(d.stamp(1, 0, 0), 10);
    }
}
