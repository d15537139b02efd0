//! The network side of an audio stream.
//!
//! The receiver turns `AUDIO_DATA_IND` datagrams into [`AudioFrame`]s, and
//! probes the sender's clock on the same socket so frame timestamps can be
//! translated into the local clock domain. It never blocks on the playout
//! side: when no buffer is free or the queue is full, the datagram is dropped
//! and counted.

use aulos_proto::{Message, MessageType, Tag, TlvList};
use aulos_utils::{
    Cancel,
    clock::Clock,
    pool::{self, Pool, Recycle},
    queue,
};
use core::{num::NonZeroUsize, time::Duration};
use std::{io, sync::Arc};

use super::{
    AudioFrame, DropReason, Stats,
    crypto::{Decryptor, Key},
};
use crate::{
    config::{ReceiverConfig, SyncConfig},
    sync::ClockSyncClient,
    transport::{Interest, Transport},
};

/// The playout side of a stream: queued frames, and where to return their
/// buffers once played.
#[derive(Debug)]
pub struct FrameSource {
    pub(crate) frames: queue::Rx<AudioFrame>,
    pub(crate) recycle: Recycle<Vec<i16>>,
    pub(crate) stats: Arc<Stats>,
}

impl FrameSource {
    #[inline(always)]
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Frames currently queued.
    #[inline(always)]
    pub fn queued_frames(&self) -> usize {
        self.frames.queued_weight()
    }
}

pub struct AudioReceiver<D, const WINDOW: usize = 1> {
    key: Key,
    decryptor: D,
    frames: queue::Tx<AudioFrame>,
    pool: Pool<Vec<i16>>,
    /// A buffer of a frame we couldn't queue, reused before the pool.
    spare: Option<Vec<i16>>,
    block_samples: usize,
    scratch: Vec<u8>,
    sync: ClockSyncClient<WINDOW>,
    stats: Arc<Stats>,
}

impl<D: Decryptor, const WINDOW: usize> AudioReceiver<D, WINDOW> {
    /// Creates a receiver and the [`FrameSource`] its frames are played from.
    ///
    /// All frame buffers are allocated here.
    pub fn new(
        config: &ReceiverConfig,
        sync: SyncConfig,
        key: Key,
        decryptor: D,
    ) -> (Self, FrameSource) {
        let capacity = NonZeroUsize::new(config.queue_frames).unwrap_or(NonZeroUsize::MIN);
        let (tx, rx) = queue::bounded(capacity);

        // every queued frame, plus the one being played and the spare
        let buffers = capacity.get() + 2;
        let (pool, recycle) =
            pool::recycler((0..buffers).map(|_| Vec::with_capacity(config.block_samples)));

        let stats = Arc::new(Stats::default());

        let receiver = Self {
            key,
            decryptor,
            frames: tx,
            pool,
            spare: None,
            block_samples: config.block_samples,
            scratch: Vec::with_capacity(config.block_samples * 2 + 16),
            sync: ClockSyncClient::new(sync),
            stats: stats.clone(),
        };

        let source = FrameSource {
            frames: rx,
            recycle,
            stats,
        };

        (receiver, source)
    }

    #[inline(always)]
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    #[inline(always)]
    pub fn sync(&self) -> &ClockSyncClient<WINDOW> {
        &self.sync
    }

    #[inline(always)]
    fn drop_frame(&self, reason: DropReason) {
        log::warn!("dropping audio datagram: {reason:?}");
        self.stats.record_drop(reason);
    }

    #[inline(always)]
    fn acquire(&mut self) -> Option<Vec<i16>> {
        self.spare.take().or_else(|| self.pool.acquire())
    }

    /// Processes one datagram received at `now`.
    pub fn handle_datagram(&mut self, datagram: &[u8], now: u32) {
        self.stats.record_received();

        // decoding also checks the header length against the datagram length
        let msg = match Message::decode(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("undecodable audio datagram: {e}");
                return self.drop_frame(DropReason::Malformed);
            }
        };

        match msg.ty() {
            MessageType::AUDIO_DATA_IND => self.ingest(&msg),
            MessageType::AUDIO_SYNC_RSP => {
                self.sync.handle_response(&msg, now);
            }
            ty => log::debug!("ignoring {ty} on the audio channel"),
        }
    }

    fn ingest(&mut self, msg: &Message) {
        let tlvs = msg.tlvs();

        let (Some(channels), Some(rate), Some(frames), Some(iv), Some(data)) = (
            tlvs.int(Tag::AUDIO_CHANNELS),
            tlvs.int(Tag::AUDIO_RATE),
            tlvs.int(Tag::AUDIO_NOF_SAMPLES),
            tlvs.bytes(Tag::AUDIO_IV),
            tlvs.bytes(Tag::AUDIO_DATA),
        ) else {
            return self.drop_frame(DropReason::Malformed);
        };

        let Ok(channels) = u16::try_from(channels) else {
            return self.drop_frame(DropReason::Malformed);
        };

        let samples = (frames as usize).checked_mul(channels.into());

        let samples = match samples {
            Some(n) if channels > 0 && rate > 0 && n <= self.block_samples => n,
            _ => return self.drop_frame(DropReason::Malformed),
        };

        let Some(mut buf) = self.acquire() else {
            return self.drop_frame(DropReason::NoBuffer);
        };

        self.scratch.resize(data.len(), 0);

        let decrypted = self
            .decryptor
            .decrypt(&self.key, iv, data, &mut self.scratch);

        let plain = match decrypted {
            Ok(n) if n == samples * 2 => &self.scratch[..n],
            res => {
                if let Err(e) = res {
                    log::debug!("audio payload decryption failed: {e}");
                }
                self.spare = Some(buf);
                return self.drop_frame(DropReason::Decrypt);
            }
        };

        buf.clear();
        buf.extend(
            plain
                .chunks_exact(2)
                .map(|b| i16::from_be_bytes([b[0], b[1]])),
        );

        let timestamp = tlvs
            .int(Tag::AUDIO_TIMESTAMP)
            .filter(|_| self.sync.has_valid_estimate())
            .map(|ts| self.sync.to_local(ts));

        let frame = AudioFrame {
            timestamp,
            channels,
            rate,
            samples: buf,
        };

        match self.frames.try_push(frame) {
            Ok(()) => self.stats.record_queued(),
            Err(frame) => {
                self.spare = Some(frame.samples);
                self.drop_frame(DropReason::QueueFull);
            }
        }
    }

    /// Returns a clock sync probe if one is due, reporting how many frames
    /// are queued locally.
    pub fn poll_sync(&mut self, now: u32) -> Option<Message> {
        let queued = u32::try_from(self.frames.queued_weight()).unwrap_or(u32::MAX);
        self.sync.poll(now, Some(queued))
    }

    /// Receives datagrams from `transport` until cancelled or the transport
    /// fails.
    pub fn run<T: Transport, C: Clock>(
        mut self,
        mut transport: T,
        clock: C,
        cancel: Cancel,
    ) -> io::Result<()> {
        let mut buf = vec![0; 1 << 16];
        let timeout = Duration::from_millis(self.sync_poll_ms().into());

        while !cancel.is_cancelled() {
            if let Some(probe) = self.poll_sync(clock.now_ms()) {
                match transport.try_send(&probe.encode()) {
                    Ok(_) => {}
                    Err(e) if crate::io_err_is_timeout(e.kind()) => {}
                    // the peer isn't known until it sends us something
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                    Err(e) => return Err(e),
                }
            }

            if !transport.wait(Interest::READ, timeout)?.readable {
                continue;
            }

            loop {
                match transport.try_recv(&mut buf) {
                    Ok(0) => return Ok(()),
                    Ok(n) => self.handle_datagram(&buf[..n], clock.now_ms()),
                    Err(e) if crate::io_err_is_timeout(e.kind()) => break,
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(())
    }

    #[inline(always)]
    fn sync_poll_ms(&self) -> u32 {
        self.sync.config().cooldown_ms.max(1)
    }
}
