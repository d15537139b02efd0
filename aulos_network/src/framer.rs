//! Incremental message framing over byte streams.
//!
//! A [`MessageReader`] reassembles complete encoded messages from arbitrarily
//! fragmented input, using the total length in each message's header. A
//! [`MessageWriter`] drains one encoded message at a time, surviving partial
//! writes. Neither looks past the header: payloads are opaque bytes until a
//! message is complete.

use aulos_proto::{HEADER_LEN, Header};
use std::io;

use crate::transport::Transport;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("declared message length {len} exceeds the {max} bytes limit")]
    TooLarge { len: usize, max: usize },
    #[error("declared message length {len} is shorter than a header")]
    TooShort { len: usize },
    #[error("connection closed by peer")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    AwaitingHeader,
    /// Total length of the message being received, header included.
    AwaitingBody(usize),
}

/// Reassembles messages from a byte stream.
#[derive(Debug)]
pub struct MessageReader {
    state: ReadState,
    buf: Vec<u8>,
    max_len: usize,
}

impl MessageReader {
    /// Creates a reader rejecting messages larger than `max_len` bytes.
    #[inline(always)]
    pub fn new(max_len: usize) -> Self {
        Self {
            state: ReadState::AwaitingHeader,
            buf: Vec::with_capacity(HEADER_LEN),
            max_len,
        }
    }

    #[inline(always)]
    fn target(&self) -> usize {
        match self.state {
            ReadState::AwaitingHeader => HEADER_LEN,
            ReadState::AwaitingBody(len) => len,
        }
    }

    /// Bytes still missing before the current stage completes.
    #[inline(always)]
    pub fn needed(&self) -> usize {
        self.target() - self.buf.len()
    }

    /// Returns `true` if no partial message is buffered.
    #[inline(always)]
    pub fn is_idle(&self) -> bool {
        self.state == ReadState::AwaitingHeader && self.buf.is_empty()
    }

    #[inline(always)]
    fn reset(&mut self) {
        self.state = ReadState::AwaitingHeader;
        self.buf.clear();
    }

    /// Moves to the next stage if the current one is complete, returning
    /// the message if it is.
    fn advance(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.needed() > 0 {
            return Ok(None);
        }

        if self.state == ReadState::AwaitingHeader {
            let len = Header::peek(&self.buf).map_or(0, |h| h.len as usize);

            if len < HEADER_LEN {
                self.reset();
                return Err(FrameError::TooShort { len });
            }

            if len > self.max_len {
                self.reset();
                return Err(FrameError::TooLarge {
                    len,
                    max: self.max_len,
                });
            }

            self.state = ReadState::AwaitingBody(len);
            self.buf.reserve_exact(len - HEADER_LEN);

            if len > HEADER_LEN {
                return Ok(None);
            }
        }

        self.state = ReadState::AwaitingHeader;
        Ok(Some(core::mem::replace(
            &mut self.buf,
            Vec::with_capacity(HEADER_LEN),
        )))
    }

    /// Consumes bytes from the front of `input` until a message completes or
    /// `input` is exhausted.
    ///
    /// Returns at most one message per call, leaving the rest of `input`
    /// untouched: call repeatedly until `input` is empty.
    pub fn feed(&mut self, input: &mut &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        let n = self.needed().min(input.len());
        let (head, tail) = input.split_at(n);

        self.buf.extend_from_slice(head);
        *input = tail;

        self.advance()
    }

    /// Receives from `transport` until a message completes or the transport
    /// would block.
    ///
    /// Never requests more bytes than the current message needs, so nothing
    /// belonging to the next message is consumed.
    pub fn read_from<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            let filled = self.buf.len();
            self.buf.resize(self.target(), 0);

            let res = transport.try_recv(&mut self.buf[filled..]);

            let n = match res {
                Ok(0) => {
                    self.buf.truncate(filled);
                    return Err(FrameError::Closed);
                }
                Ok(n) => n,
                Err(e) => {
                    self.buf.truncate(filled);
                    return if crate::io_err_is_timeout(e.kind()) {
                        Ok(None)
                    } else {
                        Err(e.into())
                    };
                }
            };

            self.buf.truncate(filled + n);

            if let Some(msg) = self.advance()? {
                return Ok(Some(msg));
            }
        }
    }
}

/// Drains one encoded message at a time into a transport.
#[derive(Debug)]
pub struct MessageWriter {
    buf: Vec<u8>,
    sent: usize,
    chunk_len: usize,
}

impl MessageWriter {
    /// Creates a writer handing at most `chunk_len` bytes to the transport per write.
    #[inline(always)]
    pub fn new(chunk_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            sent: 0,
            chunk_len: chunk_len.max(1),
        }
    }

    /// Returns `true` if a new message can be loaded.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes of the current message not written yet.
    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.sent
    }

    /// Loads an encoded message. If one is still in flight, `bytes` is handed back.
    pub fn load(&mut self, bytes: Vec<u8>) -> Result<(), Vec<u8>> {
        if !self.is_empty() {
            return Err(bytes);
        }

        self.buf = bytes;
        self.sent = 0;

        Ok(())
    }

    #[inline(always)]
    fn reset(&mut self) {
        self.buf.clear();
        self.sent = 0;
    }

    /// Writes the next chunk of the current message, returning how many bytes
    /// the transport accepted, `0` if it would block.
    ///
    /// On error, the current message is discarded.
    pub fn write_to<T: Transport + ?Sized>(&mut self, transport: &mut T) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }

        let end = self.buf.len().min(self.sent + self.chunk_len);

        match transport.try_send(&self.buf[self.sent..end]) {
            Ok(n) => {
                self.sent += n;
                if self.sent == self.buf.len() {
                    self.reset();
                }
                Ok(n)
            }
            Err(e) if crate::io_err_is_timeout(e.kind()) => Ok(0),
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mem;
    use aulos_proto::{Message, MessageType, Tag, Tlv};
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn messages() -> Vec<Message> {
        (0..20)
            .map(|i| {
                Message::new(MessageType::SET_VOLUME_REQ)
                    .with_id(i)
                    .with(Tlv::integer(Tag::VOLUME, i * 3))
                    .with(Tlv::string(Tag::NAME, "x".repeat(i as usize)))
            })
            .collect()
    }

    #[test]
    fn arbitrary_chunking_yields_every_message() {
        let msgs = messages();
        let stream: Vec<u8> = msgs.iter().flat_map(Message::encode).collect();

        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let mut reader = MessageReader::new(1 << 20);
            let mut out = Vec::new();
            let mut rest = stream.as_slice();

            while !rest.is_empty() {
                let (mut chunk, tail) = rest.split_at(rng.gen_range(1..=rest.len().min(40)));
                rest = tail;

                while !chunk.is_empty() {
                    if let Some(bytes) = reader.feed(&mut chunk).unwrap() {
                        out.push(Message::decode(&bytes).unwrap());
                    }
                }
            }

            assert_eq!(out, msgs);
            assert!(reader.is_idle());
        }
    }

    #[test]
    fn header_only_message() {
        let bytes = Message::new(MessageType::STATUS_IND).encode();
        let mut reader = MessageReader::new(64);
        assert_eq!(reader.feed(&mut bytes.as_slice()).unwrap(), Some(bytes.clone()));
    }

    #[test]
    fn declared_length_limits() {
        let mut header = Header {
            ty: MessageType::STATUS_IND,
            id: 0,
            len: 4096,
        };

        let mut reader = MessageReader::new(1024);
        assert!(matches!(
            reader.feed(&mut header.to_bytes().as_slice()),
            Err(FrameError::TooLarge { len: 4096, max: 1024 })
        ));

        header.len = 5;
        assert!(matches!(
            reader.feed(&mut header.to_bytes().as_slice()),
            Err(FrameError::TooShort { len: 5 })
        ));
        assert!(reader.is_idle());
    }

    #[test]
    fn writer_resumes_partial_writes() {
        let (a, mut b) = mem::pair();
        let mut a = a.with_max_write(5);

        let msgs = messages();
        let mut writer = MessageWriter::new(16);
        let mut reader = MessageReader::new(1 << 20);
        let mut out = Vec::new();

        for msg in &msgs {
            writer.load(msg.encode()).unwrap();
            assert!(writer.load(Vec::new()).is_err());

            while !writer.is_empty() {
                assert!(writer.write_to(&mut a).unwrap() <= 5);
            }

            while let Some(bytes) = reader.read_from(&mut b).unwrap() {
                out.push(Message::decode(&bytes).unwrap());
            }
        }

        assert_eq!(out, msgs);
    }

    #[test]
    fn closed_transport() {
        let (a, mut b) = mem::pair();
        drop(a);
        let mut reader = MessageReader::new(64);
        assert!(matches!(reader.read_from(&mut b), Err(FrameError::Closed)));
    }
}
