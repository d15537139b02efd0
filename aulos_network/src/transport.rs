//! Non-blocking transports.
//!
//! Every worker loop in this crate is driven through the [`Transport`] trait:
//! it waits for readiness with a bounded timeout, then performs non-blocking
//! sends and receives until the transport would block.

use core::{net::SocketAddr, time::Duration};
use std::{
    io::{self, Read, Write},
    net::{TcpStream, UdpSocket},
};

/// What a [`Transport::wait`] caller is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Self = Self {
        read: true,
        write: false,
    };

    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };
}

/// Outcome of a [`Transport::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// A receive won't block. It may report the transport as closed.
    pub readable: bool,
    pub writable: bool,
}

/// A non-blocking, bidirectional transport.
pub trait Transport {
    /// Sends as much of `buf` as possible without blocking.
    ///
    /// Returns an error of kind [`WouldBlock`](io::ErrorKind::WouldBlock)
    /// if no progress could be made.
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Receives into `buf` without blocking.
    ///
    /// Returns `Ok(0)` if the transport was closed by the peer, and an error of
    /// kind [`WouldBlock`](io::ErrorKind::WouldBlock) if there is nothing to
    /// receive.
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Blocks until the transport is ready for one of the operations in
    /// `interest`, or until `timeout` elapses.
    fn wait(&mut self, interest: Interest, timeout: Duration) -> io::Result<Readiness>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    #[inline(always)]
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).try_send(buf)
    }

    #[inline(always)]
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).try_recv(buf)
    }

    #[inline(always)]
    fn wait(&mut self, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
        (**self).wait(interest, timeout)
    }
}

/// Sockets can't wait on a zero timeout.
#[inline(always)]
fn socket_timeout(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

/// A TCP control connection.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Wraps `stream`, switching it to non-blocking mode.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    #[inline(always)]
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Blocks on a one byte peek, which reports readability, closure included.
    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        let res = match timeout {
            None => self.stream.peek(&mut [0]),
            Some(timeout) => {
                self.stream.set_nonblocking(false)?;
                self.stream.set_read_timeout(Some(socket_timeout(timeout)))?;
                let res = self.stream.peek(&mut [0]);
                self.stream.set_nonblocking(true)?;
                res
            }
        };

        match res {
            Ok(_) => Ok(true),
            Err(e) if crate::io_err_is_timeout(e.kind()) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Transport for TcpTransport {
    #[inline(always)]
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    #[inline(always)]
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn wait(&mut self, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
        // std has no write readiness: a stream is reported writable whenever
        // the caller has something to write, and callers back off themselves
        // once a send would block.
        if interest.write {
            return Ok(Readiness {
                readable: interest.read && self.wait_readable(None)?,
                writable: true,
            });
        }

        Ok(Readiness {
            readable: interest.read && self.wait_readable(Some(timeout))?,
            writable: false,
        })
    }
}

/// A UDP socket talking to a single peer.
///
/// The peer is either given up front, or learned from the first datagram
/// received. Datagrams from other addresses are discarded.
#[derive(Debug)]
pub struct UdpTransport {
    sock: UdpSocket,
    peer: Option<SocketAddr>,
}

impl UdpTransport {
    /// Wraps `sock`, sending to `peer`.
    pub fn connect(sock: UdpSocket, peer: SocketAddr) -> io::Result<Self> {
        sock.set_nonblocking(true)?;
        Ok(Self {
            sock,
            peer: Some(peer),
        })
    }

    /// Wraps `sock`, adopting the source of the first received datagram as peer.
    pub fn learn(sock: UdpSocket) -> io::Result<Self> {
        sock.set_nonblocking(true)?;
        Ok(Self { sock, peer: None })
    }

    #[inline(always)]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[inline(always)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }
}

impl Transport for UdpTransport {
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let peer = self.peer.ok_or(io::ErrorKind::NotConnected)?;
        self.sock.send_to(buf, peer)
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let (n, from) = self.sock.recv_from(buf)?;

            match self.peer {
                None => self.peer = Some(from),
                Some(peer) if peer != from => continue,
                Some(_) => {}
            }

            // a datagram socket never closes, and zero means closed to our callers
            if n > 0 {
                return Ok(n);
            }
        }
    }

    fn wait(&mut self, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
        if interest.write {
            return Ok(Readiness {
                readable: false,
                writable: true,
            });
        }

        if !interest.read {
            return Ok(Readiness::default());
        }

        self.sock.set_nonblocking(false)?;
        self.sock.set_read_timeout(Some(socket_timeout(timeout)))?;
        let res = self.sock.peek_from(&mut [0]);
        self.sock.set_nonblocking(true)?;

        match res {
            Ok(_) => Ok(Readiness {
                readable: true,
                writable: false,
            }),
            Err(e) if crate::io_err_is_timeout(e.kind()) => Ok(Readiness::default()),
            Err(e) => Err(e),
        }
    }
}

pub mod mem {
    //! An in-memory transport pair, for tests and in-process peers.
    //!
    //! Every [`try_send`](super::Transport::try_send) call delivers one chunk,
    //! so, with a large enough receive buffer, each chunk is also received
    //! whole: the pair works both as a byte stream and as a datagram link.

    use super::*;
    use crossbeam::channel;

    #[derive(Debug)]
    pub struct MemTransport {
        tx: channel::Sender<Vec<u8>>,
        rx: channel::Receiver<Vec<u8>>,
        /// Partially received chunk, and how much of it was consumed.
        pending: Vec<u8>,
        pos: usize,
        max_write: Option<usize>,
    }

    /// Creates two connected transports.
    pub fn pair() -> (MemTransport, MemTransport) {
        let (a_tx, b_rx) = channel::unbounded();
        let (b_tx, a_rx) = channel::unbounded();

        let new = |tx, rx| MemTransport {
            tx,
            rx,
            pending: Vec::new(),
            pos: 0,
            max_write: None,
        };

        (new(a_tx, a_rx), new(b_tx, b_rx))
    }

    impl MemTransport {
        /// Caps the bytes accepted per send, simulating short writes.
        #[inline(always)]
        pub fn with_max_write(mut self, max: usize) -> Self {
            self.max_write = Some(max.max(1));
            self
        }

        #[inline(always)]
        fn has_pending(&self) -> bool {
            self.pos < self.pending.len()
        }

        #[inline(always)]
        fn set_pending(&mut self, chunk: Vec<u8>) {
            self.pending = chunk;
            self.pos = 0;
        }
    }

    impl Transport for MemTransport {
        fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self.max_write.map_or(buf.len(), |max| buf.len().min(max));

            self.tx
                .send(buf[..n].to_vec())
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;

            Ok(n)
        }

        fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.has_pending() {
                match self.rx.try_recv() {
                    Ok(chunk) => self.set_pending(chunk),
                    Err(channel::TryRecvError::Empty) => {
                        return Err(io::ErrorKind::WouldBlock.into());
                    }
                    Err(channel::TryRecvError::Disconnected) => return Ok(0),
                }
            }

            let src = &self.pending[self.pos..];
            let n = src.len().min(buf.len());
            buf[..n].copy_from_slice(&src[..n]);
            self.pos += n;

            Ok(n)
        }

        fn wait(&mut self, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
            let writable = interest.write;

            if !interest.read || self.has_pending() {
                return Ok(Readiness {
                    readable: interest.read,
                    writable,
                });
            }

            let res = if writable {
                self.rx.try_recv().map_err(|e| e.is_disconnected())
            } else {
                self.rx.recv_timeout(timeout).map_err(|e| e.is_disconnected())
            };

            let readable = match res {
                Ok(chunk) => {
                    self.set_pending(chunk);
                    true
                }
                // let the next receive report the closure
                Err(disconnected) => disconnected,
            };

            Ok(Readiness { readable, writable })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn chunks_and_closure() {
            let (a, mut b) = pair();
            let mut a = a.with_max_write(3);

            assert_eq!(a.try_send(b"hello").unwrap(), 3);
            assert_eq!(a.try_send(b"lo").unwrap(), 2);

            let mut buf = [0; 2];
            assert_eq!(b.try_recv(&mut buf).unwrap(), 2);
            assert_eq!(&buf, b"he");
            assert_eq!(b.try_recv(&mut buf).unwrap(), 1);
            assert_eq!(b.try_recv(&mut buf).unwrap(), 2);
            assert_eq!(&buf, b"lo");

            let err = b.try_recv(&mut buf).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

            drop(a);
            let ready = b.wait(Interest::READ, Duration::from_millis(10)).unwrap();
            assert!(ready.readable);
            assert_eq!(b.try_recv(&mut buf).unwrap(), 0);
        }

        #[test]
        fn wait_times_out() {
            let (_a, mut b) = pair();
            let ready = b.wait(Interest::READ, Duration::from_millis(5)).unwrap();
            assert_eq!(ready, Readiness::default());
        }
    }
}
