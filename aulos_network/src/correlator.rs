//! Request/response correlation and the per-connection worker loop.
//!
//! Every outgoing request gets a correlation id from a wrapping per-connection
//! counter, and is remembered, along with who sent it, until a response
//! carrying the same id arrives. Anything else arriving on the connection,
//! indications and responses nobody waits for, is forwarded as an [`Event`].
//!
//! A connection is split in two:
//!
//! - a [`Messenger`], a cheaply clonable handle through which any thread
//!   queues messages,
//! - a [`Connection`], the worker owning the transport, to be run on its own
//!   thread.
//!
//! ```ignore
//! let (conn, messenger, events) = correlator::connection(transport, &config, cancel.clone());
//! std::thread::spawn(move || conn.run());
//!
//! messenger.queue_request(Message::new(MessageType::GET_STATUS_REQ), &handler, ())?;
//! ```
//!
//! Pending requests are dropped silently when the connection goes down:
//! callers needing a guaranteed answer must apply their own timeout.

use aulos_proto::{Message, message::ID_UNSET};
use aulos_utils::Cancel;
use core::time::Duration;
use crossbeam::channel;
use rustc_hash::FxHashMap;
use std::{
    io,
    sync::{Arc, Weak},
};

use crate::{
    config::ConnectionConfig,
    framer::{FrameError, MessageReader, MessageWriter},
    transport::{Interest, Transport},
};

/// Receives the responses to the requests it sent.
///
/// `Cx` is an opaque context given when queuing the request, and handed back
/// with its response.
pub trait ResponseHandler<Cx>: Send + Sync {
    fn on_response(&self, response: Message, request: Message, cx: Cx);
}

/// What a connection reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ConnectionUp,
    ConnectionDown,
    /// An indication, an incoming request, or a response no one waits for.
    Message(Message),
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("only requests can be correlated, got {0}")]
    NotARequest(Message),
    #[error("response has no correlation id: {0}")]
    MissingId(Message),
    #[error("connection is down")]
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

struct Pending<Cx> {
    request: Message,
    handler: Weak<dyn ResponseHandler<Cx>>,
    cx: Cx,
}

/// A response matched with the request it answers.
pub struct Completion<Cx> {
    pub response: Message,
    pub request: Message,
    handler: Weak<dyn ResponseHandler<Cx>>,
    cx: Cx,
}

impl<Cx> Completion<Cx> {
    /// Hands the response to its handler.
    ///
    /// Returns `false`, dropping the response, if the handler is gone.
    pub fn deliver(self) -> bool {
        let Some(handler) = self.handler.upgrade() else {
            log::warn!("handler of {} is gone, dropping {}", self.request, self.response);
            return false;
        };

        handler.on_response(self.response, self.request, self.cx);
        true
    }
}

/// Where an incoming message goes.
pub enum Routed<Cx> {
    Matched(Completion<Cx>),
    Unsolicited(Message),
}

/// Pending request bookkeeping of one connection.
pub struct Correlator<Cx> {
    next_id: u32,
    pending: FxHashMap<u32, Pending<Cx>>,
}

impl<Cx> Default for Correlator<Cx> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<Cx> Correlator<Cx> {
    #[inline(always)]
    pub fn new(first_id: u32) -> Self {
        Self {
            next_id: first_id,
            pending: FxHashMap::default(),
        }
    }

    /// Number of requests awaiting a response.
    #[inline(always)]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Stamps `request` with the next correlation id, and returns it.
    ///
    /// Returns `None` if `request` isn't a request.
    pub fn assign(&mut self, request: &mut Message) -> Option<u32> {
        if !request.ty().is_request() {
            return None;
        }

        // the sentinel would read as "no id" on the other end
        if self.next_id == ID_UNSET {
            self.next_id = self.next_id.wrapping_add(1);
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        request.set_id(Some(id));
        Some(id)
    }

    /// Remembers `request` until its response is [resolved](Self::resolve).
    pub fn track(&mut self, id: u32, request: Message, handler: Weak<dyn ResponseHandler<Cx>>, cx: Cx) {
        let prev = self.pending.insert(
            id,
            Pending {
                request,
                handler,
                cx,
            },
        );

        if let Some(prev) = prev {
            // only happens after 2^32 requests without an answer
            log::warn!("correlation id {id} reused, forgetting {}", prev.request);
        }
    }

    /// Matches `msg` with its pending request, if it is a response to one.
    pub fn resolve(&mut self, msg: Message) -> Routed<Cx> {
        let entry = msg
            .ty()
            .is_response()
            .then(|| msg.id())
            .flatten()
            .and_then(|id| self.pending.remove(&id));

        match entry {
            Some(Pending {
                request,
                handler,
                cx,
            }) => Routed::Matched(Completion {
                response: msg,
                request,
                handler,
                cx,
            }),
            None => Routed::Unsolicited(msg),
        }
    }

    /// Forgets every pending request, without notifying anyone.
    pub fn clear(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}

struct Shared<Cx> {
    correlator: parking_lot::Mutex<Correlator<Cx>>,
    outbound: channel::Sender<Vec<u8>>,
}

/// A handle for queuing messages on a [`Connection`].
pub struct Messenger<Cx> {
    shared: Arc<Shared<Cx>>,
}

impl<Cx> Clone for Messenger<Cx> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<Cx> Messenger<Cx> {
    /// Queues `request`, assigning it a correlation id, and returns that id.
    ///
    /// Its response, if any, is handed to `handler`, unless it has been
    /// dropped by then.
    pub fn queue_request<H>(&self, mut request: Message, handler: &Arc<H>, cx: Cx) -> Result<u32, QueueError>
    where
        H: ResponseHandler<Cx> + 'static,
    {
        let handler: Arc<dyn ResponseHandler<Cx>> = handler.clone();
        let mut correlator = self.shared.correlator.lock();

        let Some(id) = correlator.assign(&mut request) else {
            return Err(QueueError::NotARequest(request));
        };

        // ids must hit the wire in the order they were assigned
        self.shared
            .outbound
            .send(request.encode())
            .map_err(|_| QueueError::Disconnected)?;

        correlator.track(id, request, Arc::downgrade(&handler), cx);

        Ok(id)
    }

    /// Queues a message without expecting an answer.
    ///
    /// Responses must carry the id of the request they answer.
    pub fn queue_message(&self, msg: Message) -> Result<(), QueueError> {
        if msg.ty().is_response() && msg.id().is_none() {
            return Err(QueueError::MissingId(msg));
        }

        self.shared
            .outbound
            .send(msg.encode())
            .map_err(|_| QueueError::Disconnected)
    }

    /// Number of requests awaiting a response.
    #[inline(always)]
    pub fn pending(&self) -> usize {
        self.shared.correlator.lock().pending()
    }

    #[inline(always)]
    fn resolve(&self, msg: Message) -> Routed<Cx> {
        self.shared.correlator.lock().resolve(msg)
    }

    #[inline(always)]
    fn clear(&self) -> usize {
        self.shared.correlator.lock().clear()
    }
}

/// The worker driving one connection.
pub struct Connection<T, Cx> {
    transport: T,
    reader: MessageReader,
    writer: MessageWriter,
    outbound: channel::Receiver<Vec<u8>>,
    messenger: Messenger<Cx>,
    events: channel::Sender<Event>,
    poll: Duration,
    /// Wait timeout while nothing is being written, bounding how long a newly
    /// queued message sits in the outbound queue.
    queue_check: Duration,
    cancel: Cancel,
}

/// Sets up a connection over `transport`.
///
/// Returns the worker, a handle to queue messages through, and the stream of
/// events reported by the worker.
pub fn connection<T: Transport, Cx>(
    transport: T,
    config: &ConnectionConfig,
    cancel: Cancel,
) -> (Connection<T, Cx>, Messenger<Cx>, channel::Receiver<Event>) {
    let (out_tx, out_rx) = channel::unbounded();
    let (ev_tx, ev_rx) = channel::unbounded();

    let poll = Duration::from_millis(config.poll_ms.into());

    let messenger = Messenger {
        shared: Arc::new(Shared {
            correlator: parking_lot::Mutex::new(Correlator::default()),
            outbound: out_tx,
        }),
    };

    let conn = Connection {
        transport,
        reader: MessageReader::new(config.max_message_len),
        writer: MessageWriter::new(config.write_chunk_len),
        outbound: out_rx,
        messenger: messenger.clone(),
        events: ev_tx,
        poll,
        queue_check: poll.min(Duration::from_millis(config.queue_check_ms.into())),
        cancel,
    };

    (conn, messenger, ev_rx)
}

impl<T: Transport, Cx> Connection<T, Cx> {
    /// Runs the connection until it is cancelled, closed by the peer, or fails.
    ///
    /// Reports [`Event::ConnectionUp`] when starting and [`Event::ConnectionDown`]
    /// when done, after discarding every pending request.
    pub fn run(mut self) -> Result<(), ConnectionError> {
        let _ = self.events.send(Event::ConnectionUp);

        let res = match self.drive() {
            Err(ConnectionError::Frame(FrameError::Closed)) => {
                log::debug!("connection closed by peer");
                Ok(())
            }
            res => res,
        };

        if let Err(e) = &res {
            log::error!("connection failed: {e}");
        }

        // from here on, queuing fails instead of leaving requests pending
        drop(self.outbound);

        let discarded = self.messenger.clear();
        if discarded > 0 {
            log::debug!("discarded {discarded} pending requests");
        }

        let _ = self.events.send(Event::ConnectionDown);

        res
    }

    fn drive(&mut self) -> Result<(), ConnectionError> {
        // the transport refused our last write
        let mut blocked = false;

        while !self.cancel.is_cancelled() {
            if self.writer.is_empty() {
                if let Ok(bytes) = self.outbound.try_recv() {
                    // can't fail, the writer is empty
                    let _ = self.writer.load(bytes);
                }
            }

            // a refused write is retried after a whole polling period
            let (interest, timeout) = if self.writer.is_empty() {
                (Interest::READ, self.queue_check)
            } else if blocked {
                (Interest::READ, self.poll)
            } else {
                (Interest::READ_WRITE, self.poll)
            };

            let ready = self.transport.wait(interest, timeout)?;

            if ready.writable || blocked {
                let written = self.writer.write_to(&mut self.transport)?;
                blocked = written == 0 && !self.writer.is_empty();
            }

            if ready.readable {
                while let Some(bytes) = self.reader.read_from(&mut self.transport)? {
                    self.dispatch(&bytes);
                }
            }
        }

        Ok(())
    }

    fn dispatch(&self, bytes: &[u8]) {
        let msg = match Message::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("dropping malformed message: {e}");
                return;
            }
        };

        if msg.had_unknown_tlv() {
            log::debug!("{msg} carried unknown tlvs");
        }

        match self.messenger.resolve(msg) {
            Routed::Matched(completion) => {
                completion.deliver();
            }
            Routed::Unsolicited(msg) => {
                if msg.ty().is_response() {
                    log::warn!("unmatched response {msg}");
                }
                let _ = self.events.send(Event::Message(msg));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Readiness, mem};
    use aulos_proto::{MessageType, Tag, Tlv, TlvList, media};
    use parking_lot::Mutex;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Instant,
    };

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(Message, Message, u32)>>);

    impl ResponseHandler<u32> for Recorder {
        fn on_response(&self, response: Message, request: Message, cx: u32) {
            self.0.lock().push((response, request, cx));
        }
    }

    fn weak(h: &Arc<Recorder>) -> Weak<dyn ResponseHandler<u32>> {
        let h: Arc<dyn ResponseHandler<u32>> = h.clone();
        Arc::downgrade(&h)
    }

    #[test]
    fn responses_reach_their_requester() {
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let mut correlator = Correlator::<u32>::new(5);

        let mut ids = Vec::new();
        for (h, cx) in [(&a, 1), (&b, 2)] {
            let mut req = Message::new(MessageType::GET_STATUS_REQ);
            let id = correlator.assign(&mut req).unwrap();
            correlator.track(id, req, weak(h), cx);
            ids.push(id);
        }
        assert_eq!(ids, [5, 6]);

        let rsp = Message::new(MessageType::GET_STATUS_RSP).with_id(6);
        let Routed::Matched(c) = correlator.resolve(rsp) else {
            panic!("unmatched");
        };
        assert!(c.deliver());

        assert!(a.0.lock().is_empty());
        let got = b.0.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1.id(), Some(6));
        assert_eq!(got[0].2, 2);
        assert_eq!(correlator.pending(), 1);
    }

    #[test]
    fn unknown_ids_and_indications_are_unsolicited() {
        let mut correlator = Correlator::<u32>::default();

        let stray = Message::new(MessageType::GET_STATUS_RSP).with_id(42);
        assert!(matches!(correlator.resolve(stray), Routed::Unsolicited(_)));

        let ind = Message::new(MessageType::STATUS_IND).with_id(0);
        assert!(matches!(correlator.resolve(ind), Routed::Unsolicited(_)));

        let mut ind = Message::new(MessageType::STATUS_IND);
        assert!(correlator.assign(&mut ind).is_none());
    }

    #[test]
    fn ids_wrap_around_the_sentinel() {
        let mut correlator = Correlator::<()>::new(ID_UNSET - 1);
        let mut req = Message::new(MessageType::HELLO_REQ);
        assert_eq!(correlator.assign(&mut req), Some(ID_UNSET - 1));
        assert_eq!(correlator.assign(&mut req), Some(0));
    }

    #[test]
    fn dropped_handlers_are_skipped() {
        let h = Arc::new(Recorder::default());
        let mut correlator = Correlator::<u32>::default();

        let mut req = Message::new(MessageType::PLAY_REQ);
        let id = correlator.assign(&mut req).unwrap();
        correlator.track(id, req, weak(&h), 0);
        drop(h);

        let rsp = Message::new(MessageType::PLAY_RSP).with_id(id);
        let Routed::Matched(c) = correlator.resolve(rsp) else {
            panic!("unmatched");
        };
        assert!(!c.deliver());
    }

    #[test]
    fn messenger_rejects_bad_messages() {
        let (conn, messenger, _events) =
            connection::<_, u32>(crate::transport::mem::pair().0, &Default::default(), Cancel::new());
        let h = Arc::new(Recorder::default());

        let ind = Message::new(MessageType::STATUS_IND);
        assert!(matches!(
            messenger.queue_request(ind, &h, 0),
            Err(QueueError::NotARequest(_))
        ));

        let rsp = Message::new(MessageType::PLAY_RSP);
        assert!(matches!(messenger.queue_message(rsp), Err(QueueError::MissingId(_))));

        drop(conn);
        let req = Message::new(MessageType::PLAY_REQ);
        assert!(matches!(
            messenger.queue_request(req, &h, 0),
            Err(QueueError::Disconnected)
        ));
        assert_eq!(messenger.pending(), 0);
    }

    /// A minimal server answering GET_TRACKS with two tracks.
    fn serve_tracks(mut transport: crate::transport::mem::MemTransport) {
        let mut reader = MessageReader::new(1 << 20);
        let mut writer = MessageWriter::new(7);

        let bytes = loop {
            transport.wait(Interest::READ, Duration::from_secs(5)).unwrap();
            if let Some(bytes) = reader.read_from(&mut transport).unwrap() {
                break bytes;
            }
        };

        let req = Message::decode(&bytes).unwrap();
        assert_eq!(req.ty(), MessageType::GET_TRACKS_REQ);
        assert_eq!(req.tlvs().str(Tag::LINK), Some("playlist:jazz"));

        let track = |n: u32| media::Track {
            name: format!("track {n}"),
            link: format!("track:{n}"),
            duration_ms: n * 1000,
            ..Default::default()
        };

        let rsp = req
            .create_response()
            .unwrap()
            .with(track(1).to_tlv())
            .with(track(2).to_tlv());

        writer.load(rsp.encode()).unwrap();
        while !writer.is_empty() {
            writer.write_to(&mut transport).unwrap();
        }
    }

    #[test]
    fn get_tracks_over_a_connection() {
        let (client, server) = crate::transport::mem::pair();
        let server = std::thread::spawn(move || serve_tracks(server.with_max_write(3)));

        let cancel = Cancel::new();
        let config = ConnectionConfig {
            poll_ms: 5,
            ..Default::default()
        };
        let (conn, messenger, events) = connection::<_, u32>(client, &config, cancel.clone());
        let worker = std::thread::spawn(move || conn.run());

        assert_eq!(events.recv().unwrap(), Event::ConnectionUp);

        let handler = Arc::new(Recorder::default());
        let req = Message::new(MessageType::GET_TRACKS_REQ)
            .with(Tlv::string(Tag::LINK, "playlist:jazz"));

        // burn ids so the request goes out as #7
        for _ in 0..7 {
            let mut r = Message::new(MessageType::HELLO_REQ);
            messenger.shared.correlator.lock().assign(&mut r).unwrap();
        }

        let id = messenger.queue_request(req, &handler, 99).unwrap();
        assert_eq!(id, 7);

        server.join().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while handler.0.lock().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        {
            let got = handler.0.lock();
            assert_eq!(got.len(), 1);
            let (rsp, req, cx) = &got[0];

            assert_eq!(rsp.ty(), MessageType::GET_TRACKS_RSP);
            assert_eq!(rsp.id(), Some(7));
            assert_eq!(req.id(), Some(7));
            assert_eq!(req.tlvs().str(Tag::LINK), Some("playlist:jazz"));
            assert_eq!(*cx, 99);

            let names: Vec<_> = media::tracks(rsp).into_iter().map(|t| t.name).collect();
            assert_eq!(names, ["track 1", "track 2"]);
        }

        // the server hung up
        assert_eq!(worker.join().unwrap().ok(), Some(()));
        assert_eq!(events.recv().unwrap(), Event::ConnectionDown);
        assert_eq!(messenger.pending(), 0);
    }

    fn quick() -> ConnectionConfig {
        ConnectionConfig {
            poll_ms: 5,
            ..Default::default()
        }
    }

    #[test]
    fn pending_requests_are_dropped_with_the_connection() {
        let (client, mut server) = mem::pair();
        let (conn, messenger, events) = connection::<_, u32>(client, &quick(), Cancel::new());
        let worker = thread::spawn(move || conn.run());

        let handler = Arc::new(Recorder::default());
        messenger
            .queue_request(Message::new(MessageType::GET_STATUS_REQ), &handler, 1)
            .unwrap();
        assert_eq!(messenger.pending(), 1);

        // the request went out, and the peer hangs up without answering
        assert!(server.wait(Interest::READ, Duration::from_secs(5)).unwrap().readable);
        drop(server);

        assert_eq!(worker.join().unwrap().ok(), Some(()));
        assert_eq!(events.recv().unwrap(), Event::ConnectionUp);
        assert_eq!(events.recv().unwrap(), Event::ConnectionDown);

        assert_eq!(messenger.pending(), 0);
        assert!(handler.0.lock().is_empty());

        let late = Message::new(MessageType::GET_STATUS_REQ);
        assert!(matches!(
            messenger.queue_request(late, &handler, 2),
            Err(QueueError::Disconnected)
        ));
        assert_eq!(messenger.pending(), 0);
    }

    #[test]
    fn malformed_messages_are_skipped() {
        let (client, mut server) = mem::pair();
        let cancel = Cancel::new();
        let (conn, _messenger, events) = connection::<_, u32>(client, &quick(), cancel.clone());
        let worker = thread::spawn(move || conn.run());
        assert_eq!(events.recv().unwrap(), Event::ConnectionUp);

        // correctly framed, but its only tlv claims more bytes than there are
        let mut bad = Message::new(MessageType::STATUS_IND)
            .with(Tlv::integer(Tag::VOLUME, 1))
            .encode();
        bad[16..20].copy_from_slice(&0xffffu32.to_be_bytes());

        let good = Message::new(MessageType::STATUS_IND).with(Tlv::integer(Tag::VOLUME, 2));

        server.try_send(&bad).unwrap();
        server.try_send(&good.encode()).unwrap();

        let Event::Message(msg) = events.recv_timeout(Duration::from_secs(5)).unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(msg.tlvs().int(Tag::VOLUME), Some(2));

        cancel.cancel();
        assert_eq!(worker.join().unwrap().ok(), Some(()));
        assert_eq!(events.recv().unwrap(), Event::ConnectionDown);
    }

    #[test]
    fn idle_connections_write_promptly() {
        let (client, mut server) = mem::pair();
        let cancel = Cancel::new();
        let config = ConnectionConfig {
            poll_ms: 2000,
            ..Default::default()
        };
        let (conn, messenger, events) = connection::<_, u32>(client, &config, cancel.clone());
        let worker = thread::spawn(move || conn.run());
        assert_eq!(events.recv().unwrap(), Event::ConnectionUp);

        // let the worker settle in its wait
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        messenger.queue_message(Message::new(MessageType::STATUS_IND)).unwrap();
        assert!(server.wait(Interest::READ, Duration::from_secs(5)).unwrap().readable);
        assert!(start.elapsed() < Duration::from_millis(500));

        cancel.cancel();
        assert_eq!(worker.join().unwrap().ok(), Some(()));
    }

    /// A transport whose peer stopped reading: every send would block. Like
    /// [`TcpTransport`](crate::transport::TcpTransport), it reports itself
    /// writable whenever asked to.
    #[derive(Default)]
    struct Stalled {
        sends: Arc<AtomicUsize>,
    }

    impl Transport for Stalled {
        fn try_send(&mut self, _: &[u8]) -> io::Result<usize> {
            self.sends.fetch_add(1, Ordering::Relaxed);
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn try_recv(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn wait(&mut self, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
            if interest.write {
                return Ok(Readiness {
                    readable: false,
                    writable: true,
                });
            }

            thread::sleep(timeout);
            Ok(Readiness::default())
        }
    }

    #[test]
    fn refused_writes_are_retried_once_per_poll() {
        let transport = Stalled::default();
        let sends = transport.sends.clone();

        let cancel = Cancel::new();
        let config = ConnectionConfig {
            poll_ms: 20,
            ..Default::default()
        };
        let (conn, messenger, _events) = connection::<_, u32>(transport, &config, cancel.clone());
        let worker = thread::spawn(move || conn.run());

        messenger.queue_message(Message::new(MessageType::STATUS_IND)).unwrap();
        thread::sleep(Duration::from_millis(200));

        cancel.cancel();
        assert_eq!(worker.join().unwrap().ok(), Some(()));

        // about one attempt per 20 ms
        let sends = sends.load(Ordering::Relaxed);
        assert!((1..=20).contains(&sends), "{sends} write attempts");
    }
}
