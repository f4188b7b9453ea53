//! One TCP connection and its read/write state machines.
//!
//! A connection starts life as a [`PendingLink`], which owns a blocking socket
//! and only offers the blocking primitives needed by the connect handshake.
//! [`PendingLink::establish`] switches the socket to non-blocking mode and
//! turns it into a shared [`Link`], which the worker drives from epoll events.
//!
//! Lock order inside a `Link` is `recv` or `send` first, then `io`. The `io`
//! slot holds the socket and the epoll registration; `close()` empties it
//! exactly once.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::TransportOptions;
use crate::epoll::{Epoll, READ_INTEREST, WRITE_INTEREST};
use crate::error::{Result, TransportError};
use crate::framing::{classify_io, PollIn, RecvState};
use crate::protocol::{
    ConnectRequest, ConnectResponse, MessageHeader, MessageType, CONNECT_REQUEST_LEN,
    CONNECT_RESPONSE_LEN,
};
use crate::queue::{PollOut, QueueEntry, SendQueue};
use crate::socket::LinkSocket;
use crate::tls::TlsSession;

/// Process-unique link identifier, also used as the epoll token.
pub type LinkId = u64;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

fn next_link_id() -> LinkId {
    NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed)
}

const STATE_CONNECTING: u8 = 0;
const STATE_ESTABLISHED: u8 = 1;
const STATE_BROKEN: u8 = 2;

/// Lifecycle of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Established,
    Broken,
}

impl From<u8> for LinkState {
    fn from(raw: u8) -> Self {
        match raw {
            STATE_CONNECTING => LinkState::Connecting,
            STATE_ESTABLISHED => LinkState::Established,
            _ => LinkState::Broken,
        }
    }
}

impl From<LinkState> for u8 {
    fn from(state: LinkState) -> Self {
        match state {
            LinkState::Connecting => STATE_CONNECTING,
            LinkState::Established => STATE_ESTABLISHED,
            LinkState::Broken => STATE_BROKEN,
        }
    }
}

/// A connection in its handshake phase.
#[derive(Debug)]
pub struct PendingLink {
    id: LinkId,
    peer: String,
    rank: u64,
    socket: LinkSocket,
}

impl PendingLink {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id: next_link_id(),
            peer: peer.to_string(),
            rank: 0,
            socket: LinkSocket::new(stream, None),
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn rank(&self) -> u64 {
        self.rank
    }

    pub fn set_rank(&mut self, rank: u64) {
        self.rank = rank;
    }

    pub fn stream(&self) -> &TcpStream {
        self.socket.stream()
    }

    pub fn set_tls(&mut self, tls: Box<dyn TlsSession>) {
        self.socket.set_tls(tls);
    }

    pub fn set_timeouts(&self, timeout: Option<Duration>) -> Result<()> {
        self.socket.set_timeouts(timeout)
    }

    pub fn block_send(&mut self, data: &[u8]) -> Result<()> {
        self.socket.block_send(data)
    }

    pub fn block_recv(&mut self, buf: &mut [u8]) -> Result<()> {
        self.socket.block_recv(buf)
    }

    pub fn send_connect_request(&mut self, request: &ConnectRequest) -> Result<()> {
        self.block_send(&request.encode())
    }

    pub fn recv_connect_request(&mut self) -> Result<ConnectRequest> {
        let mut raw = [0u8; CONNECT_REQUEST_LEN];
        self.block_recv(&mut raw)?;
        Ok(ConnectRequest::decode(&raw))
    }

    pub fn send_connect_response(&mut self, response: &ConnectResponse) -> Result<()> {
        self.block_send(&response.encode())
    }

    pub fn recv_connect_response(&mut self) -> Result<ConnectResponse> {
        let mut raw = [0u8; CONNECT_RESPONSE_LEN];
        self.block_recv(&mut raw)?;
        Ok(ConnectResponse::decode(&raw))
    }

    /// Switches to non-blocking I/O and hands the socket to a shared [`Link`].
    pub fn establish(self, options: &TransportOptions) -> Result<Arc<Link>> {
        self.socket.set_timeouts(None)?;
        self.socket.set_nonblocking(true)?;
        self.socket.apply_keepalive(&options.keepalive)?;
        self.socket.stream().set_nodelay(true)?;

        let tls = self.socket.is_tls();
        let link = Link {
            id: self.id,
            peer: self.peer,
            rank: self.rank,
            tls,
            max_body_len: options.max_body_len,
            state: AtomicU8::new(STATE_ESTABLISHED),
            io: Mutex::new(Some(LinkIo {
                socket: self.socket,
                poller: None,
            })),
            recv: Mutex::new(RecvState::new(options.max_body_len)),
            send: Mutex::new(SendQueue::new(options.send_queue_depth)),
            next_seq: AtomicU32::new(1),
            worker: AtomicUsize::new(NO_WORKER),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
        };
        tracing::debug!(link_id = link.id, peer = %link.peer, rank = link.rank, tls, "link established");
        Ok(Arc::new(link))
    }
}

const NO_WORKER: usize = usize::MAX;

struct LinkIo {
    socket: LinkSocket,
    poller: Option<Arc<Epoll>>,
}

/// An established connection shared between a worker and senders.
pub struct Link {
    id: LinkId,
    peer: String,
    rank: u64,
    tls: bool,
    max_body_len: usize,
    state: AtomicU8,
    io: Mutex<Option<LinkIo>>,
    recv: Mutex<RecvState>,
    send: Mutex<SendQueue>,
    next_seq: AtomicU32,
    worker: AtomicUsize,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("rank", &self.rank)
            .field("state", &self.state())
            .finish()
    }
}

impl Link {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Rank announced by the peer during the handshake.
    pub fn rank(&self) -> u64 {
        self.rank
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn state(&self) -> LinkState {
        LinkState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_broken(&self) -> bool {
        self.state() == LinkState::Broken
    }

    /// Marks the link broken; returns `true` for exactly one caller.
    pub fn break_link(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == STATE_BROKEN {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                STATE_BROKEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Index of the worker that owns this link, if any.
    pub fn worker_index(&self) -> Option<usize> {
        match self.worker.load(Ordering::Acquire) {
            NO_WORKER => None,
            index => Some(index),
        }
    }

    pub(crate) fn set_worker_index(&self, index: Option<usize>) {
        self.worker.store(index.unwrap_or(NO_WORKER), Ordering::Release);
    }

    pub fn queue_len(&self) -> usize {
        self.send.lock().len()
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.recv.lock().dropped_frames()
    }

    fn interest(queue: &SendQueue, io: &LinkIo) -> u32 {
        if !queue.is_empty() || io.socket.wants_write() {
            READ_INTEREST | WRITE_INTEREST
        } else {
            READ_INTEREST
        }
    }

    /// Registers the socket with `poller` under this link's id.
    pub(crate) fn attach(&self, poller: Arc<Epoll>) -> Result<()> {
        let queue = self.send.lock();
        let mut io = self.io.lock();
        let io = io.as_mut().ok_or(TransportError::LinkBroken)?;
        poller.add(io.socket.fd(), self.id, Self::interest(&queue, io))?;
        io.poller = Some(poller);
        Ok(())
    }

    /// Removes the socket from its poller, if registered.
    pub(crate) fn detach(&self) {
        let mut io = self.io.lock();
        if let Some(io) = io.as_mut() {
            if let Some(poller) = io.poller.take() {
                if let Err(err) = poller.delete(io.socket.fd()) {
                    tracing::debug!(link_id = self.id, error = %err, "epoll delete failed");
                }
            }
        }
    }

    /// Re-arms epoll interest from the current queue state.
    pub fn rearm(&self) -> Result<()> {
        let queue = self.send.lock();
        let io = self.io.lock();
        match io.as_ref() {
            Some(io) => Self::modify_locked(self.id, &queue, io),
            None => Err(TransportError::LinkBroken),
        }
    }

    fn modify_locked(id: LinkId, queue: &SendQueue, io: &LinkIo) -> Result<()> {
        if let Some(poller) = io.poller.as_ref() {
            poller.modify(io.socket.fd(), id, Self::interest(queue, io))?;
        }
        Ok(())
    }

    /// Queues a message; the owning worker writes it when the socket allows.
    ///
    /// Returns the sequence number stamped into the header.
    pub fn enqueue(&self, msg_type: MessageType, result: i16, body: Bytes, context: Option<Bytes>) -> Result<u32> {
        if body.len() > self.max_body_len {
            return Err(TransportError::BodyTooLarge {
                size: body.len(),
                max_size: self.max_body_len,
            });
        }
        let mut queue = self.send.lock();
        let io = self.io.lock();
        let io = match io.as_ref() {
            Some(io) if !self.is_broken() => io,
            _ => return Err(TransportError::LinkBroken),
        };

        let mut header = MessageHeader::new(msg_type, result, body.len() as u32);
        header.seq_no = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let seq_no = header.seq_no;
        queue.push(QueueEntry::new(header, body, context))?;
        Self::modify_locked(self.id, &queue, io)?;
        tracing::trace!(link_id = self.id, seq_no, msg_type = ?msg_type, "queued");
        Ok(seq_no)
    }

    /// Reads until a frame is complete or the socket would block.
    pub fn handle_poll_in(&self) -> PollIn {
        let mut recv = self.recv.lock();
        let mut io = self.io.lock();
        let Some(io) = io.as_mut() else {
            return PollIn::Error(TransportError::LinkBroken);
        };
        let outcome = recv.poll_in(&mut io.socket);
        if matches!(outcome, PollIn::Ready(_)) {
            self.frames_in.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Writes the front of the queue as far as the socket allows.
    pub fn handle_poll_out(&self) -> PollOut {
        let mut queue = self.send.lock();
        let mut io = self.io.lock();
        let Some(io) = io.as_mut() else {
            return PollOut::Error(TransportError::LinkBroken);
        };
        match io.socket.flush_tls() {
            Ok(true) => {}
            Ok(false) => return PollOut::NeedMore,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return PollOut::NeedMore,
            Err(err) => return PollOut::Error(classify_io(err)),
        }
        let outcome = queue.poll_out(&mut io.socket);
        if matches!(outcome, PollOut::Sent(_)) {
            self.frames_out.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Takes every pending entry; used once the link is broken.
    pub fn drain_queue(&self) -> Vec<QueueEntry> {
        self.send.lock().drain()
    }

    /// Releases the socket; returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let taken = self.io.lock().take();
        match taken {
            Some(mut io) => {
                if let Some(poller) = io.poller.take() {
                    let _ = poller.delete(io.socket.fd());
                }
                io.socket.shutdown();
                tracing::debug!(link_id = self.id, peer = %self.peer, "link closed");
                true
            }
            None => false,
        }
    }

    /// Whether the socket is still held.
    pub fn is_open(&self) -> bool {
        self.io.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    fn link_pair() -> (Arc<Link>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        let link = PendingLink::new(stream, peer)
            .establish(&TransportOptions::default())
            .unwrap();
        (link, remote)
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [LinkState::Connecting, LinkState::Established, LinkState::Broken] {
            assert_eq!(LinkState::from(u8::from(state)), state);
        }
    }

    #[test]
    fn test_break_link_single_winner() {
        let (link, _remote) = link_pair();
        let winners: usize = (0..16)
            .map(|_| {
                let link = link.clone();
                thread::spawn(move || link.break_link() as usize)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
        assert!(link.is_broken());
    }

    #[test]
    fn test_close_exactly_once() {
        let (link, _remote) = link_pair();
        assert!(link.close());
        assert!(!link.close());
        assert!(!link.is_open());
        assert!(matches!(link.handle_poll_in(), PollIn::Error(TransportError::LinkBroken)));
    }

    #[test]
    fn test_enqueue_and_write() {
        let (link, mut remote) = link_pair();
        let seq = link
            .enqueue(MessageType::Pause, 0, Bytes::from_static(b"hold"), None)
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(link.queue_len(), 1);
        assert!(matches!(link.handle_poll_out(), PollOut::Sent(_)));
        assert!(matches!(link.handle_poll_out(), PollOut::Idle));

        let mut raw = [0u8; 20];
        remote.read_exact(&mut raw).unwrap();
        let header = MessageHeader::decode(raw[..16].try_into().unwrap());
        assert_eq!(header.message_type(), Some(MessageType::Pause));
        assert_eq!(header.seq_no, 1);
        assert_eq!(&raw[16..], b"hold");
        assert_eq!(link.frames_out(), 1);
    }

    #[test]
    fn test_enqueue_rejected_when_broken_or_oversized() {
        let (link, _remote) = link_pair();
        let huge = Bytes::from(vec![0u8; link.max_body_len + 1]);
        assert!(matches!(
            link.enqueue(MessageType::Notify, 0, huge, None),
            Err(TransportError::BodyTooLarge { .. })
        ));
        link.break_link();
        assert!(matches!(
            link.enqueue(MessageType::Notify, 0, Bytes::new(), None),
            Err(TransportError::LinkBroken)
        ));
    }

    #[test]
    fn test_poll_in_reads_frame_and_sees_close() {
        use std::io::Write;
        let (link, mut remote) = link_pair();
        let header = MessageHeader::new(MessageType::Echo, 0, 3);
        remote.write_all(&header.encode()).unwrap();
        remote.write_all(b"abc").unwrap();

        let frame = loop {
            match link.handle_poll_in() {
                PollIn::Ready(frame) => break frame,
                PollIn::NeedMore => thread::sleep(Duration::from_millis(5)),
                PollIn::Error(err) => panic!("unexpected {err}"),
            }
        };
        assert_eq!(&frame.body[..], b"abc");

        drop(remote);
        let outcome = loop {
            match link.handle_poll_in() {
                PollIn::NeedMore => thread::sleep(Duration::from_millis(5)),
                other => break other,
            }
        };
        assert!(matches!(outcome, PollIn::Error(TransportError::LinkBroken)));
    }

    #[test]
    fn test_drain_after_break() {
        let (link, _remote) = link_pair();
        link.enqueue(MessageType::Exit, 0, Bytes::new(), Some(Bytes::from_static(b"c1")))
            .unwrap();
        link.enqueue(MessageType::Exit, 0, Bytes::new(), Some(Bytes::from_static(b"c2")))
            .unwrap();
        assert!(link.break_link());
        let drained = link.drain_queue();
        let contexts: Vec<_> = drained.into_iter().filter_map(|e| e.into_context()).collect();
        assert_eq!(contexts, vec![Bytes::from_static(b"c1"), Bytes::from_static(b"c2")]);
        assert!(link.drain_queue().is_empty());
    }
}
