//! Partial-frame reassembly for non-blocking receive.
//!
//! Edge-triggered readiness arrives once, so [`RecvState::poll_in`] keeps
//! reading until the socket reports `WouldBlock` or a whole frame is
//! assembled. The state (remaining header bytes, working header, working body)
//! survives between calls, which makes reassembly independent of how the
//! kernel splits the stream.

use std::io::{self, ErrorKind, Read};

use crate::buffer::DataBuffer;
use crate::error::TransportError;
use crate::protocol::{Frame, MessageHeader, HEADER_LEN};

/// Result of one receive step.
#[derive(Debug)]
pub enum PollIn {
    /// The socket is drained; wait for the next readiness edge.
    NeedMore,
    /// A complete frame was assembled.
    Ready(Frame),
    /// The peer closed or the read failed; the link must be broken.
    Error(TransportError),
}

#[derive(Debug)]
enum Phase {
    Header,
    Body,
    Discard,
}

/// Receive-side state of one link.
#[derive(Debug)]
pub struct RecvState {
    phase: Phase,
    header_buf: [u8; HEADER_LEN],
    header_remaining: usize,
    header: MessageHeader,
    body: DataBuffer,
    body_remaining: usize,
    max_body_len: usize,
    dropped: u64,
}

impl RecvState {
    pub fn new(max_body_len: usize) -> Self {
        Self {
            phase: Phase::Header,
            header_buf: [0u8; HEADER_LEN],
            header_remaining: HEADER_LEN,
            header: MessageHeader::default(),
            body: DataBuffer::with_limit(max_body_len),
            body_remaining: 0,
            max_body_len,
            dropped: 0,
        }
    }

    /// Number of frames dropped for exceeding the body limit.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Drives the state machine against `reader`.
    pub fn poll_in<R: Read>(&mut self, reader: &mut R) -> PollIn {
        loop {
            match self.phase {
                Phase::Header => {
                    let offset = HEADER_LEN - self.header_remaining;
                    match read_some(reader, &mut self.header_buf[offset..]) {
                        Step::Read(n) => self.header_remaining -= n,
                        Step::Blocked => return PollIn::NeedMore,
                        Step::Failed(err) => return PollIn::Error(err),
                    }
                    if self.header_remaining > 0 {
                        continue;
                    }
                    self.header = MessageHeader::decode(&self.header_buf);
                    let body_len = self.header.body_len as usize;
                    if body_len > self.max_body_len {
                        tracing::warn!(
                            body_len,
                            max_body_len = self.max_body_len,
                            msg_type = self.header.msg_type,
                            "oversized frame, discarding body"
                        );
                        self.body_remaining = body_len;
                        self.phase = Phase::Discard;
                        continue;
                    }
                    if body_len == 0 {
                        return PollIn::Ready(self.finish());
                    }
                    if let Err(err) = self.body.resize(body_len) {
                        return PollIn::Error(err);
                    }
                    self.body_remaining = body_len;
                    self.phase = Phase::Body;
                }
                Phase::Body => {
                    let offset = self.body.len() - self.body_remaining;
                    match read_some(reader, &mut self.body.as_mut_slice()[offset..]) {
                        Step::Read(n) => self.body_remaining -= n,
                        Step::Blocked => return PollIn::NeedMore,
                        Step::Failed(err) => return PollIn::Error(err),
                    }
                    if self.body_remaining == 0 {
                        return PollIn::Ready(self.finish());
                    }
                }
                Phase::Discard => {
                    let mut scratch = [0u8; 4096];
                    let want = self.body_remaining.min(scratch.len());
                    match read_some(reader, &mut scratch[..want]) {
                        Step::Read(n) => self.body_remaining -= n,
                        Step::Blocked => return PollIn::NeedMore,
                        Step::Failed(err) => return PollIn::Error(err),
                    }
                    if self.body_remaining == 0 {
                        self.dropped += 1;
                        self.reset();
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> Frame {
        let body = std::mem::replace(&mut self.body, DataBuffer::with_limit(self.max_body_len));
        let frame = Frame {
            header: self.header,
            body: body.freeze(),
        };
        self.reset();
        frame
    }

    fn reset(&mut self) {
        self.phase = Phase::Header;
        self.header_remaining = HEADER_LEN;
        self.body_remaining = 0;
        self.body.clear();
    }
}

enum Step {
    Read(usize),
    Blocked,
    Failed(TransportError),
}

fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> Step {
    loop {
        match reader.read(buf) {
            Ok(0) => return Step::Failed(TransportError::LinkBroken),
            Ok(n) => return Step::Read(n),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Step::Blocked,
            Err(err) => return Step::Failed(classify_io(err)),
        }
    }
}

/// Maps a socket error onto the transport taxonomy.
///
/// Peer resets and timeouts ask for a reconnect; everything else is surfaced
/// as plain I/O.
pub fn classify_io(err: io::Error) -> TransportError {
    let reconnect = match err.raw_os_error() {
        Some(code) => matches!(
            code,
            libc::EAGAIN
                | libc::ETIMEDOUT
                | libc::ECONNRESET
                | libc::ECONNREFUSED
                | libc::ECONNABORTED
                | libc::EPIPE
                | libc::ENETUNREACH
                | libc::EHOSTUNREACH
        ),
        None => matches!(
            err.kind(),
            ErrorKind::WouldBlock
                | ErrorKind::TimedOut
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
        ),
    };
    if reconnect {
        TransportError::NeedReconnect {
            reason: err.to_string(),
        }
    } else {
        TransportError::Io(err)
    }
}
