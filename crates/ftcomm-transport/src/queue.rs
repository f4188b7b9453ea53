//! Outbound message queue of a link.
//!
//! A bounded FIFO of [`QueueEntry`] values. Each entry keeps its own
//! remaining-byte counters for header and body, so a message that the kernel
//! only partially accepted stays at the front and resumes where it stopped on
//! the next writable edge.

use std::collections::VecDeque;
use std::io::{ErrorKind, Write};

use bytes::Bytes;

use crate::error::{Result, TransportError};
use crate::framing::classify_io;
use crate::protocol::{MessageHeader, HEADER_LEN};

/// One pending outbound message.
#[derive(Debug)]
pub struct QueueEntry {
    header: MessageHeader,
    header_bytes: [u8; HEADER_LEN],
    body: Bytes,
    context: Option<Bytes>,
    header_remaining: usize,
    body_remaining: usize,
}

impl QueueEntry {
    pub fn new(header: MessageHeader, body: Bytes, context: Option<Bytes>) -> Self {
        let body_remaining = body.len();
        Self {
            header_bytes: header.encode(),
            header,
            body,
            context,
            header_remaining: HEADER_LEN,
            body_remaining,
        }
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Opaque context handed back to the sender on completion.
    pub fn context(&self) -> Option<&Bytes> {
        self.context.as_ref()
    }

    pub fn into_context(self) -> Option<Bytes> {
        self.context
    }

    pub fn is_fully_sent(&self) -> bool {
        self.header_remaining == 0 && self.body_remaining == 0
    }

    /// Whether any byte of this entry has reached the socket.
    pub fn is_started(&self) -> bool {
        self.header_remaining < HEADER_LEN
    }
}

/// Result of one send step.
#[derive(Debug)]
pub enum PollOut {
    /// Nothing queued.
    Idle,
    /// The front entry is only partially written; wait for the next edge.
    NeedMore,
    /// The front entry was fully written and removed.
    Sent(QueueEntry),
    /// The write failed; the link must be broken.
    Error(TransportError),
}

/// Bounded FIFO of outbound messages.
#[derive(Debug)]
pub struct SendQueue {
    entries: VecDeque<QueueEntry>,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, entry: QueueEntry) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(TransportError::QueueFull {
                depth: self.capacity,
            });
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Removes every pending entry, partially sent ones included.
    pub fn drain(&mut self) -> Vec<QueueEntry> {
        self.entries.drain(..).collect()
    }

    /// Writes as much of the front entry as `writer` accepts.
    pub fn poll_out<W: Write>(&mut self, writer: &mut W) -> PollOut {
        let Some(front) = self.entries.front_mut() else {
            return PollOut::Idle;
        };

        if front.header_remaining > 0 {
            let offset = HEADER_LEN - front.header_remaining;
            match write_some(writer, &front.header_bytes[offset..]) {
                Ok(Some(n)) => front.header_remaining -= n,
                Ok(None) => return PollOut::NeedMore,
                Err(err) => return PollOut::Error(err),
            }
            if front.header_remaining > 0 {
                return PollOut::NeedMore;
            }
        }

        if front.body_remaining > 0 {
            let offset = front.body.len() - front.body_remaining;
            match write_some(writer, &front.body[offset..]) {
                Ok(Some(n)) => front.body_remaining -= n,
                Ok(None) => return PollOut::NeedMore,
                Err(err) => return PollOut::Error(err),
            }
            if front.body_remaining > 0 {
                return PollOut::NeedMore;
            }
        }

        match self.entries.pop_front() {
            Some(entry) => PollOut::Sent(entry),
            None => PollOut::Idle,
        }
    }
}

/// `Ok(None)` means the writer would block.
fn write_some<W: Write>(writer: &mut W, buf: &[u8]) -> Result<Option<usize>> {
    loop {
        match writer.write(buf) {
            Ok(0) => return Err(TransportError::LinkBroken),
            Ok(n) => return Ok(Some(n)),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(classify_io(err)),
        }
    }
}
