//! Bounded, growable byte buffers for payloads crossing the network.
//!
//! A [`DataBuffer`] is the mutable stage of a payload: frames are reassembled
//! into it and senders build bodies in it. Once complete it is frozen into a
//! reference-counted [`Bytes`] so the same allocation can be attached to many
//! in-flight sends or replies without copying.

use bytes::{Bytes, BytesMut};

use crate::error::{Result, TransportError};
use crate::protocol::MAX_BODY_LEN;

/// Resizable byte buffer with a hard growth ceiling.
#[derive(Debug, Clone)]
pub struct DataBuffer {
    buf: BytesMut,
    limit: usize,
}

impl DataBuffer {
    /// Creates an empty buffer bounded by [`MAX_BODY_LEN`].
    pub fn new() -> Self {
        Self::with_limit(MAX_BODY_LEN)
    }

    /// Creates an empty buffer that may grow up to `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    /// Creates a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let mut buf = Self::new();
        buf.extend_from_slice(data)?;
        Ok(buf)
    }

    /// Ensures `capacity() >= n`.
    ///
    /// Fails without touching the buffer when `n` exceeds the limit.
    pub fn alloc_if_need(&mut self, n: usize) -> Result<()> {
        if n > self.limit {
            return Err(TransportError::BufferTooLarge {
                requested: n,
                limit: self.limit,
            });
        }
        if self.buf.capacity() < n {
            self.buf.reserve(n - self.buf.len());
        }
        Ok(())
    }

    /// Resizes the used length to `len`, zero-filling new bytes.
    pub fn resize(&mut self, len: usize) -> Result<()> {
        self.alloc_if_need(len)?;
        self.buf.resize(len, 0);
        Ok(())
    }

    /// Appends `data`, growing within the limit.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<()> {
        let needed = self.buf.len().saturating_add(data.len());
        self.alloc_if_need(needed)?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Converts into a shared, immutable payload.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Default for DataBuffer {
    fn default() -> Self {
        Self::new()
    }
}
