//! Per-rank status for the serial number currently being tracked.
//!
//! Each tracked rank owns one status byte. A record moves a rank from
//! [`Status::Init`] to a terminal status at most once per reset, and the
//! completion counter counts those moves. Records carrying any other serial
//! number are stale and leave everything untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::action::Rank;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Init = 0,
    Success = 1,
    Failed = 2,
}

impl From<u8> for Status {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Status::Init,
            1 => Status::Success,
            _ => Status::Failed,
        }
    }
}

/// What a call to [`AtomicStatusVector::record`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// Serial number differs from the tracked one.
    Stale,
    /// The rank already has a terminal status for this serial number.
    Duplicate,
    /// The rank is not part of the tracked set.
    UnknownRank,
    /// The reply names a different rank than the link it arrived on.
    SenderMismatch,
}

#[derive(Debug)]
struct Tracked {
    serial: i64,
    index: HashMap<Rank, usize>,
    slots: Vec<AtomicU8>,
    done: AtomicUsize,
}

#[derive(Debug)]
pub struct AtomicStatusVector {
    inner: RwLock<Tracked>,
}

impl Default for AtomicStatusVector {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicStatusVector {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Tracked {
                serial: i64::MIN,
                index: HashMap::new(),
                slots: Vec::new(),
                done: AtomicUsize::new(0),
            }),
        }
    }

    /// Starts tracking `ranks` for `serial`, all at [`Status::Init`].
    pub fn reset(&self, serial: i64, ranks: &[Rank]) {
        let mut inner = self.inner.write();
        inner.serial = serial;
        inner.index = ranks.iter().enumerate().map(|(i, &r)| (r, i)).collect();
        inner.slots = ranks.iter().map(|_| AtomicU8::new(Status::Init as u8)).collect();
        inner.done = AtomicUsize::new(0);
    }

    pub fn record(&self, rank: Rank, serial: i64, status: Status) -> RecordOutcome {
        let inner = self.inner.read();
        if serial != inner.serial {
            return RecordOutcome::Stale;
        }
        let Some(&slot) = inner.index.get(&rank) else {
            return RecordOutcome::UnknownRank;
        };
        match inner.slots[slot].compare_exchange(
            Status::Init as u8,
            status as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                inner.done.fetch_add(1, Ordering::AcqRel);
                RecordOutcome::Recorded
            }
            Err(_) => RecordOutcome::Duplicate,
        }
    }

    pub fn serial(&self) -> i64 {
        self.inner.read().serial
    }

    pub fn status(&self, rank: Rank) -> Option<Status> {
        let inner = self.inner.read();
        let slot = *inner.index.get(&rank)?;
        Some(Status::from(inner.slots[slot].load(Ordering::Acquire)))
    }

    /// Ranks that reached a terminal status.
    pub fn completed(&self) -> usize {
        self.inner.read().done.load(Ordering::Acquire)
    }

    pub fn expected(&self) -> usize {
        self.inner.read().slots.len()
    }

    pub fn is_complete(&self) -> bool {
        let inner = self.inner.read();
        inner.done.load(Ordering::Acquire) >= inner.slots.len()
    }

    fn ranks_with(&self, wanted: Status) -> Vec<Rank> {
        let inner = self.inner.read();
        let mut ranks: Vec<Rank> = inner
            .index
            .iter()
            .filter(|(_, &slot)| Status::from(inner.slots[slot].load(Ordering::Acquire)) == wanted)
            .map(|(&rank, _)| rank)
            .collect();
        ranks.sort_unstable();
        ranks
    }

    /// Ranks still at [`Status::Init`].
    pub fn pending(&self) -> Vec<Rank> {
        self.ranks_with(Status::Init)
    }

    pub fn failed(&self) -> Vec<Rank> {
        self.ranks_with(Status::Failed)
    }

    pub fn succeeded(&self) -> Vec<Rank> {
        self.ranks_with(Status::Success)
    }
}
