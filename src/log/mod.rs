//! The in-memory log: a ring-buffered sequence of entries with a
//! snapshot-driven start offset (spec.md §3, §4.1).

mod refs;

use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use refs::RefTable;

use crate::membership::Configuration;

/// The kind of a log entry's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// An application command, opaque to the engine.
    Command,
    /// A serialized [`Configuration`] change.
    Configuration,
    /// A no-op entry appended by a new leader to commit prior-term entries
    /// (the "blank" entry of the dissertation).
    Barrier,
}

/// Backing storage for an entry's payload. Entries materialized together
/// in one batch share a single allocation; the allocation is freed once
/// every entry referencing it has been dropped.
#[derive(Debug, Clone)]
enum Payload {
    Solo(Arc<[u8]>),
    Batched { data: Arc<Vec<u8>>, range: Range<usize> },
}

impl Payload {
    fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Solo(data) => data,
            Payload::Batched { data, range } => &data[range.clone()],
        }
    }
}

/// A single entry in the log.
#[derive(Debug, Clone)]
pub struct Entry {
    pub term: u64,
    pub index: u64,
    pub entry_type: EntryType,
    payload: Payload,
}

impl Entry {
    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    pub fn log_id(&self) -> crate::types::LogId {
        crate::types::LogId::new(self.term, self.index)
    }

    /// Deserialize this entry's payload as a [`Configuration`]. Only
    /// meaningful when `entry_type == Configuration`.
    pub fn as_configuration(&self) -> Option<Configuration> {
        if self.entry_type != EntryType::Configuration {
            return None;
        }
        serde_json::from_slice(self.payload()).ok()
    }

    fn blank(term: u64, index: u64) -> Self {
        Self {
            term,
            index,
            entry_type: EntryType::Barrier,
            payload: Payload::Solo(Arc::from(Vec::new().into_boxed_slice())),
        }
    }
}

/// A contiguous group of acquired entries. Dropping this without calling
/// [`Log::release`] leaks the refcount bookkeeping (but never the
/// underlying memory, since that is owned by the `Arc<Entry>` clones
/// regardless of the table).
#[derive(Debug, Default)]
pub struct Acquired {
    pub from_index: u64,
    entries: Vec<Arc<Entry>>,
}

impl Acquired {
    pub fn as_slice(&self) -> &[Arc<Entry>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The ring-buffered log itself.
///
/// Capacity grows as `next_size = 2 * size + 2` (so: 0, 2, 6, 14, 30, ...),
/// matching the "power-of-two-minus-two" cadence described in spec.md
/// §4.1. `front`/`back` are ring positions; `offset` is the index of the
/// last entry the log has logically forgotten (via `shift`), so the k-th
/// live slot holds Raft index `offset + k + 1`.
#[derive(Debug)]
pub struct Log {
    offset: u64,
    size: usize,
    front: usize,
    back: usize,
    ring: Vec<Option<Arc<Entry>>>,
    refs: RefTable,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    pub fn new() -> Self {
        Self {
            offset: 0,
            size: 0,
            front: 0,
            back: 0,
            ring: Vec::new(),
            refs: RefTable::new(),
        }
    }

    fn len(&self) -> usize {
        if self.size == 0 || self.back == self.front {
            0
        } else if self.back > self.front {
            self.back - self.front
        } else {
            self.size - self.front + self.back
        }
    }

    pub fn n_entries(&self) -> usize {
        self.len()
    }

    pub fn first_index(&self) -> u64 {
        if self.len() == 0 {
            0
        } else {
            self.offset + 1
        }
    }

    pub fn last_index(&self) -> u64 {
        self.offset + self.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.get(self.last_index()).map(|e| e.term).unwrap_or(0)
    }

    pub fn term_of(&self, index: u64) -> u64 {
        self.get(index).map(|e| e.term).unwrap_or(0)
    }

    fn slot_for(&self, index: u64) -> Option<usize> {
        if index <= self.offset || index > self.last_index() {
            return None;
        }
        let rel = (index - self.offset - 1) as usize;
        Some((self.front + rel) % self.size)
    }

    pub fn get(&self, index: u64) -> Option<Arc<Entry>> {
        let slot = self.slot_for(index)?;
        self.ring[slot].clone()
    }

    /// Grow the ring so that it can hold `additional` more entries than it
    /// currently does, re-laying out live entries starting at slot 0.
    fn ensure_capacity(&mut self, additional: usize) {
        let needed = self.len() + additional;
        if needed < self.size {
            return;
        }
        let mut new_size = if self.size == 0 { 2 } else { self.size };
        while needed >= new_size {
            new_size = 2 * new_size + 2;
        }
        let mut new_ring = vec![None; new_size];
        let old_len = self.len();
        for k in 0..old_len {
            let slot = (self.front + k) % self.size.max(1);
            new_ring[k] = self.ring[slot].take();
        }
        self.ring = new_ring;
        self.size = new_size;
        self.front = 0;
        self.back = old_len;
    }

    fn push(&mut self, entry: Entry) -> Arc<Entry> {
        self.ensure_capacity(1);
        let slot = self.back;
        let entry = Arc::new(entry);
        self.ring[slot] = Some(entry.clone());
        self.back = (self.back + 1) % self.size;
        entry
    }

    /// Append a single entry at `last_index() + 1`.
    pub fn append(&mut self, term: u64, entry_type: EntryType, payload: Vec<u8>) -> Arc<Entry> {
        let index = self.last_index() + 1;
        let entry = Entry {
            term,
            index,
            entry_type,
            payload: Payload::Solo(Arc::from(payload.into_boxed_slice())),
        };
        self.push(entry)
    }

    /// Append several command payloads materialized together, sharing one
    /// backing allocation.
    pub fn append_batch(&mut self, term: u64, payloads: Vec<Vec<u8>>) -> Vec<Arc<Entry>> {
        let mut data = Vec::new();
        let mut ranges = Vec::with_capacity(payloads.len());
        for p in &payloads {
            let start = data.len();
            data.extend_from_slice(p);
            ranges.push(start..data.len());
        }
        let data = Arc::new(data);
        let mut out = Vec::with_capacity(payloads.len());
        let mut index = self.last_index();
        for range in ranges {
            index += 1;
            let entry = Entry {
                term,
                index,
                entry_type: EntryType::Command,
                payload: Payload::Batched {
                    data: data.clone(),
                    range,
                },
            };
            out.push(self.push(entry));
        }
        out
    }

    /// Append a blank (barrier) entry, used by a new leader to commit
    /// entries from prior terms.
    pub fn append_barrier(&mut self, term: u64) -> Arc<Entry> {
        let index = self.last_index() + 1;
        let entry = Entry::blank(term, index);
        self.push(entry)
    }

    /// Serialize `configuration` deterministically and append it as a
    /// configuration entry.
    pub fn append_configuration(&mut self, term: u64, configuration: &Configuration) -> Arc<Entry> {
        let payload = serde_json::to_vec(configuration).expect("configuration is always serializable");
        self.append(term, EntryType::Configuration, payload)
    }

    /// Return a contiguous slice of entries starting at `from_index`,
    /// bumping refcounts for the returned entries. A no-op (returns an
    /// empty [`Acquired`]) if `from_index > last_index()` or
    /// `from_index <= offset`.
    pub fn acquire(&mut self, from_index: u64) -> Acquired {
        if from_index > self.last_index() || from_index <= self.offset {
            return Acquired {
                from_index,
                entries: Vec::new(),
            };
        }
        let mut entries = Vec::new();
        let mut idx = from_index;
        while idx <= self.last_index() {
            if let Some(e) = self.get(idx) {
                self.refs.acquire(e.index, e.term);
                entries.push(e);
            }
            idx += 1;
        }
        Acquired { from_index, entries }
    }

    /// Release entries previously returned by [`Log::acquire`].
    pub fn release(&mut self, acquired: Acquired) {
        for e in acquired.entries {
            self.refs.release(e.index, e.term);
        }
    }

    /// Current refcount for the entry at `(index, term)`, 0 if untracked.
    pub fn ref_count(&self, index: u64, term: u64) -> u32 {
        self.refs.count(index, term)
    }

    /// Discard entries at and after `from_index`. Entries that still have
    /// non-zero refcount remain tracked in the refs table (their memory
    /// stays alive through outstanding `Arc<Entry>` clones) but become
    /// unreachable through `get`.
    pub fn truncate(&mut self, from_index: u64) {
        if from_index > self.last_index() {
            return;
        }
        let keep = if from_index <= self.offset {
            0
        } else {
            (from_index - self.offset - 1) as usize
        };
        self.back = if self.size == 0 {
            0
        } else {
            (self.front + keep) % self.size
        };
        if keep == 0 {
            self.back = self.front;
        }
    }

    /// Discard entries at or below `up_to_index` and advance `offset`.
    /// Used after snapshotting.
    pub fn shift(&mut self, up_to_index: u64) {
        let up_to_index = up_to_index.min(self.last_index());
        if up_to_index <= self.offset {
            return;
        }
        let drop_count = (up_to_index - self.offset) as usize;
        for _ in 0..drop_count {
            if self.front == self.back && self.len() == 0 {
                break;
            }
            self.ring[self.front] = None;
            self.front = (self.front + 1) % self.size.max(1);
        }
        self.offset = up_to_index;
    }

    /// Install the starting index after loading a snapshot into an empty
    /// log.
    pub fn set_offset(&mut self, value: u64) {
        debug_assert_eq!(self.len(), 0, "set_offset requires an empty log");
        self.offset = value;
        self.front = 0;
        self.back = 0;
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}
