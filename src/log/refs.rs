//! Open-addressed refcount bookkeeping keyed by `(index, term)`.
//!
//! This table exists alongside the log's ring buffer purely as bookkeeping:
//! the actual memory safety of a log entry's payload is handled by
//! `Arc<Entry>` (see [`super::Entry`]) — the table only tracks *how many*
//! outstanding acquires exist for a given entry, and lets `release` detect
//! when the last one has gone away.

const INITIAL_CAPACITY: usize = 256;
const MAX_LOAD_FACTOR_NUM: usize = 3;
const MAX_LOAD_FACTOR_DEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    Tombstone,
    Occupied { index: u64, term: u64, count: u32 },
}

/// Open-addressed, linear-probed hash table mapping `(index, term) -> refcount`.
#[derive(Debug, Clone)]
pub struct RefTable {
    slots: Vec<Slot>,
    occupied: usize,
}

impl Default for RefTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RefTable {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot::Empty; INITIAL_CAPACITY],
            occupied: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn hash(index: u64, term: u64, capacity: usize) -> usize {
        let mut h = index.wrapping_mul(0x9E3779B97F4A7C15);
        h ^= term.wrapping_mul(0xC2B2AE3D27D4EB4F);
        (h as usize) % capacity
    }

    /// Increment the refcount for `(index, term)`, creating a fresh entry
    /// with count 1 if it did not previously exist.
    pub fn acquire(&mut self, index: u64, term: u64) {
        if self.occupied * MAX_LOAD_FACTOR_DEN >= self.slots.len() * MAX_LOAD_FACTOR_NUM {
            self.grow();
        }
        let cap = self.slots.len();
        let mut i = Self::hash(index, term, cap);
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &mut self.slots[i] {
                Slot::Occupied {
                    index: si,
                    term: st,
                    count,
                } if *si == index && *st == term => {
                    *count += 1;
                    return;
                }
                Slot::Empty => {
                    let dest = first_tombstone.unwrap_or(i);
                    self.slots[dest] = Slot::Occupied {
                        index,
                        term,
                        count: 1,
                    };
                    self.occupied += 1;
                    return;
                }
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(i);
                    }
                }
                Slot::Occupied { .. } => {}
            }
            i = (i + 1) % cap;
        }
    }

    /// Decrement the refcount for `(index, term)`. Returns the refcount
    /// after the decrement, or `None` if no such entry was tracked.
    /// Once the count reaches zero the slot is freed.
    pub fn release(&mut self, index: u64, term: u64) -> Option<u32> {
        let cap = self.slots.len();
        let mut i = Self::hash(index, term, cap);
        let mut probes = 0;
        loop {
            match &mut self.slots[i] {
                Slot::Occupied {
                    index: si,
                    term: st,
                    count,
                } if *si == index && *st == term => {
                    *count -= 1;
                    let remaining = *count;
                    if remaining == 0 {
                        self.slots[i] = Slot::Tombstone;
                        self.occupied -= 1;
                    }
                    return Some(remaining);
                }
                Slot::Empty => return None,
                _ => {}
            }
            i = (i + 1) % cap;
            probes += 1;
            if probes >= cap {
                return None;
            }
        }
    }

    /// Current refcount for `(index, term)`, or 0 if untracked.
    pub fn count(&self, index: u64, term: u64) -> u32 {
        let cap = self.slots.len();
        let mut i = Self::hash(index, term, cap);
        let mut probes = 0;
        loop {
            match &self.slots[i] {
                Slot::Occupied {
                    index: si,
                    term: st,
                    count,
                } if *si == index && *st == term => return *count,
                Slot::Empty => return 0,
                _ => {}
            }
            i = (i + 1) % cap;
            probes += 1;
            if probes >= cap {
                return 0;
            }
        }
    }

    fn grow(&mut self) {
        let new_cap = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; new_cap]);
        self.occupied = 0;
        for slot in old {
            if let Slot::Occupied { index, term, count } = slot {
                self.reinsert(index, term, count);
            }
        }
    }

    fn reinsert(&mut self, index: u64, term: u64, count: u32) {
        let cap = self.slots.len();
        let mut i = Self::hash(index, term, cap);
        loop {
            if matches!(self.slots[i], Slot::Empty) {
                self.slots[i] = Slot::Occupied { index, term, count };
                self.occupied += 1;
                return;
            }
            i = (i + 1) % cap;
        }
    }
}
