//! Core identifiers shared across the crate.

use serde::{Deserialize, Serialize};

/// Uniquely identifies a server within a cluster.
pub type NodeId = u64;

/// Identifies a log entry by the term in which it was created and its
/// index in the log.
///
/// `(term, index)` pairs are compared lexicographically by `(index, term)`
/// is never what you want here: two entries with the same index always
/// have the same term in a correct log, so equality comparisons only ever
/// need `index`. `Ord` is nonetheless derived field-order (`term` first)
/// because entries are compared primarily "is this at least as up to date"
/// which in Raft is defined by `(last_term, last_index)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub const fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }

    /// The id preceding any real log entry: term 0, index 0.
    pub const fn zero() -> Self {
        Self { term: 0, index: 0 }
    }

    /// Raft's "up to date" comparison (dissertation §5.4.1): a candidate's
    /// log is at least as up to date as `other` if its last term is
    /// greater, or the terms are equal and its last index is greater or
    /// equal.
    pub fn is_at_least_as_up_to_date_as(&self, other: &LogId) -> bool {
        (self.term, self.index) >= (other.term, other.index)
    }
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.term, self.index)
    }
}
