//! The error taxonomy returned by this crate's public API.

use crate::types::NodeId;

/// The result type returned by fallible operations in this crate.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Errors that can occur while driving a [`crate::core::RaftEngine`].
///
/// Most variants are fatal: once observed, the engine that produced them
/// should be considered latched into a closed state. `NotLeader` and `Busy`
/// are the exception — both are routine, expected responses to a client
/// request and do not affect the engine's internal state.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RaftError {
    /// A memory allocation failed, e.g. while growing the log's ring buffer
    /// or the refs table.
    #[error("out of memory")]
    OutOfMemory,

    /// A generic I/O failure reported by a port implementation.
    #[error("I/O error: {0}")]
    Io(String),

    /// A transport port failed to establish or maintain a connection to a
    /// peer.
    #[error("I/O connect error")]
    IoConnect,

    /// An in-flight I/O operation was canceled, typically because the
    /// engine shut down while a port call was outstanding.
    #[error("I/O canceled")]
    IoCanceled,

    /// The engine has been closed and can no longer process ticks,
    /// messages, or requests.
    #[error("shutdown: {0}")]
    Shutdown(String),

    /// The engine cannot accept the request right now (e.g. a membership
    /// change is already in flight). The caller should retry later.
    #[error("busy")]
    Busy,

    /// The request requires this node to be leader, and it is not. When
    /// known, the current leader is included so the caller can redirect.
    #[error("not leader")]
    NotLeader {
        /// The node id and address of the current leader, if known.
        leader: Option<(NodeId, String)>,
    },

    /// The engine observed an internally inconsistent state (e.g. a gap in
    /// the log, or a storage port returning data that violates the
    /// log/state-machine consistency invariant).
    #[error("bad state: {0}")]
    BadState(String),

    /// A [`crate::config::Config`] failed validation.
    #[error("bad config: {0}")]
    BadConfig(String),
}

impl RaftError {
    /// True for errors that latch the engine into a closed state.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RaftError::NotLeader { .. } | RaftError::Busy)
    }
}
