//! A pluggable implementation of the core Raft consensus algorithm:
//! leader election, log replication, one-at-a-time membership change, and
//! log-based snapshotting, driven synchronously by an embedder through
//! [`RaftEngine`].
//!
//! This crate deliberately stops at the algorithm kernel. Durable
//! persistence, network transport, and the application state machine are
//! pluggable via the [`io`] module's [`Storage`](io::Storage),
//! [`Transport`](io::Transport), and [`Fsm`](io::Fsm) traits; the
//! [`fixture`] module (only built under `cfg(test)` via `tests/`) is the
//! deterministic cluster simulator used to validate the core's safety and
//! liveness properties.
#![cfg_attr(feature = "docinclude", feature(doc_cfg))]

pub mod config;
pub mod core;
pub mod error;
pub mod io;
pub mod log;
pub mod membership;
pub mod metrics;
pub mod replication;
pub mod snapshot;
pub mod types;

pub use config::{Config, ConfigBuilder};
pub use core::RaftEngine;
pub use error::{RaftError, RaftResult};
pub use io::{Fsm, Storage, Transport};
pub use membership::{Configuration, Server};
pub use metrics::RaftMetrics;
pub use types::{LogId, NodeId};
