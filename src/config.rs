//! Engine-level configuration knobs (spec.md §6).

use crate::error::{RaftError, RaftResult};

/// Tunable parameters for a [`crate::core::RaftEngine`].
///
/// Built with [`Config::build`], which returns a [`ConfigBuilder`]; call
/// `.validate()` to obtain a `Config`, mirroring the
/// `Config::build(name).validate()` idiom used throughout this crate's
/// tests and fixtures.
#[derive(Debug, Clone)]
pub struct Config {
    /// Lower bound of the randomized election timeout, in milliseconds.
    pub election_timeout_min_ms: u64,
    /// Upper bound (exclusive) of the randomized election timeout.
    pub election_timeout_max_ms: u64,
    /// How often a leader sends a heartbeat to its followers.
    pub heartbeat_timeout_ms: u64,
    /// Number of entries applied since the last snapshot before the engine
    /// takes a new one.
    pub snapshot_threshold: u64,
    /// Number of entries retained in the log after a snapshot shift.
    pub snapshot_trailing: u64,
    /// Maximum number of catch-up rounds before a promotion is aborted.
    pub max_catch_up_rounds: u64,
    /// Maximum cumulative catch-up duration before a promotion is aborted.
    pub max_catch_up_duration_ms: u64,
    /// How long a follower may go without a successful contact before the
    /// leader falls back to heartbeat-only replication toward it.
    pub stale_contact_ms: u64,
}

impl Config {
    /// Start building a new configuration, given a name for diagnostics.
    pub fn build(name: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            name: name.into(),
            election_timeout_min_ms: 1000,
            election_timeout_max_ms: 2000,
            heartbeat_timeout_ms: 100,
            snapshot_threshold: 1000,
            snapshot_trailing: 100,
            max_catch_up_rounds: 10,
            max_catch_up_duration_ms: 30_000,
            stale_contact_ms: 5000,
        }
    }
}

/// Builder for [`Config`]; see [`Config::build`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    name: String,
    election_timeout_min_ms: u64,
    election_timeout_max_ms: u64,
    heartbeat_timeout_ms: u64,
    snapshot_threshold: u64,
    snapshot_trailing: u64,
    max_catch_up_rounds: u64,
    max_catch_up_duration_ms: u64,
    stale_contact_ms: u64,
}

macro_rules! setter {
    ($field:ident: $ty:ty) => {
        pub fn $field(mut self, value: $ty) -> Self {
            self.$field = value;
            self
        }
    };
}

impl ConfigBuilder {
    setter!(election_timeout_min_ms: u64);
    setter!(election_timeout_max_ms: u64);
    setter!(heartbeat_timeout_ms: u64);
    setter!(snapshot_threshold: u64);
    setter!(snapshot_trailing: u64);
    setter!(max_catch_up_rounds: u64);
    setter!(max_catch_up_duration_ms: u64);
    setter!(stale_contact_ms: u64);

    /// Validate the accumulated settings, producing a usable [`Config`].
    pub fn validate(self) -> RaftResult<Config> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(RaftError::BadConfig(format!(
                "{}: election_timeout_min_ms ({}) must be < election_timeout_max_ms ({})",
                self.name, self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_timeout_ms >= self.election_timeout_min_ms {
            return Err(RaftError::BadConfig(format!(
                "{}: heartbeat_timeout_ms ({}) must be < election_timeout_min_ms ({})",
                self.name, self.heartbeat_timeout_ms, self.election_timeout_min_ms
            )));
        }
        if self.snapshot_threshold == 0 {
            return Err(RaftError::BadConfig(format!(
                "{}: snapshot_threshold must be > 0",
                self.name
            )));
        }
        Ok(Config {
            election_timeout_min_ms: self.election_timeout_min_ms,
            election_timeout_max_ms: self.election_timeout_max_ms,
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            snapshot_threshold: self.snapshot_threshold,
            snapshot_trailing: self.snapshot_trailing,
            max_catch_up_rounds: self.max_catch_up_rounds,
            max_catch_up_duration_ms: self.max_catch_up_duration_ms,
            stale_contact_ms: self.stale_contact_ms,
        })
    }
}
