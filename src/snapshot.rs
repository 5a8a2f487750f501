//! Snapshot trigger bookkeeping: when to take one, and how many trailing
//! log entries to retain afterward (spec.md §4.3, §4.6).

use crate::io::SnapshotMeta;
use crate::types::LogId;

/// What this node currently believes about its most recent snapshot.
/// `None` until the first snapshot is taken or installed.
#[derive(Debug, Clone, Default)]
pub struct SnapshotState {
    meta: Option<SnapshotMeta>,
    /// Set while a snapshot is being taken or installed; guards against
    /// concurrent InstallSnapshot handling (spec.md §4.6).
    in_progress: bool,
}

impl SnapshotState {
    pub fn last_log_id(&self) -> LogId {
        self.meta.as_ref().map(|m| m.last_log_id).unwrap_or_else(LogId::zero)
    }

    pub fn meta(&self) -> Option<&SnapshotMeta> {
        self.meta.as_ref()
    }

    pub fn set(&mut self, meta: SnapshotMeta) {
        self.meta = Some(meta);
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn begin(&mut self) {
        self.in_progress = true;
    }

    pub fn finish(&mut self) {
        self.in_progress = false;
    }

    /// Should a new snapshot be taken, given `last_applied` and the
    /// configured threshold?
    pub fn should_snapshot(&self, last_applied: u64, threshold: u64) -> bool {
        !self.in_progress && last_applied.saturating_sub(self.last_log_id().index) >= threshold
    }

    /// The index the log should be `shift`ed up to after taking a
    /// snapshot at `snapshot_index`, keeping `trailing` entries for fast
    /// follower catch-up.
    pub fn shift_target(snapshot_index: u64, trailing: u64) -> u64 {
        snapshot_index.saturating_sub(trailing)
    }
}
