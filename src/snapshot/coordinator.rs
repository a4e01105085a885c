//! Chandy–Lamport snapshot coordination for one peer.
//!
//! The coordinator owns the in-progress local snapshot and piggybacks on
//! the peer's event loop: the loop hands it every delivered marker and,
//! while a snapshot is being recorded, every delivered application
//! message. Completion (N-1 markers collected) freezes the record into the
//! peer's append-only dump file.
//!
//! Channel closure is coarse: recording opens at the first marker for a
//! new id and closes for all channels at once when the snapshot completes.
//! The marker payload carries no sender identity, so per-channel closure
//! is not recoverable from the wire; the verifier's invariants do not
//! depend on the partitioning.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error};

use super::record::{InterceptedMsg, Snapshot};

/// Wall-clock period between snapshot initiations, one initiator per epoch.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// Progress reported after a marker is collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerProgress {
    /// Still waiting for more markers.
    Recording,
    /// This marker completed the snapshot; the record was dumped.
    Completed,
    /// Marker arrived with no snapshot in progress to count it against.
    Ignored,
}

/// Per-peer snapshot state.
pub struct SnapshotCoordinator {
    n: usize,
    dump_dir: PathBuf,
    /// In-progress or last-completed local snapshot.
    current: Option<Snapshot>,
}

impl SnapshotCoordinator {
    pub fn new(n: usize, dump_dir: PathBuf) -> Self {
        SnapshotCoordinator {
            n,
            dump_dir,
            current: None,
        }
    }

    /// Identifier the next locally-initiated snapshot should carry:
    /// one past the last observed id, or 0 for the first.
    pub fn next_snap_id(&self) -> u64 {
        match &self.current {
            Some(snap) => snap.id + 1,
            None => 0,
        }
    }

    /// True if a marker for `snap_id` is the first observed for that id,
    /// meaning local state must be recorded and markers forwarded.
    pub fn is_first_marker(&self, snap_id: u64) -> bool {
        match &self.current {
            Some(snap) => snap.id < snap_id,
            None => true,
        }
    }

    /// Install the freshly-recorded local state for a new snapshot id.
    pub fn begin(&mut self, record: Snapshot) {
        debug!(pid = record.pid, snap_id = record.id, "recording local snapshot");
        self.current = Some(record);
    }

    /// Count one received marker against the current snapshot.
    ///
    /// Every delivered marker counts, the initiator's self-marker
    /// included. Completion fires exactly when the counter reaches N-1,
    /// so a marker arriving after completion cannot re-trigger the dump.
    pub fn collect_marker(&mut self) -> MarkerProgress {
        let n = self.n;
        let dump_dir = self.dump_dir.clone();
        let snap = match self.current.as_mut() {
            Some(snap) => snap,
            None => return MarkerProgress::Ignored,
        };

        snap.collected_markers += 1;
        if snap.collected_markers != n - 1 {
            return MarkerProgress::Recording;
        }

        debug!(pid = snap.pid, snap_id = snap.id, "snapshot complete, dumping");
        if let Err(e) = snap.dump_to_file(&dump_dir) {
            error!(pid = snap.pid, snap_id = snap.id, "snapshot dump failed: {}", e);
        }
        MarkerProgress::Completed
    }

    /// True while in-transit messages are still being recorded.
    pub fn recording(&self) -> bool {
        self.current
            .as_ref()
            .map(|snap| snap.collected_markers < self.n - 1)
            .unwrap_or(false)
    }

    /// Record one delivered application message as in-transit, if a
    /// snapshot is being recorded. Runs before the message is dispatched,
    /// so the recorded local state predates every captured message.
    pub fn intercept(&mut self, from: &str, message: &str) {
        if !self.recording() {
            return;
        }
        if let Some(snap) = self.current.as_mut() {
            snap.intercepted_msgs.push(InterceptedMsg {
                from: from.to_string(),
                message: message.to_string(),
            });
        }
    }

    /// The in-progress or last-completed local snapshot.
    pub fn current(&self) -> Option<&Snapshot> {
        self.current.as_ref()
    }
}

/// Round-robin initiation rule: the initiator of the current epoch is
/// `floor(now / T) mod N`. Exactly one peer per epoch, no coordinator.
pub fn initiator_for_epoch(now: SystemTime, n: usize) -> usize {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    ((secs / SNAPSHOT_INTERVAL.as_secs()) % n as u64) as usize
}
