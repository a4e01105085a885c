//! Safety invariants over global snapshot sets.
//!
//! The k-th record from every peer forms the k-th global snapshot set;
//! each set passes through a fixed suite of checkers. Verification aborts
//! on the first violation with the snapshot index and a diagnostic naming
//! the peers involved.

use std::fmt;

use super::record::Snapshot;
use crate::mutex::MutexState;

/// The invariant a checker enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantKind {
    /// At most one peer inside the critical section.
    MutualExclusion,
    /// A peer deferring replies must be wanting or inside.
    WaitingImpliesWantOrIn,
    /// An all-idle cluster holds no deferred replies and no in-transit
    /// messages.
    IdleClusterClean,
    /// A peer inside the critical section holds all N-1 permissions.
    InCsHasAllConsents,
    /// Nobody defers the reply to the current critical-section holder.
    NoDeferralOfHolder,
    /// An idle peer defers nothing.
    IdleDoesNotDefer,
}

impl InvariantKind {
    pub fn name(&self) -> &'static str {
        match self {
            InvariantKind::MutualExclusion => "mutual-exclusion",
            InvariantKind::WaitingImpliesWantOrIn => "waiting-implies-want-or-in",
            InvariantKind::IdleClusterClean => "idle-cluster-clean",
            InvariantKind::InCsHasAllConsents => "in-cs-has-all-consents",
            InvariantKind::NoDeferralOfHolder => "no-deferral-of-holder",
            InvariantKind::IdleDoesNotDefer => "idle-does-not-defer",
        }
    }
}

/// A broken invariant with its diagnostic.
#[derive(Debug, Clone)]
pub struct InvariantViolation {
    pub kind: InvariantKind,
    pub description: String,
}

impl InvariantViolation {
    fn new(kind: InvariantKind, description: String) -> Self {
        InvariantViolation { kind, description }
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.description)
    }
}

/// Verification failure: either the dumps disagree on how many snapshots
/// ran, or some set broke an invariant.
#[derive(Debug)]
pub enum VerifyError {
    /// Under the fixed round-robin schedule every peer observes every
    /// snapshot id, so unequal record counts are themselves a failure.
    RecordCountMismatch {
        peer: usize,
        records: usize,
        expected: usize,
    },
    Violation {
        snapshot_index: usize,
        violation: InvariantViolation,
    },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::RecordCountMismatch {
                peer,
                records,
                expected,
            } => write!(
                f,
                "peer {} dumped {} snapshots, expected {} like the others",
                peer, records, expected
            ),
            VerifyError::Violation {
                snapshot_index,
                violation,
            } => write!(f, "snapshot {}: {}", snapshot_index, violation),
        }
    }
}

type Checker = fn(&[Snapshot]) -> Result<(), InvariantViolation>;

/// The fixed checker suite, in application order.
const CHECKERS: &[Checker] = &[
    check_mutual_exclusion,
    check_waiting_implies_want_or_in,
    check_idle_cluster_clean,
    check_in_cs_has_all_consents,
    check_no_deferral_of_holder,
    check_idle_does_not_defer,
];

/// Verify every global snapshot set in lockstep order.
///
/// Returns the number of sets verified. Aborts on the first failure.
pub fn verify_all(records_by_peer: &[Vec<Snapshot>]) -> Result<usize, VerifyError> {
    let expected = records_by_peer.first().map(|r| r.len()).unwrap_or(0);
    for (peer, records) in records_by_peer.iter().enumerate() {
        if records.len() != expected {
            return Err(VerifyError::RecordCountMismatch {
                peer,
                records: records.len(),
                expected,
            });
        }
    }

    for k in 0..expected {
        let set: Vec<Snapshot> = records_by_peer.iter().map(|r| r[k].clone()).collect();
        for checker in CHECKERS {
            checker(&set).map_err(|violation| VerifyError::Violation {
                snapshot_index: k,
                violation,
            })?;
        }
    }

    Ok(expected)
}

/// At most one peer has State = IN.
pub fn check_mutual_exclusion(set: &[Snapshot]) -> Result<(), InvariantViolation> {
    let in_cs = set
        .iter()
        .filter(|s| s.state == MutexState::In)
        .count();
    if in_cs > 1 {
        return Err(InvariantViolation::new(
            InvariantKind::MutualExclusion,
            format!("{} peers in the critical section", in_cs),
        ));
    }
    Ok(())
}

/// A peer with any deferred reply is WANTING or IN.
pub fn check_waiting_implies_want_or_in(set: &[Snapshot]) -> Result<(), InvariantViolation> {
    for s in set {
        if !s.any_waiting() {
            continue;
        }
        if s.state != MutexState::Wanting && s.state != MutexState::In {
            return Err(InvariantViolation::new(
                InvariantKind::WaitingImpliesWantOrIn,
                format!(
                    "peer {} defers replies while neither wanting nor inside",
                    s.pid
                ),
            ));
        }
    }
    Ok(())
}

/// If every peer is IDLE, nobody defers and nothing is in transit.
pub fn check_idle_cluster_clean(set: &[Snapshot]) -> Result<(), InvariantViolation> {
    if !set.iter().all(|s| s.state == MutexState::Idle) {
        return Ok(());
    }

    for s in set {
        if s.any_waiting() {
            return Err(InvariantViolation::new(
                InvariantKind::IdleClusterClean,
                format!("peer {} defers replies on an all-idle cluster", s.pid),
            ));
        }
        if !s.intercepted_msgs.is_empty() {
            return Err(InvariantViolation::new(
                InvariantKind::IdleClusterClean,
                format!(
                    "peer {} recorded in-transit messages on an all-idle cluster",
                    s.pid
                ),
            ));
        }
    }
    Ok(())
}

/// A peer with State = IN holds exactly N-1 permissions.
pub fn check_in_cs_has_all_consents(set: &[Snapshot]) -> Result<(), InvariantViolation> {
    let required = set.len() - 1;
    for s in set {
        if s.state == MutexState::In && s.nbr_resps != required {
            return Err(InvariantViolation::new(
                InvariantKind::InCsHasAllConsents,
                format!(
                    "peer {} is inside with {} of {} permissions",
                    s.pid, s.nbr_resps, required
                ),
            ));
        }
    }
    Ok(())
}

/// No peer defers the reply to a peer that is inside.
pub fn check_no_deferral_of_holder(set: &[Snapshot]) -> Result<(), InvariantViolation> {
    for holder in set.iter().filter(|s| s.state == MutexState::In) {
        for q in set {
            if q.waiting.get(holder.pid).copied().unwrap_or(false) {
                return Err(InvariantViolation::new(
                    InvariantKind::NoDeferralOfHolder,
                    format!(
                        "peer {} defers the reply to critical-section holder {}",
                        q.pid, holder.pid
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// An idle peer has no deferred replies.
pub fn check_idle_does_not_defer(set: &[Snapshot]) -> Result<(), InvariantViolation> {
    for s in set {
        if s.state == MutexState::Idle && s.any_waiting() {
            return Err(InvariantViolation::new(
                InvariantKind::IdleDoesNotDefer,
                format!("peer {} is idle but defers replies", s.pid),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::record::InterceptedMsg;

    fn record(pid: usize, state: MutexState, n: usize) -> Snapshot {
        Snapshot {
            id: 0,
            pid,
            state,
            waiting: vec![false; n],
            local_clock: 0,
            req_ts: 0,
            nbr_resps: if state == MutexState::In { n - 1 } else { 0 },
            intercepted_msgs: Vec::new(),
            collected_markers: 0,
        }
    }

    #[test]
    fn test_clean_idle_set_passes() {
        let set = vec![
            record(0, MutexState::Idle, 3),
            record(1, MutexState::Idle, 3),
            record(2, MutexState::Idle, 3),
        ];
        for checker in CHECKERS {
            checker(&set).unwrap();
        }
    }

    #[test]
    fn test_single_holder_passes() {
        let mut set = vec![
            record(0, MutexState::In, 3),
            record(1, MutexState::Wanting, 3),
            record(2, MutexState::Idle, 3),
        ];
        set[1].waiting = vec![false, false, true];
        for checker in CHECKERS {
            checker(&set).unwrap();
        }
    }

    #[test]
    fn test_two_holders_rejected() {
        let set = vec![
            record(0, MutexState::In, 3),
            record(1, MutexState::In, 3),
            record(2, MutexState::Idle, 3),
        ];
        let violation = check_mutual_exclusion(&set).unwrap_err();
        assert_eq!(violation.kind, InvariantKind::MutualExclusion);
    }

    #[test]
    fn test_deferral_without_interest_rejected() {
        let mut set = vec![record(0, MutexState::Idle, 2), record(1, MutexState::Idle, 2)];
        set[0].waiting = vec![false, true];
        let violation = check_waiting_implies_want_or_in(&set).unwrap_err();
        assert_eq!(violation.kind, InvariantKind::WaitingImpliesWantOrIn);
        let violation = check_idle_does_not_defer(&set).unwrap_err();
        assert_eq!(violation.kind, InvariantKind::IdleDoesNotDefer);
    }

    #[test]
    fn test_idle_cluster_with_traffic_rejected() {
        let mut set = vec![record(0, MutexState::Idle, 2), record(1, MutexState::Idle, 2)];
        set[1].intercepted_msgs.push(InterceptedMsg {
            from: "mock:0".to_string(),
            message: "respOk;0".to_string(),
        });
        let violation = check_idle_cluster_clean(&set).unwrap_err();
        assert_eq!(violation.kind, InvariantKind::IdleClusterClean);

        // The same traffic is fine once someone is interested.
        set[0].state = MutexState::Wanting;
        check_idle_cluster_clean(&set).unwrap();
    }

    #[test]
    fn test_holder_short_of_consents_rejected() {
        let mut set = vec![
            record(0, MutexState::In, 3),
            record(1, MutexState::Idle, 3),
            record(2, MutexState::Idle, 3),
        ];
        set[0].nbr_resps = 1;
        let violation = check_in_cs_has_all_consents(&set).unwrap_err();
        assert_eq!(violation.kind, InvariantKind::InCsHasAllConsents);

        // Overshoot (a double-counted permission) is just as inconsistent.
        set[0].nbr_resps = 4;
        let violation = check_in_cs_has_all_consents(&set).unwrap_err();
        assert_eq!(violation.kind, InvariantKind::InCsHasAllConsents);
    }

    #[test]
    fn test_deferred_holder_rejected() {
        let mut set = vec![
            record(0, MutexState::In, 3),
            record(1, MutexState::Wanting, 3),
            record(2, MutexState::Idle, 3),
        ];
        set[1].waiting = vec![true, false, false];
        let violation = check_no_deferral_of_holder(&set).unwrap_err();
        assert_eq!(violation.kind, InvariantKind::NoDeferralOfHolder);
    }

    #[test]
    fn test_verify_all_lockstep() {
        let clean = record(0, MutexState::Idle, 2);
        let mut bad = record(1, MutexState::Idle, 2);
        bad.waiting = vec![true, false];

        // Second set holds the violation; the index must say so.
        let records = vec![
            vec![clean.clone(), clean.clone()],
            vec![record(1, MutexState::Idle, 2), bad],
        ];
        let err = verify_all(&records).unwrap_err();
        match err {
            VerifyError::Violation { snapshot_index, .. } => assert_eq!(snapshot_index, 1),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_verify_all_count_mismatch() {
        let records = vec![
            vec![record(0, MutexState::Idle, 2)],
            vec![],
        ];
        let err = verify_all(&records).unwrap_err();
        match err {
            VerifyError::RecordCountMismatch { peer, records, expected } => {
                assert_eq!(peer, 1);
                assert_eq!(records, 0);
                assert_eq!(expected, 1);
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
