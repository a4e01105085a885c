//! The mutual-exclusion engine.
//!
//! One reactive event loop per peer implements Ricart–Agrawala with
//! Lamport-clock timestamps and (timestamp, id) lexicographic tie-break.
//! Events come from two inbound sources (application requests and link
//! deliveries) plus the periodic snapshot-initiation tick; each event is
//! processed atomically to completion before the next. No field of the
//! mutual-exclusion state is ever touched outside the event consumer;
//! that discipline is the correctness contract of the algorithm, and the
//! snapshot coordinator piggybacks on the same loop.

use std::path::PathBuf;
use std::time::SystemTime;

use crossbeam_channel::{never, select, tick, unbounded, Receiver, Sender};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::link::{Delivered, LinkHandle, Outgoing};
use crate::snapshot::{initiator_for_epoch, Snapshot, SnapshotCoordinator, SNAPSHOT_INTERVAL};

use super::message::PeerMessage;
use super::peers::{PeerBitset, PeerGroup};

/// Mutual-exclusion state of a peer.
///
/// Serialized numerically (IDLE=0, WANTING=1, IN=2); the encoding is part
/// of the snapshot dump contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexState {
    /// Not interested in the critical section.
    Idle,
    /// Requested entry, collecting permissions.
    Wanting,
    /// Inside the critical section.
    In,
}

impl MutexState {
    fn as_u8(self) -> u8 {
        match self {
            MutexState::Idle => 0,
            MutexState::Wanting => 1,
            MutexState::In => 2,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MutexState::Idle),
            1 => Some(MutexState::Wanting),
            2 => Some(MutexState::In),
            _ => None,
        }
    }
}

impl Serialize for MutexState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for MutexState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = u8::deserialize(deserializer)?;
        MutexState::from_u8(v)
            .ok_or_else(|| D::Error::custom(format!("invalid mutex state {}", v)))
    }
}

/// A request from the application layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppRequest {
    /// Ask for the critical section. Legal only when idle.
    Enter,
    /// Release the critical section. Legal only when inside.
    Exit,
}

/// Indication that the critical section has been granted. The application
/// must submit [`AppRequest::Exit`] to release it.
#[derive(Debug, Clone, Copy)]
pub struct Grant;

/// The application side of a peer: submit requests, await grants.
pub struct AppHandle {
    pub req: Sender<AppRequest>,
    pub grant: Receiver<Grant>,
}

/// Strict total order over requests: does request `a` come after `b`?
/// Ties on timestamp break toward the smaller peer id.
#[inline]
fn after(a_ts: u64, a_id: usize, b_ts: u64, b_id: usize) -> bool {
    a_ts > b_ts || (a_ts == b_ts && a_id > b_id)
}

/// One peer of the mutual-exclusion group.
pub struct MutexNode {
    group: PeerGroup,
    st: MutexState,
    /// Bit j set means peer j's entry request is deferred here.
    waiting: PeerBitset,
    /// Local logical clock. Never decreases.
    lcl: u64,
    /// Timestamp stamped on the outstanding request.
    req_ts: u64,
    /// RESP_OK count for the outstanding request.
    nbr_resps: usize,
    /// Failure injection: count each RESP_OK twice.
    fail: bool,

    outbox: Sender<Outgoing>,
    inbox: Receiver<Delivered>,
    app_rx: Receiver<AppRequest>,
    grant_tx: Sender<Grant>,

    snapshots: SnapshotCoordinator,
}

impl MutexNode {
    /// Create a peer over an already-bound link. Returns the node and the
    /// application handle feeding it.
    pub fn new(group: PeerGroup, link: LinkHandle, dump_dir: PathBuf) -> (Self, AppHandle) {
        let (req_tx, req_rx) = unbounded();
        let (grant_tx, grant_rx) = unbounded();

        let snapshots = SnapshotCoordinator::new(group.len(), dump_dir);

        let node = MutexNode {
            group,
            st: MutexState::Idle,
            waiting: PeerBitset::new(),
            lcl: 0,
            req_ts: 0,
            nbr_resps: 0,
            fail: false,
            outbox: link.req,
            inbox: link.ind,
            app_rx: req_rx,
            grant_tx,
            snapshots,
        };

        let handle = AppHandle {
            req: req_tx,
            grant: grant_rx,
        };

        (node, handle)
    }

    /// Enable failure injection: every RESP_OK is counted twice, letting
    /// this peer enter the critical section one permission short. Used to
    /// demonstrate the verifier catching a violation.
    pub fn with_failure_injection(mut self) -> Self {
        self.fail = true;
        self
    }

    // =========================================================================
    // EVENT LOOP
    // =========================================================================

    /// Run the event loop until both inbound channels disconnect.
    ///
    /// The initiator tick shares the same `select!`, so its effect
    /// (a self-addressed marker) serializes with ordinary event handling.
    pub fn run(&mut self) {
        let mut app_rx = self.app_rx.clone();
        let mut inbox = self.inbox.clone();
        let ticker = tick(SNAPSHOT_INTERVAL);

        let mut app_open = true;
        let mut link_open = true;

        while app_open || link_open {
            select! {
                recv(app_rx) -> req => match req {
                    Ok(req) => self.handle_app_request(req),
                    Err(_) => {
                        app_open = false;
                        app_rx = never();
                    }
                },
                recv(inbox) -> envelope => match envelope {
                    Ok(envelope) => self.deliver(envelope),
                    Err(_) => {
                        link_open = false;
                        inbox = never();
                    }
                },
                recv(ticker) -> _ => self.maybe_initiate(SystemTime::now()),
            }
        }
    }

    /// Process one buffered link delivery. Returns false if none is
    /// pending. Test harnesses use this to drive explicit schedules.
    pub fn process_one(&mut self) -> bool {
        match self.inbox.try_recv() {
            Ok(envelope) => {
                self.deliver(envelope);
                true
            }
            Err(_) => false,
        }
    }

    /// Drain every buffered link delivery.
    pub fn process_all(&mut self) {
        while self.process_one() {}
    }

    /// Dispatch an application request.
    pub fn handle_app_request(&mut self, req: AppRequest) {
        match req {
            AppRequest::Enter => {
                debug!(id = self.id(), "application requests entry");
                self.handle_entry();
            }
            AppRequest::Exit => {
                debug!(id = self.id(), "application releases");
                self.handle_exit();
            }
        }
    }

    /// Lift one delivery into a typed message and dispatch it. Application
    /// messages pass through the snapshot interception point before their
    /// handler runs, so recorded state predates every captured message.
    /// A payload that fails to parse is logged and dropped; no error
    /// crosses an event boundary.
    pub fn deliver(&mut self, envelope: Delivered) {
        let msg = match PeerMessage::parse(&envelope.message) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(id = self.id(), from = %envelope.from, "dropped delivery: {}", e);
                return;
            }
        };

        match msg {
            PeerMessage::Snap { snap_id } => {
                debug!(id = self.id(), snap_id, "marker received");
                self.handle_marker(snap_id);
            }
            PeerMessage::ReqEntry { id, ts } => {
                self.snapshots.intercept(&envelope.from, &envelope.message);
                debug!(id = self.id(), from_peer = id, ts, "entry request received");
                self.handle_req_entry(id, ts);
            }
            PeerMessage::RespOk { id } => {
                self.snapshots.intercept(&envelope.from, &envelope.message);
                debug!(id = self.id(), from_peer = id, "permission received");
                self.handle_resp_ok();
            }
        }
    }

    // =========================================================================
    // RICART–AGRAWALA HANDLERS
    // =========================================================================

    /// Upon ENTER: stamp a fresh timestamp, reset the response count,
    /// broadcast the request, move to WANTING.
    fn handle_entry(&mut self) {
        self.lcl += 1;
        self.req_ts = self.lcl;
        self.nbr_resps = 0;
        let msg = PeerMessage::ReqEntry {
            id: self.id(),
            ts: self.req_ts,
        };
        for j in self.group.others() {
            self.send(j, &msg);
        }
        self.st = MutexState::Wanting;
    }

    /// Upon EXIT: release every deferred requester, clear the deferred
    /// set, move to IDLE. The clock and request timestamp are untouched.
    fn handle_exit(&mut self) {
        let msg = PeerMessage::RespOk { id: self.id() };
        for j in self.group.others() {
            if self.waiting.contains(j) {
                self.send(j, &msg);
            }
        }
        self.st = MutexState::Idle;
        self.waiting.clear();
    }

    /// Upon delivery of REQ_ENTRY from peer `j` with timestamp `ts`:
    /// grant immediately when idle or when our own outstanding request
    /// loses the (ts, id) order; defer otherwise. The local clock absorbs
    /// the received timestamp either way.
    fn handle_req_entry(&mut self, j: usize, ts: u64) {
        let yield_now = self.st == MutexState::Idle
            || (self.st == MutexState::Wanting && after(self.req_ts, self.id(), ts, j));

        if yield_now {
            self.send(j, &PeerMessage::RespOk { id: self.id() });
        } else {
            debug_assert!(j != self.id(), "a peer never defers itself");
            self.waiting.insert(j);
        }

        self.lcl = self.lcl.max(ts);
    }

    /// Upon delivery of RESP_OK: count it (twice under failure
    /// injection); entering the critical section requires exactly N-1
    /// permissions, at which point the application gets its grant.
    fn handle_resp_ok(&mut self) {
        self.nbr_resps += 1;
        if self.fail {
            self.nbr_resps += 1;
        }

        if self.nbr_resps == self.group.len() - 1 {
            self.st = MutexState::In;
            let _ = self.grant_tx.send(Grant);
        }
    }

    // =========================================================================
    // SNAPSHOT PIGGYBACK
    // =========================================================================

    /// Upon delivery of a marker: on the first marker for a new id, copy
    /// the mutual-exclusion state into a fresh record and forward the
    /// marker on every outgoing channel; then count the marker toward
    /// completion.
    fn handle_marker(&mut self, snap_id: u64) {
        if self.snapshots.is_first_marker(snap_id) {
            let record = Snapshot {
                id: snap_id,
                pid: self.id(),
                state: self.st,
                waiting: self.waiting.to_vec(self.group.len()),
                local_clock: self.lcl,
                req_ts: self.req_ts,
                nbr_resps: self.nbr_resps,
                intercepted_msgs: Vec::new(),
                collected_markers: 0,
            };
            self.snapshots.begin(record);

            let marker = PeerMessage::Snap { snap_id };
            for j in self.group.others() {
                self.send(j, &marker);
            }
        }

        self.snapshots.collect_marker();
    }

    /// Initiate a snapshot if this peer owns the current epoch.
    fn maybe_initiate(&mut self, now: SystemTime) {
        if initiator_for_epoch(now, self.group.len()) != self.id() {
            return;
        }
        self.initiate_snapshot();
    }

    /// Start a new snapshot by sending a marker to self; it flows through
    /// the ordinary delivery path like any other marker.
    pub fn initiate_snapshot(&mut self) {
        let snap_id = self.snapshots.next_snap_id();
        info!(id = self.id(), snap_id, "initiating snapshot");
        let marker = PeerMessage::Snap { snap_id };
        let _ = self.outbox.send(Outgoing {
            to: self.group.self_addr().to_string(),
            message: marker.encode(),
        });
    }

    // =========================================================================
    // HELPERS AND ACCESSORS
    // =========================================================================

    fn send(&self, j: usize, msg: &PeerMessage) {
        let _ = self.outbox.send(Outgoing {
            to: self.group.addr(j).to_string(),
            message: msg.encode(),
        });
    }

    /// This peer's index.
    pub fn id(&self) -> usize {
        self.group.id()
    }

    /// Current mutual-exclusion state.
    pub fn state(&self) -> MutexState {
        self.st
    }

    /// Current logical clock value.
    pub fn local_clock(&self) -> u64 {
        self.lcl
    }

    /// Timestamp of the outstanding request.
    pub fn request_ts(&self) -> u64 {
        self.req_ts
    }

    /// Permissions collected for the outstanding request.
    pub fn responses(&self) -> usize {
        self.nbr_resps
    }

    /// Whether peer `j`'s request is deferred here.
    pub fn is_deferring(&self, j: usize) -> bool {
        self.waiting.contains(j)
    }

    /// The in-progress or last-completed local snapshot.
    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.current()
    }
}
