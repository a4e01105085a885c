pub mod coordinator;
pub mod invariants;
pub mod parser;
pub mod record;

pub use coordinator::{
    initiator_for_epoch, MarkerProgress, SnapshotCoordinator, SNAPSHOT_INTERVAL,
};
pub use invariants::{verify_all, InvariantKind, InvariantViolation, VerifyError};
pub use parser::{DumpParser, ReplayError};
pub use record::{dump_path, DumpError, InterceptedMsg, Snapshot};
