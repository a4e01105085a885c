//! The persisted snapshot record and its dump format.
//!
//! One file per peer, `snapshots-pid-<PID>.txt`, append-only, one JSON
//! object per line. Field names and the numeric `State` encoding are part
//! of the on-disk contract; the verifier replays them after shutdown.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::mutex::MutexState;

/// An application-level message recorded as in-transit on some incoming
/// channel. `From` is the delivery envelope's source address; the sender's
/// peer id is encoded in `Message` itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptedMsg {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "Message")]
    pub message: String,
}

/// One peer's contribution to a global snapshot.
///
/// Created when the first marker for its id arrives, mutated only by the
/// recording peer (appending intercepted messages and counting markers),
/// and frozen into the dump file once N-1 markers have been received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "PID")]
    pub pid: usize,
    #[serde(rename = "State")]
    pub state: MutexState,
    #[serde(rename = "Waiting")]
    pub waiting: Vec<bool>,
    #[serde(rename = "LocalClock")]
    pub local_clock: u64,
    #[serde(rename = "ReqTs")]
    pub req_ts: u64,
    #[serde(rename = "NbrResps")]
    pub nbr_resps: usize,
    #[serde(rename = "InterceptedMsgs")]
    pub intercepted_msgs: Vec<InterceptedMsg>,

    /// Markers received for this id. Not persisted.
    #[serde(skip)]
    pub collected_markers: usize,
}

impl Snapshot {
    /// True if any deferred-reply bit was recorded.
    pub fn any_waiting(&self) -> bool {
        self.waiting.iter().any(|&w| w)
    }

    /// Append this record as one JSON line to the peer's dump file.
    pub fn dump_to_file(&self, dir: &Path) -> Result<(), DumpError> {
        let path = dump_path(dir, self.pid);

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|source| DumpError::Open {
                path: path.clone(),
                source,
            })?;

        let line = serde_json::to_string(self).map_err(DumpError::Encode)?;

        writeln!(file, "{}", line).map_err(|source| DumpError::Write { path, source })?;

        Ok(())
    }
}

/// Dump file path for a peer: `<dir>/snapshots-pid-<pid>.txt`.
pub fn dump_path(dir: &Path, pid: usize) -> PathBuf {
    dir.join(format!("snapshots-pid-{}.txt", pid))
}

/// Failure to persist a snapshot record.
#[derive(Debug)]
pub enum DumpError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Encode(serde_json::Error),
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl fmt::Display for DumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpError::Open { path, source } => {
                write!(f, "failed opening {:?} for append: {}", path, source)
            }
            DumpError::Encode(e) => write!(f, "failed encoding snapshot record: {}", e),
            DumpError::Write { path, source } => {
                write!(f, "failed writing to {:?}: {}", path, source)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Snapshot {
        Snapshot {
            id: 0,
            pid: 1,
            state: MutexState::Wanting,
            waiting: vec![true, false, false],
            local_clock: 3,
            req_ts: 2,
            nbr_resps: 1,
            intercepted_msgs: vec![InterceptedMsg {
                from: "127.0.0.1:5001".to_string(),
                message: "respOk;2".to_string(),
            }],
            collected_markers: 2,
        }
    }

    #[test]
    fn test_json_shape() {
        let line = serde_json::to_string(&record()).unwrap();
        assert_eq!(
            line,
            r#"{"ID":0,"PID":1,"State":1,"Waiting":[true,false,false],"LocalClock":3,"ReqTs":2,"NbrResps":1,"InterceptedMsgs":[{"From":"127.0.0.1:5001","Message":"respOk;2"}]}"#
        );
    }

    #[test]
    fn test_json_round_trip_skips_counter() {
        let line = serde_json::to_string(&record()).unwrap();
        let back: Snapshot = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id, 0);
        assert_eq!(back.pid, 1);
        assert_eq!(back.state, MutexState::Wanting);
        assert_eq!(back.waiting, vec![true, false, false]);
        assert_eq!(back.intercepted_msgs.len(), 1);
        assert_eq!(back.collected_markers, 0);
    }

    #[test]
    fn test_dump_appends_lines() {
        let dir = std::env::temp_dir().join("dimutex_record_test");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let rec = record();
        rec.dump_to_file(&dir).unwrap();
        rec.dump_to_file(&dir).unwrap();

        let content = std::fs::read_to_string(dump_path(&dir, 1)).unwrap();
        assert_eq!(content.lines().count(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
