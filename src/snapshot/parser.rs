//! Offline replay of the per-peer snapshot dumps.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use super::record::{dump_path, Snapshot};

/// The per-peer record matrix loaded from disk: `records()[p][k]` is the
/// k-th snapshot that completed at peer `p`.
#[derive(Debug)]
pub struct DumpParser {
    records_by_peer: Vec<Vec<Snapshot>>,
}

impl DumpParser {
    /// Load the dump files of all `n` peers from `dir`.
    ///
    /// A missing file is read as zero records; the verifier's record-count
    /// check then reports the mismatch with a better diagnostic than an
    /// open error would.
    pub fn load(dir: &Path, n: usize) -> Result<Self, ReplayError> {
        let mut records_by_peer = Vec::with_capacity(n);
        for peer in 0..n {
            records_by_peer.push(read_dump(&dump_path(dir, peer), peer)?);
        }
        Ok(DumpParser { records_by_peer })
    }

    pub fn records(&self) -> &[Vec<Snapshot>] {
        &self.records_by_peer
    }
}

fn read_dump(path: &PathBuf, peer: usize) -> Result<Vec<Snapshot>, ReplayError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ReplayError::Open {
                peer,
                path: path.clone(),
                source,
            })
        }
    };

    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| ReplayError::Read {
            peer,
            line: idx + 1,
            source,
        })?;
        if line.is_empty() {
            continue;
        }
        let record: Snapshot =
            serde_json::from_str(&line).map_err(|source| ReplayError::Decode {
                peer,
                line: idx + 1,
                source,
            })?;
        records.push(record);
    }
    Ok(records)
}

/// Failure to replay a dump file. Carries the offending peer and line.
#[derive(Debug)]
pub enum ReplayError {
    Open {
        peer: usize,
        path: PathBuf,
        source: std::io::Error,
    },
    Read {
        peer: usize,
        line: usize,
        source: std::io::Error,
    },
    Decode {
        peer: usize,
        line: usize,
        source: serde_json::Error,
    },
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayError::Open { peer, path, source } => {
                write!(f, "peer {}: failed opening {:?}: {}", peer, path, source)
            }
            ReplayError::Read { peer, line, source } => {
                write!(f, "peer {}: failed reading line {}: {}", peer, line, source)
            }
            ReplayError::Decode { peer, line, source } => {
                write!(f, "peer {}: line {} is not a snapshot record: {}", peer, line, source)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::MutexState;
    use crate::snapshot::record::dump_path;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dimutex_parser_{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn idle_record(pid: usize, id: u64, n: usize) -> Snapshot {
        Snapshot {
            id,
            pid,
            state: MutexState::Idle,
            waiting: vec![false; n],
            local_clock: 0,
            req_ts: 0,
            nbr_resps: 0,
            intercepted_msgs: Vec::new(),
            collected_markers: 0,
        }
    }

    #[test]
    fn test_load_round_trip() {
        let dir = test_dir("round_trip");
        for pid in 0..3 {
            for id in 0..2 {
                idle_record(pid, id, 3).dump_to_file(&dir).unwrap();
            }
        }

        let parser = DumpParser::load(&dir, 3).unwrap();
        assert_eq!(parser.records().len(), 3);
        for (pid, records) in parser.records().iter().enumerate() {
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].pid, pid);
            assert_eq!(records[0].id, 0);
            assert_eq!(records[1].id, 1);
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = test_dir("missing");
        let parser = DumpParser::load(&dir, 2).unwrap();
        assert!(parser.records().iter().all(|r| r.is_empty()));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_line_names_peer_and_line() {
        let dir = test_dir("corrupt");
        idle_record(1, 0, 2).dump_to_file(&dir).unwrap();
        std::fs::write(
            dump_path(&dir, 0),
            "{\"ID\":0,\"PID\":0,\"State\":0,\"Waiting\":[false,false],\"LocalClock\":0,\"ReqTs\":0,\"NbrResps\":0,\"InterceptedMsgs\":[]}\nnot json\n",
        )
        .unwrap();

        let err = DumpParser::load(&dir, 2).unwrap_err();
        match err {
            ReplayError::Decode { peer, line, .. } => {
                assert_eq!(peer, 0);
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error: {}", other),
        }

        let _ = std::fs::remove_dir_all(&dir);
    }
}
