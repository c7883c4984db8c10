use super::{DurableLog, PersistedState};
use crate::consensus::LogEntry;
use crate::membership::NodeId;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const LOG_FILE: &str = "raft.log";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Record {
    HardState {
        term: u64,
        voted_for: Option<NodeId>,
    },
    Append {
        entry: LogEntry,
    },
    Truncate {
        from: u64,
    },
}

/// Append-only record file. `load` replays records in order; a torn final line is dropped.
///
/// Uses blocking `std::fs`: writes are small and happen under the node's state lock.
#[derive(Debug)]
pub struct FileLog {
    path: PathBuf,
    writer: Mutex<File>,
}

impl FileLog {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
        let path = dir.join(LOG_FILE);
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open log {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_records(&self, records: &[Record]) -> Result<()> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record).context("encode log record")?;
            buf.push(b'\n');
        }
        let mut writer = self.writer.lock();
        writer
            .write_all(&buf)
            .with_context(|| format!("append to {}", self.path.display()))?;
        writer.sync_data().context("sync log")?;
        Ok(())
    }

    /// Rewrite the file with only the live state, replacing it atomically. Appends wait on
    /// the writer lock until the new file is in place.
    pub fn compact(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        let state = self.load()?;
        let tmp = self.path.with_extension("compact");
        {
            let mut file = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
            let mut buf = Vec::new();
            let hard = Record::HardState {
                term: state.term,
                voted_for: state.voted_for.clone(),
            };
            serde_json::to_writer(&mut buf, &hard)?;
            buf.push(b'\n');
            for entry in state.entries {
                serde_json::to_writer(&mut buf, &Record::Append { entry })?;
                buf.push(b'\n');
            }
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path).with_context(|| format!("replace {}", self.path.display()))?;
        *writer = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("reopen {}", self.path.display()))?;
        Ok(())
    }
}

impl DurableLog for FileLog {
    fn load(&self) -> Result<PersistedState> {
        let file = File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
        let mut state = PersistedState::default();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("read {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = lineno + 1,
                        error = %err,
                        "dropping unreadable log tail"
                    );
                    break;
                }
            };
            match record {
                Record::HardState { term, voted_for } => {
                    state.term = term;
                    state.voted_for = voted_for;
                }
                Record::Append { entry } => state.entries.push(entry),
                Record::Truncate { from } => state.entries.truncate(from.saturating_sub(1) as usize),
            }
        }
        Ok(state)
    }

    fn save_hard_state(&self, term: u64, voted_for: Option<&NodeId>) -> Result<()> {
        self.write_records(&[Record::HardState {
            term,
            voted_for: voted_for.cloned(),
        }])
    }

    fn append(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let records: Vec<Record> = entries
            .iter()
            .cloned()
            .map(|entry| Record::Append { entry })
            .collect();
        self.write_records(&records)
    }

    fn truncate_from(&self, index: u64) -> Result<()> {
        self.write_records(&[Record::Truncate { from: index }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ConsensusProposal, ProposalPriority, ProposalValue};
    use tempfile::TempDir;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            proposal: ConsensusProposal::new("n1".into(), ProposalValue::Noop, term, index, ProposalPriority::Normal),
        }
    }

    #[test]
    fn replays_hard_state_appends_and_truncation() {
        let dir = TempDir::new().unwrap();
        let log = FileLog::open(dir.path()).unwrap();
        log.save_hard_state(3, Some(&"n2".into())).unwrap();
        log.append(&[entry(1, 1), entry(2, 2), entry(2, 3)]).unwrap();
        log.truncate_from(3).unwrap();
        log.append(&[entry(3, 3)]).unwrap();
        drop(log);

        let reopened = FileLog::open(dir.path()).unwrap();
        let state = reopened.load().unwrap();
        assert_eq!(state.term, 3);
        assert_eq!(state.voted_for, Some("n2".into()));
        assert_eq!(state.entries.iter().map(|e| e.term).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let log = FileLog::open(dir.path()).unwrap();
        log.append(&[entry(1, 1)]).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap()
            .write_all(b"{\"record\":\"app")
            .unwrap();
        assert_eq!(log.load().unwrap().entries.len(), 1);
    }

    #[test]
    fn compaction_preserves_state() {
        let dir = TempDir::new().unwrap();
        let log = FileLog::open(dir.path()).unwrap();
        log.save_hard_state(1, None).unwrap();
        log.append(&[entry(1, 1), entry(1, 2)]).unwrap();
        log.truncate_from(2).unwrap();
        let before = log.load().unwrap();
        log.compact().unwrap();
        assert_eq!(log.load().unwrap(), before);
        log.append(&[entry(1, 2)]).unwrap();
        assert_eq!(log.load().unwrap().entries.len(), 2);
    }

    #[test]
    fn appends_racing_compaction_are_kept() {
        let dir = TempDir::new().unwrap();
        let log = std::sync::Arc::new(FileLog::open(dir.path()).unwrap());
        let writer = {
            let log = log.clone();
            std::thread::spawn(move || {
                for index in 1..=200 {
                    log.append(&[entry(1, index)]).unwrap();
                }
            })
        };
        for _ in 0..20 {
            log.compact().unwrap();
        }
        writer.join().unwrap();
        let entries = log.load().unwrap().entries;
        assert_eq!(entries.len(), 200);
        assert_eq!(entries.last().map(|e| e.index), Some(200));
    }
}
