//! JSONL-based journal ledger backend.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{MemoryLedger, TrialLedger, TrialRecord};
use crate::error::{Error, Result};

/// How many times a contended file lock is retried before giving up.
const LOCK_ATTEMPTS: u32 = 8;
/// First backoff delay; doubled after every failed attempt.
const LOCK_BACKOFF: Duration = Duration::from_millis(5);

/// One journal line.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Entry {
    /// Full row after a write; the last `put` for an id wins on replay.
    Put { record: TrialRecord },
    /// Rollback marker: rows with a larger id are dropped on replay.
    DeleteAfter { trial_id: u64 },
}

/// A ledger that appends every write as a JSON line and keeps a replayed
/// copy in memory for reads.
///
/// Multiple processes can share one journal: appends take an exclusive
/// file lock, replays a shared one. Contended locks are retried with
/// exponential backoff; once the attempts run out the operation fails with
/// [`Error::Storage`], which the manager treats as fatal.
///
/// # Examples
///
/// ```no_run
/// use tuner::storage::{JournalLedger, TrialLedger};
///
/// let ledger = JournalLedger::open("work/trials.jsonl").unwrap();
/// let next = ledger.next_trial_id().unwrap();
/// ```
pub struct JournalLedger {
    memory: MemoryLedger,
    path: PathBuf,
    /// Serialise in-process writes so the file lock is held briefly.
    write_lock: Mutex<()>,
}

impl JournalLedger {
    /// Opens (or prepares to create) a journal and replays its rows.
    ///
    /// A missing file yields an empty ledger; the file is created on the
    /// first write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file exists but cannot be read,
    /// locked, or parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let rows = replay(&path)?;
        Ok(Self {
            memory: MemoryLedger::with_trials(rows.into_values()),
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the journal, picking up writes made by other processes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the journal cannot be replayed.
    pub fn reload(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        let rows = replay(&self.path)?;
        self.memory.replace(rows);
        Ok(())
    }

    fn append(&self, entry: &Entry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::Storage(e.to_string()))?;

        lock_with_retry(&file, true)?;

        let line = serde_json::to_string(entry)?;
        let written = writeln!(file, "{line}").and_then(|()| file.flush());

        FileExt::unlock(&file).map_err(|e| Error::Storage(e.to_string()))?;
        written.map_err(|e| Error::Storage(e.to_string()))
    }
}

impl TrialLedger for JournalLedger {
    fn update(&self, trial_id: u64, f: &mut dyn FnMut(&mut TrialRecord)) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut record = self
            .memory
            .trial(trial_id)?
            .unwrap_or_else(|| TrialRecord::new(trial_id));
        f(&mut record);
        self.append(&Entry::Put {
            record: record.clone(),
        })?;
        self.memory.put(record);
        Ok(())
    }

    fn trial(&self, trial_id: u64) -> Result<Option<TrialRecord>> {
        self.memory.trial(trial_id)
    }

    fn trials(&self) -> Result<Vec<TrialRecord>> {
        self.memory.trials()
    }

    fn delete_after(&self, trial_id: u64) -> Result<usize> {
        let _guard = self.write_lock.lock();
        self.append(&Entry::DeleteAfter { trial_id })?;
        Ok(self.memory.truncate_after(trial_id))
    }
}

/// Try to take the file lock, backing off exponentially while it is contended.
fn lock_with_retry(file: &File, exclusive: bool) -> Result<()> {
    let mut delay = LOCK_BACKOFF;
    let mut last_error = String::new();
    for attempt in 1..=LOCK_ATTEMPTS {
        let locked = if exclusive {
            FileExt::try_lock_exclusive(file)
        } else {
            FileExt::try_lock_shared(file)
        };
        match locked {
            Ok(()) => return Ok(()),
            Err(e) => {
                trace_debug!(attempt, error = %e, "journal lock contended");
                last_error = e.to_string();
                if attempt < LOCK_ATTEMPTS {
                    std::thread::sleep(delay);
                    delay *= 2;
                }
            }
        }
    }
    Err(Error::Storage(format!(
        "could not lock journal after {LOCK_ATTEMPTS} attempts: {last_error}"
    )))
}

/// Replay a journal into rows keyed by id. A missing file is empty.
fn replay(path: &Path) -> Result<BTreeMap<u64, TrialRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(Error::Storage(e.to_string())),
    };

    lock_with_retry(&file, false)?;

    let mut rows = BTreeMap::new();
    let mut outcome = Ok(());
    for (number, line) in BufReader::new(&file).lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                outcome = Err(Error::Storage(e.to_string()));
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Entry>(line) {
            Ok(Entry::Put { record }) => {
                rows.insert(record.trial_id, record);
            }
            Ok(Entry::DeleteAfter { trial_id }) => {
                rows.retain(|&id, _| id <= trial_id);
            }
            Err(e) => {
                outcome = Err(Error::Storage(format!(
                    "{}:{}: {e}",
                    path.display(),
                    number + 1
                )));
                break;
            }
        }
    }

    FileExt::unlock(&file).map_err(|e| Error::Storage(e.to_string()))?;
    outcome.map(|()| rows)
}
