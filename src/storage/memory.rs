use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{TrialLedger, TrialRecord};
use crate::error::Result;

/// In-memory trial ledger (the default).
///
/// A thin wrapper around `RwLock<BTreeMap<u64, TrialRecord>>`; every
/// operation holds the lock for its whole read-modify-write.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    trials: RwLock<BTreeMap<u64, TrialRecord>>,
}

impl MemoryLedger {
    /// Creates a new, empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a ledger pre-populated with `trials`.
    #[must_use]
    pub fn with_trials(trials: impl IntoIterator<Item = TrialRecord>) -> Self {
        let trials = trials.into_iter().map(|t| (t.trial_id, t)).collect();
        Self {
            trials: RwLock::new(trials),
        }
    }

    /// Applies `f` and returns the updated row.
    pub(crate) fn apply(
        &self,
        trial_id: u64,
        f: &mut dyn FnMut(&mut TrialRecord),
    ) -> TrialRecord {
        let mut guard = self.trials.write();
        let row = guard
            .entry(trial_id)
            .or_insert_with(|| TrialRecord::new(trial_id));
        f(row);
        row.clone()
    }

    /// Stores a full row as-is.
    pub(crate) fn put(&self, record: TrialRecord) {
        self.trials.write().insert(record.trial_id, record);
    }

    /// Swaps in a freshly replayed set of rows.
    pub(crate) fn replace(&self, rows: BTreeMap<u64, TrialRecord>) {
        *self.trials.write() = rows;
    }

    pub(crate) fn truncate_after(&self, trial_id: u64) -> usize {
        let mut guard = self.trials.write();
        let removed = guard.split_off(&(trial_id + 1));
        removed.len()
    }
}

impl TrialLedger for MemoryLedger {
    fn update(&self, trial_id: u64, f: &mut dyn FnMut(&mut TrialRecord)) -> Result<()> {
        self.apply(trial_id, f);
        Ok(())
    }

    fn trial(&self, trial_id: u64) -> Result<Option<TrialRecord>> {
        Ok(self.trials.read().get(&trial_id).cloned())
    }

    fn trials(&self) -> Result<Vec<TrialRecord>> {
        Ok(self.trials.read().values().cloned().collect())
    }

    fn delete_after(&self, trial_id: u64) -> Result<usize> {
        Ok(self.truncate_after(trial_id))
    }
}
