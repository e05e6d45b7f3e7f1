//! Volatile `HistoryStore` used by tests, the benchmark and hosts without a database.

use parking_lot::RwLock;

use crate::error::Result;
use crate::history::HistoryStore;
use crate::ipc::events::ActivityRecord;

#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<Vec<ActivityRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn all(&self) -> Vec<ActivityRecord> {
        self.records.read().clone()
    }
}

impl HistoryStore for InMemoryStore {
    fn append(&self, record: &ActivityRecord) -> Result<()> {
        self.records.write().push(record.clone());
        Ok(())
    }

    fn query(&self, from: u64, to: u64) -> Result<Vec<ActivityRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.overlaps(from, to))
            .cloned()
            .collect())
    }

    fn last(&self) -> Result<Option<ActivityRecord>> {
        Ok(self.records.read().last().cloned())
    }
}
