//! Journal kept in process memory

use std::sync::Mutex;

use async_trait::async_trait;

use super::{Journal, JournalRecord};
use crate::error::Result;
use crate::request::Request;

/// Entries are lost with the process; useful for tests and `--no-journal` runs
#[derive(Debug, Default)]
pub struct InMemoryJournal {
    entries: Mutex<Vec<JournalRecord>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<JournalRecord>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a raw record as is, bypassing validation
    pub fn insert_record(&self, record: JournalRecord) {
        self.entries().push(record);
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn put(&self, request: &Request) -> Result<Request> {
        let mut entries = self.entries();
        if let Some(existing) = entries.iter().find(|r| r.id == request.id()) {
            return Ok(request.clone().with_timestamp(existing.timestamp));
        }

        entries.push(JournalRecord::from_request(request));
        Ok(request.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Request>> {
        let record = self.entries().iter().find(|r| r.id == id).cloned();
        record.map(JournalRecord::into_request).transpose()
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|r| r.id != id);
        Ok(entries.len() < before)
    }

    async fn records(&self) -> Result<Vec<JournalRecord>> {
        let mut records = self.entries().clone();
        // Stable sort keeps insertion order among equal timestamps
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}
