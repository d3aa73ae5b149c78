/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! An in-memory `RemoteStore` fake, the remote-side counterpart to
//! `LocalStore::open_in_memory`, so the coordinator, ingestor, and the
//! end-to-end scenarios in `tests/scenarios.rs` can run without a real
//! server. Supports manual failure injection for exercising the retry and
//! backoff paths.

use crate::error::{Error, Result};
use crate::record::SyncedRecord;
use crate::sync::remote::{ChangeKind, RemoteChange, RemoteStore};
use crate::timestamp::Timestamp;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};

#[derive(Default)]
struct Inner {
    tables: HashMap<String, HashMap<String, SyncedRecord>>,
    changes: VecDeque<RemoteChange>,
    fail_next: usize,
}

#[derive(Default)]
pub struct InMemoryRemoteStore {
    inner: Mutex<Inner>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        InMemoryRemoteStore::default()
    }

    /// The next `n` calls into any `RemoteStore` method return a
    /// transient-transport error, for exercising retry/backoff.
    pub fn inject_failures(&self, n: usize) {
        self.inner.lock().fail_next = n;
    }

    fn maybe_fail(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(Error::Transport("injected failure".into()));
        }
        Ok(())
    }

    /// Seeds a row directly, bypassing `insert`/`update` - for setting up
    /// remote-side state in a test without going through the engine.
    pub fn seed(&self, table: &str, record: SyncedRecord) {
        self.inner
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(record.id.clone().into_string(), record);
    }

    /// Simulates another device's write arriving over the realtime
    /// channel: updates the canonical remote row and enqueues the change
    /// for the next `poll_changes`.
    pub fn push_remote_change(&self, table: &str, kind: ChangeKind, row: SyncedRecord) {
        let mut inner = self.inner.lock();
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(row.id.clone().into_string(), row.clone());
        inner.changes.push_back(RemoteChange {
            table: table.to_string(),
            kind,
            row,
        });
    }

    pub fn get(&self, table: &str, id: &str) -> Option<SyncedRecord> {
        self.inner.lock().tables.get(table)?.get(id).cloned()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.inner.lock().tables.get(table).map(HashMap::len).unwrap_or(0)
    }
}

impl RemoteStore for InMemoryRemoteStore {
    fn select_by_id(&self, table: &str, id: &str) -> Result<Option<SyncedRecord>> {
        self.maybe_fail()?;
        Ok(self.inner.lock().tables.get(table).and_then(|t| t.get(id).cloned()))
    }

    fn select_by_field(&self, table: &str, field: &str, value: &JsonValue) -> Result<Vec<SyncedRecord>> {
        self.maybe_fail()?;
        let inner = self.inner.lock();
        let Some(rows) = inner.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows.values().filter(|r| r.get(field) == Some(value)).cloned().collect())
    }

    fn select_updated_since(&self, table: &str, since: Timestamp) -> Result<Vec<SyncedRecord>> {
        self.maybe_fail()?;
        let inner = self.inner.lock();
        let Some(rows) = inner.tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<SyncedRecord> = rows.values().filter(|r| r.updated_at > since).cloned().collect();
        out.sort_by_key(|r| r.updated_at);
        Ok(out)
    }

    fn insert(&self, table: &str, record: &SyncedRecord) -> Result<()> {
        self.maybe_fail()?;
        self.inner
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(record.id.clone().into_string(), record.clone());
        Ok(())
    }

    fn update(&self, table: &str, record: &SyncedRecord) -> Result<()> {
        self.maybe_fail()?;
        self.inner
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(record.id.clone().into_string(), record.clone());
        Ok(())
    }

    fn soft_delete(&self, table: &str, id: &str, updated_at: Timestamp) -> Result<()> {
        self.maybe_fail()?;
        let mut inner = self.inner.lock();
        if let Some(row) = inner.tables.entry(table.to_string()).or_default().get_mut(id) {
            row.deleted = true;
            row.updated_at = updated_at;
        }
        Ok(())
    }

    fn poll_changes(&self) -> Result<Vec<RemoteChange>> {
        self.maybe_fail()?;
        Ok(self.inner.lock().changes.drain(..).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::guid::Guid;

    #[test]
    fn inserted_rows_are_visible_to_select_updated_since() {
        let remote = InMemoryRemoteStore::new();
        let rec = SyncedRecord::new(Guid::from("a"), "user-1", Guid::from("dev-1"), Timestamp::from_millis(100));
        remote.insert("goals", &rec).unwrap();
        let rows = remote.select_updated_since("goals", Timestamp::from_millis(0)).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn injected_failures_are_consumed_once_each() {
        let remote = InMemoryRemoteStore::new();
        remote.inject_failures(2);
        let rec = SyncedRecord::new(Guid::from("a"), "user-1", Guid::from("dev-1"), Timestamp::from_millis(100));
        assert!(remote.insert("goals", &rec).is_err());
        assert!(remote.insert("goals", &rec).is_err());
        assert!(remote.insert("goals", &rec).is_ok());
    }
}
