/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The Operation Queue (C3): persistent storage for queued intents, with
//! backoff-aware read-back and retry bookkeeping. Write helpers here are
//! tx-scoped so the engine can enqueue an intent in the same transaction
//! as the entity write it describes; read and retry bookkeeping go
//! through `LocalStore`'s own lock since they don't need to share a
//! transaction with an entity write.

use crate::error::Result;
use crate::queue::operation::Operation;
use crate::storage::conn_ext::ConnExt;
use crate::storage::LocalStore;
use crate::timestamp::Timestamp;
use rusqlite::Transaction;
use std::collections::HashSet;

/// Enqueues `op`, returning its assigned `op_id`. Call inside the same
/// write transaction as the entity mutation it describes.
pub fn enqueue(tx: &Transaction<'_>, op: &Operation) -> Result<i64> {
    let value_json = op.value.as_ref().map(serde_json::to_string).transpose()?;
    tx.execute(
        "INSERT INTO operation_queue
            (table_name, entity_id, kind, field, value, enqueued_at, retries, last_attempt_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, NULL)",
        rusqlite::params![
            op.table,
            op.entity_id,
            op.kind,
            op.field,
            value_json,
            op.enqueued_at,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Removes an operation from the queue after it has been pushed
/// successfully (or coalesced away).
pub fn ack(tx: &Transaction<'_>, op_id: i64) -> Result<()> {
    tx.execute("DELETE FROM operation_queue WHERE op_id = ?1", [op_id])?;
    Ok(())
}

/// Records a failed push attempt: increments `retries` and stamps
/// `last_attempt_at`, leaving `enqueued_at` untouched so push ordering
/// is unaffected by retries.
pub fn bump(tx: &Transaction<'_>, op_id: i64, now: Timestamp) -> Result<()> {
    tx.execute(
        "UPDATE operation_queue SET retries = retries + 1, last_attempt_at = ?1 WHERE op_id = ?2",
        rusqlite::params![now, op_id],
    )?;
    Ok(())
}

/// Rewrites a surviving operation's `field`/`value` after coalescing -
/// `enqueued_at`, `retries`, and `last_attempt_at` are untouched.
pub fn update_payload(
    tx: &Transaction<'_>,
    op_id: i64,
    field: Option<&str>,
    value: Option<&serde_json::Value>,
) -> Result<()> {
    let value_json = value.map(serde_json::to_string).transpose()?;
    tx.execute(
        "UPDATE operation_queue SET field = ?1, value = ?2 WHERE op_id = ?3",
        rusqlite::params![field, value_json, op_id],
    )?;
    Ok(())
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Operation> {
    let value_json: Option<String> = row.get("value")?;
    let value = value_json
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    Ok(Operation {
        op_id: Some(row.get("op_id")?),
        table: row.get("table_name")?,
        entity_id: row.get("entity_id")?,
        kind: row.get("kind")?,
        field: row.get("field")?,
        value,
        enqueued_at: row.get("enqueued_at")?,
        retries: row.get::<_, i64>("retries")? as u32,
        last_attempt_at: row.get("last_attempt_at")?,
    })
}

/// Seconds to wait after the most recent attempt before an operation at
/// `retries` failures becomes eligible again: `2^(retries - 1)`.
fn backoff_millis(retries: u32) -> i64 {
    if retries == 0 {
        return 0;
    }
    let secs = 1i64 << (retries - 1).min(30);
    secs * 1000
}

/// A thin, ergonomic wrapper over `LocalStore` for the read/retry side of
/// the queue. Write-side mutations (`enqueue`/`ack`/`bump`) stay as free
/// functions above so they can be called from inside an existing
/// transaction.
pub struct OperationQueue<'a> {
    store: &'a LocalStore,
}

impl<'a> OperationQueue<'a> {
    pub fn new(store: &'a LocalStore) -> Self {
        OperationQueue { store }
    }

    /// Operations eligible for push right now: not past the retry
    /// ceiling, and past their backoff window, ordered oldest-first.
    pub fn pending_ready(&self, retry_ceiling: u32, now: Timestamp) -> Result<Vec<Operation>> {
        let all = self.all()?;
        Ok(all
            .into_iter()
            .filter(|op| op.retries < retry_ceiling)
            .filter(|op| {
                let last = op.last_attempt_at.unwrap_or(op.enqueued_at);
                now.as_millis() - last.as_millis() >= backoff_millis(op.retries)
            })
            .collect())
    }

    /// Every queued operation, oldest-first, regardless of backoff state.
    pub fn all(&self) -> Result<Vec<Operation>> {
        self.store.with_connection(|conn| {
            conn.query_all(
                "SELECT * FROM operation_queue ORDER BY enqueued_at ASC",
                [],
                row_to_operation,
            )
            .map_err(Into::into)
        })
    }

    /// `(table, entity_id)` pairs with at least one queued operation -
    /// used by the realtime ingestor and resolver to detect local writes
    /// still in flight before applying a remote change directly.
    pub fn pending_entity_ids(&self, table: &str) -> Result<HashSet<String>> {
        self.store.with_connection(|conn| {
            let ids: Vec<String> = conn.query_all(
                "SELECT DISTINCT entity_id FROM operation_queue WHERE table_name = ?1",
                [table],
                |row| row.get(0),
            )?;
            Ok(ids.into_iter().collect())
        })
    }

    pub fn len(&self) -> Result<usize> {
        self.store.with_connection(|conn| {
            Ok(conn
                .query_row_opt("SELECT COUNT(*) FROM operation_queue", [], |row| row.get::<_, i64>(0))?
                .unwrap_or(0) as usize)
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Deletes every operation that has exhausted its retry ceiling.
    /// Returns the number reaped and the set of tables they belonged to,
    /// so the caller can surface this via the status surface.
    pub fn reap_exhausted(&self, retry_ceiling: u32) -> Result<(usize, HashSet<String>)> {
        self.store.with_write_tx(|tx| {
            let exhausted: Vec<(i64, String)> = tx.query_all(
                "SELECT op_id, table_name FROM operation_queue WHERE retries >= ?1",
                [retry_ceiling],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let mut tables = HashSet::new();
            for (op_id, table) in &exhausted {
                tables.insert(table.clone());
                tx.execute("DELETE FROM operation_queue WHERE op_id = ?1", [op_id])?;
            }
            Ok((exhausted.len(), tables))
        })
    }

    pub fn find(&self, op_id: i64) -> Result<Option<Operation>> {
        self.store.with_connection(|conn| {
            Ok(conn.query_row_opt(
                "SELECT * FROM operation_queue WHERE op_id = ?1",
                [op_id],
                row_to_operation,
            )?)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{EngineConfig, TableConfig};
    use crate::queue::operation::OpKind;
    use serde_json::json;

    fn cfg() -> EngineConfig {
        EngineConfig::new("dev-1").with_table(TableConfig::new("goals"))
    }

    #[test]
    fn enqueue_ack_roundtrip() {
        let store = LocalStore::open_in_memory(&cfg()).unwrap();
        let op = Operation::create("goals", "a", json!({"title": "x"}));
        let op_id = store.with_write_tx(|tx| enqueue(tx, &op)).unwrap();

        let queue = OperationQueue::new(&store);
        assert_eq!(queue.len().unwrap(), 1);

        store.with_write_tx(|tx| ack(tx, op_id)).unwrap();
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn bump_applies_backoff_and_retry_ceiling() {
        let store = LocalStore::open_in_memory(&cfg()).unwrap();
        let op = Operation::new("goals", "a", OpKind::Delete);
        let op_id = store.with_write_tx(|tx| enqueue(tx, &op)).unwrap();

        let now = Timestamp::now();
        store.with_write_tx(|tx| bump(tx, op_id, now)).unwrap();

        let queue = OperationQueue::new(&store);
        let ready = queue.pending_ready(5, now).unwrap();
        assert!(ready.is_empty(), "should still be within backoff window");

        let later = Timestamp::from_millis(now.as_millis() + 2000);
        let ready = queue.pending_ready(5, later).unwrap();
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn reap_exhausted_removes_and_reports_tables() {
        let store = LocalStore::open_in_memory(&cfg()).unwrap();
        let op = Operation::create("goals", "a", json!({}));
        let op_id = store.with_write_tx(|tx| enqueue(tx, &op)).unwrap();
        let now = Timestamp::now();
        for _ in 0..5 {
            store.with_write_tx(|tx| bump(tx, op_id, now)).unwrap();
        }

        let queue = OperationQueue::new(&store);
        let (count, tables) = queue.reap_exhausted(5).unwrap();
        assert_eq!(count, 1);
        assert!(tables.contains("goals"));
        assert!(queue.is_empty().unwrap());
    }
}
