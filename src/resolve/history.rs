/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Conflict history: a rolling, best-effort audit trail of field-level
//! resolutions, persisted to the `conflict_history` table created by
//! `storage::schema` and pruned there on startup.

use crate::error::Result;
use crate::timestamp::Timestamp;
use rusqlite::Transaction;
use serde_json::Value as JsonValue;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Winner::Local => "local",
            Winner::Remote => "remote",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    LocalPending,
    NumericMerge,
    LastWrite,
    DeleteWins,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::LocalPending => "local_pending",
            Strategy::NumericMerge => "numeric_merge",
            Strategy::LastWrite => "last_write",
            Strategy::DeleteWins => "delete_wins",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConflictHistoryEntry {
    pub table: String,
    pub entity_id: String,
    pub field: String,
    pub local_value: Option<JsonValue>,
    pub remote_value: Option<JsonValue>,
    pub resolved_value: Option<JsonValue>,
    pub winner: Winner,
    pub strategy: Strategy,
    pub timestamp: Timestamp,
}

/// Records each entry; a single failed insert is logged and skipped
/// rather than aborting the merge that produced it.
pub fn persist(tx: &Transaction<'_>, entries: &[ConflictHistoryEntry]) {
    for entry in entries {
        if let Err(err) = insert_one(tx, entry) {
            log::warn!(
                "failed to record conflict history for {}/{} field {:?}: {}",
                entry.table,
                entry.entity_id,
                entry.field,
                err
            );
        }
    }
}

fn insert_one(tx: &Transaction<'_>, entry: &ConflictHistoryEntry) -> Result<()> {
    tx.execute(
        "INSERT INTO conflict_history
            (table_name, entity_id, field, local_value, remote_value, resolved_value, winner, strategy, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            entry.table,
            entry.entity_id,
            entry.field,
            entry.local_value.as_ref().map(JsonValue::to_string),
            entry.remote_value.as_ref().map(JsonValue::to_string),
            entry.resolved_value.as_ref().map(JsonValue::to_string),
            entry.winner.to_string(),
            entry.strategy.to_string(),
            entry.timestamp,
        ],
    )?;
    Ok(())
}

/// A single persisted history row, read back for a host's own diagnostics
/// UI. Distinct from `status::StatusState`'s bounded in-memory window:
/// this scans the retention-pruned table directly, so it can return
/// conflicts well outside the last 50.
#[derive(Debug, Clone)]
pub struct ConflictHistoryRecord {
    pub table: String,
    pub entity_id: String,
    pub field: String,
    pub local_value: Option<JsonValue>,
    pub remote_value: Option<JsonValue>,
    pub resolved_value: Option<JsonValue>,
    pub winner: String,
    pub strategy: String,
    pub timestamp: Timestamp,
}

/// Reads back the most recent `limit` entries, newest first, from the
/// persisted `conflict_history` table. Scan-only: there is no write path
/// back through this type, it exists for hosts to surface the full audit
/// trail rather than just the status surface's rolling window.
pub fn recent(conn: &rusqlite::Connection, limit: usize) -> Result<Vec<ConflictHistoryRecord>> {
    use crate::storage::conn_ext::ConnExt;
    fn parse_value(s: Option<String>) -> Option<JsonValue> {
        s.and_then(|s| serde_json::from_str(&s).ok())
    }
    Ok(conn.query_all(
        "SELECT table_name, entity_id, field, local_value, remote_value, resolved_value, winner, strategy, timestamp
         FROM conflict_history ORDER BY timestamp DESC LIMIT ?1",
        [limit as i64],
        |row| {
            Ok(ConflictHistoryRecord {
                table: row.get(0)?,
                entity_id: row.get(1)?,
                field: row.get(2)?,
                local_value: parse_value(row.get(3)?),
                remote_value: parse_value(row.get(4)?),
                resolved_value: parse_value(row.get(5)?),
                winner: row.get(6)?,
                strategy: row.get(7)?,
                timestamp: row.get(8)?,
            })
        },
    )?)
}
