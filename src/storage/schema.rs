/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! SQLite schema bootstrap. Unlike `remerge::storage::bootstrap`, there is
//! no schema-version upgrade chain to run: the table set comes from the
//! host's `EngineConfig` fresh each process start, so "bootstrap" here
//! just means "create what's missing." A synced table is not expected to
//! change shape across runs within the scope of this engine; that's the
//! host's schema-migration tooling's job, explicitly out of scope.

use crate::config::EngineConfig;
use crate::error::Result;
use rusqlite::Transaction;

pub(crate) fn table_name(name: &str) -> String {
    format!("table_{}", name)
}

pub fn init(tx: &Transaction<'_>, config: &EngineConfig) -> Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS operation_queue (
            op_id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            field TEXT,
            value TEXT,
            enqueued_at INTEGER NOT NULL,
            retries INTEGER NOT NULL DEFAULT 0,
            last_attempt_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_queue_enqueued_at ON operation_queue(enqueued_at);
        CREATE INDEX IF NOT EXISTS idx_queue_entity_id ON operation_queue(table_name, entity_id);

        CREATE TABLE IF NOT EXISTS conflict_history (
            history_id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            field TEXT NOT NULL,
            local_value TEXT,
            remote_value TEXT,
            resolved_value TEXT,
            winner TEXT NOT NULL,
            strategy TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_history_timestamp ON conflict_history(timestamp);
        ",
    )?;

    for table in &config.tables {
        let name = table_name(&table.name);
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {name} (
                id TEXT PRIMARY KEY,
                ownership_key TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1,
                device_id TEXT NOT NULL,
                fields TEXT NOT NULL DEFAULT '{{}}'
            );
            CREATE INDEX IF NOT EXISTS idx_{name}_ownership ON {name}(ownership_key);
            CREATE INDEX IF NOT EXISTS idx_{name}_updated_at ON {name}(updated_at);",
            name = name,
        ))?;
    }
    Ok(())
}

/// Opportunistic pruning of conflict history older than 30 days, run at
/// startup per the retention policy.
pub fn prune_conflict_history(tx: &Transaction<'_>, now: crate::timestamp::Timestamp) -> Result<usize> {
    const RETENTION_MS: i64 = 30 * 24 * 60 * 60 * 1000;
    let cutoff = now.as_millis() - RETENTION_MS;
    let n = tx.execute(
        "DELETE FROM conflict_history WHERE timestamp < ?1",
        [cutoff],
    )?;
    Ok(n)
}
