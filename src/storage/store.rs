/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The Local Store Adapter (C2): typed access to per-table collections and
//! the operation queue, with multi-collection atomic transactions.
//! Grounded on `remerge::storage::db::RemergeDb` (connection setup,
//! pragmas) generalized from one schema-declared collection to the
//! host-configured table set.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::guid::Guid;
use crate::record::SyncedRecord;
use crate::storage::conn_ext::ConnExt;
use crate::storage::meta::ConnMetaStore;
use crate::storage::schema;
use crate::timestamp::Timestamp;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde_json::{Map, Value as JsonValue};
use std::path::Path;

pub struct LocalStore {
    conn: Mutex<Connection>,
    config: EngineConfig,
}

impl LocalStore {
    pub fn open(path: impl AsRef<Path>, config: &EngineConfig) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::new_with_connection(conn, config)
    }

    pub fn open_in_memory(config: &EngineConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::new_with_connection(conn, config)
    }

    fn new_with_connection(mut conn: Connection, config: &EngineConfig) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        let tx = conn.transaction()?;
        schema::init(&tx, config)?;
        schema::prune_conflict_history(&tx, Timestamp::now())?;
        tx.commit()?;
        Ok(LocalStore {
            conn: Mutex::new(conn),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn meta(&self) -> ConnMetaStore<'_> {
        ConnMetaStore { conn: &self.conn }
    }

    /// Runs `f` against the shared connection under its lock, for
    /// read-only access that doesn't need to share a transaction with an
    /// entity write (queue read-back, retry bookkeeping).
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Runs `f` inside a single SQLite transaction spanning every
    /// collection it touches. All writes issued by the queue and
    /// coordinator go through this so an entity write and its matching
    /// intent enqueue commit or roll back together.
    pub fn with_write_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    fn table_cfg(&self, table: &str) -> Result<&crate::config::TableConfig> {
        self.config
            .table(table)
            .ok_or_else(|| Error::UnknownTable(table.to_string()))
    }

    pub fn get(&self, table: &str, id: &str) -> Result<Option<SyncedRecord>> {
        self.table_cfg(table)?;
        let conn = self.conn.lock();
        get_record(&conn, table, id)
    }

    pub fn get_all(&self, table: &str, order_by_updated_at: bool) -> Result<Vec<SyncedRecord>> {
        self.table_cfg(table)?;
        let conn = self.conn.lock();
        get_all(&conn, table, order_by_updated_at)
    }

    pub fn query_equal(&self, table: &str, field: &str, value: &JsonValue) -> Result<Vec<SyncedRecord>> {
        self.table_cfg(table)?;
        let conn = self.conn.lock();
        query_equal(&conn, table, field, value)
    }

    pub fn query_range(
        &self,
        table: &str,
        field: &str,
        lo: &JsonValue,
        hi: &JsonValue,
    ) -> Result<Vec<SyncedRecord>> {
        self.table_cfg(table)?;
        let conn = self.conn.lock();
        query_range(&conn, table, field, lo, hi)
    }

    pub fn put(&self, table: &str, record: &SyncedRecord) -> Result<()> {
        self.table_cfg(table)?;
        self.with_write_tx(|tx| put_record(tx, table, record))
    }

    pub fn bulk_put(&self, table: &str, records: &[SyncedRecord]) -> Result<()> {
        self.table_cfg(table)?;
        self.with_write_tx(|tx| {
            for r in records {
                put_record(tx, table, r)?;
            }
            Ok(())
        })
    }

    pub fn update(&self, table: &str, id: &str, partial: Map<String, JsonValue>) -> Result<Option<SyncedRecord>> {
        self.table_cfg(table)?;
        self.with_write_tx(|tx| update_fields(tx, table, id, partial))
    }

    pub fn soft_delete(&self, table: &str, id: &str) -> Result<bool> {
        self.table_cfg(table)?;
        self.with_write_tx(|tx| soft_delete(tx, table, id))
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncedRecord> {
    let fields_json: String = row.get("fields")?;
    let fields: Map<String, JsonValue> = serde_json::from_str(&fields_json).unwrap_or_default();
    Ok(SyncedRecord {
        id: row.get("id")?,
        ownership_key: row.get("ownership_key")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        deleted: row.get::<_, i64>("deleted")? != 0,
        version: row.get("version")?,
        device_id: row.get("device_id")?,
        fields,
    })
}

pub(crate) fn get_record(conn: &Connection, table: &str, id: &str) -> Result<Option<SyncedRecord>> {
    let name = schema::table_name(table);
    let sql = format!("SELECT * FROM {name} WHERE id = ?1");
    Ok(conn
        .query_row(&sql, [id], row_to_record)
        .optional()?)
}

pub(crate) fn get_all(conn: &Connection, table: &str, order_by_updated_at: bool) -> Result<Vec<SyncedRecord>> {
    let name = schema::table_name(table);
    let sql = if order_by_updated_at {
        format!("SELECT * FROM {name} ORDER BY updated_at ASC")
    } else {
        format!("SELECT * FROM {name}")
    };
    conn.query_all(&sql, [], row_to_record).map_err(Into::into)
}

fn json_sql_value(v: &JsonValue) -> rusqlite::types::Value {
    match v {
        JsonValue::String(s) => rusqlite::types::Value::Text(s.clone()),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        JsonValue::Null => rusqlite::types::Value::Null,
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

fn column_expr(table: &str, field: &str) -> String {
    match field {
        "id" | "ownership_key" | "created_at" | "updated_at" | "deleted" | "version" | "device_id" => {
            field.to_string()
        }
        _ => format!("json_extract({table}.fields, '$.{field}')"),
    }
}

pub(crate) fn query_equal(
    conn: &Connection,
    table: &str,
    field: &str,
    value: &JsonValue,
) -> Result<Vec<SyncedRecord>> {
    let name = schema::table_name(table);
    let expr = column_expr(&name, field);
    let sql = format!("SELECT * FROM {name} WHERE {expr} = ?1");
    conn.query_all(&sql, [json_sql_value(value)], row_to_record)
        .map_err(Into::into)
}

pub(crate) fn query_range(
    conn: &Connection,
    table: &str,
    field: &str,
    lo: &JsonValue,
    hi: &JsonValue,
) -> Result<Vec<SyncedRecord>> {
    let name = schema::table_name(table);
    let expr = column_expr(&name, field);
    let sql = format!("SELECT * FROM {name} WHERE {expr} >= ?1 AND {expr} <= ?2 ORDER BY {expr} ASC");
    conn.query_all(
        &sql,
        rusqlite::params![json_sql_value(lo), json_sql_value(hi)],
        row_to_record,
    )
    .map_err(Into::into)
}

pub(crate) fn put_record(tx: &Transaction<'_>, table: &str, record: &SyncedRecord) -> Result<()> {
    let name = schema::table_name(table);
    let fields_json = serde_json::to_string(&record.fields)?;
    tx.execute(
        &format!(
            "INSERT INTO {name} (id, ownership_key, created_at, updated_at, deleted, version, device_id, fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                ownership_key = excluded.ownership_key,
                updated_at = excluded.updated_at,
                deleted = excluded.deleted,
                version = excluded.version,
                device_id = excluded.device_id,
                fields = excluded.fields"
        ),
        rusqlite::params![
            record.id,
            record.ownership_key,
            record.created_at,
            record.updated_at,
            record.deleted as i64,
            record.version,
            record.device_id,
            fields_json,
        ],
    )?;
    Ok(())
}

/// Shallow-merges `partial` into the record's field bag and bumps
/// `updated_at`. Local writer mutations never bump `_version`; that only
/// happens on merge (see `resolve::resolver`).
pub(crate) fn update_fields(
    tx: &Transaction<'_>,
    table: &str,
    id: &str,
    partial: Map<String, JsonValue>,
) -> Result<Option<SyncedRecord>> {
    let Some(mut rec) = get_record(tx, table, id)? else {
        return Ok(None);
    };
    for (k, v) in partial {
        rec.fields.insert(k, v);
    }
    rec.updated_at = Timestamp::now();
    put_record(tx, table, &rec)?;
    Ok(Some(rec))
}

/// Soft-deletes (tombstones) a record; never hard-deletes, so merges can
/// keep reasoning about it.
pub(crate) fn soft_delete(tx: &Transaction<'_>, table: &str, id: &str) -> Result<bool> {
    let name = schema::table_name(table);
    let n = tx.execute(
        &format!("UPDATE {name} SET deleted = 1, updated_at = ?1 WHERE id = ?2"),
        rusqlite::params![Timestamp::now(), id],
    )?;
    Ok(n > 0)
}

pub(crate) fn create_record(
    tx: &Transaction<'_>,
    table: &str,
    id: Guid,
    ownership_key: &str,
    device_id: Guid,
    fields: Map<String, JsonValue>,
) -> Result<SyncedRecord> {
    let now = Timestamp::now();
    let mut rec = SyncedRecord::new(id, ownership_key, device_id, now);
    rec.fields = fields;
    put_record(tx, table, &rec)?;
    Ok(rec)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{EngineConfig, TableConfig};
    use serde_json::json;

    fn cfg() -> EngineConfig {
        EngineConfig::new("dev-1").with_table(TableConfig::new("goals"))
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = LocalStore::open_in_memory(&cfg()).unwrap();
        store
            .with_write_tx(|tx| {
                create_record(
                    tx,
                    "goals",
                    Guid::from("b"),
                    "user-1",
                    Guid::from("dev-1"),
                    Map::new(),
                )
                .map(|_| ())
            })
            .unwrap();
        let got = store.get("goals", "b").unwrap().unwrap();
        assert_eq!(got.ownership_key, "user-1");
    }

    #[test]
    fn test_query_equal_on_app_field() {
        let store = LocalStore::open_in_memory(&cfg()).unwrap();
        store
            .with_write_tx(|tx| {
                let mut fields = Map::new();
                fields.insert("score".into(), json!(42));
                create_record(tx, "goals", Guid::from("a"), "user-1", Guid::from("dev-1"), fields)
                    .map(|_| ())
            })
            .unwrap();
        let rows = store.query_equal("goals", "score", &json!(42)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "a");
    }

    #[test]
    fn test_soft_delete_keeps_tombstone() {
        let store = LocalStore::open_in_memory(&cfg()).unwrap();
        store
            .with_write_tx(|tx| {
                create_record(tx, "goals", Guid::from("a"), "user-1", Guid::from("dev-1"), Map::new())
                    .map(|_| ())
            })
            .unwrap();
        assert!(store.soft_delete("goals", "a").unwrap());
        let rec = store.get("goals", "a").unwrap().unwrap();
        assert!(rec.deleted);
    }
}
