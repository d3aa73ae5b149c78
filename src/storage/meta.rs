/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Namespaced key-value storage backing device identity and per-table
//! pull watermarks, following `remerge::storage::meta`'s key-value meta
//! table pattern.

use crate::error::Result;
use crate::storage::conn_ext::ConnExt;
use parking_lot::Mutex;
use rusqlite::Connection;

pub trait MetaStore {
    fn get_string(&self, key: &str) -> Result<Option<String>>;
    fn set_string(&self, key: &str, value: &str) -> Result<()>;
}

pub struct ConnMetaStore<'a> {
    pub(crate) conn: &'a Mutex<Connection>,
}

impl MetaStore for ConnMetaStore<'_> {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn.query_row_opt(
            "SELECT value FROM meta WHERE key = ?1",
            [key],
            |row| row.get(0),
        )?)
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.conn().execute(
            "INSERT INTO meta(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }
}

pub fn watermark_key(table: &str) -> String {
    format!("pull_watermark:{}", table)
}
