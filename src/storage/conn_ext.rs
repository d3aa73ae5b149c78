/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Small helpers layered on top of `rusqlite::Connection`/`Transaction`,
//! following `sql-support::conn_ext::ConnExt` - a trait so the same
//! helpers work whether we hold a bare connection or an open transaction.

use rusqlite::{Connection, Result as SqlResult, Row, Transaction};

pub trait ConnExt {
    fn conn(&self) -> &Connection;

    fn execute_all(&self, stmts: &[&str]) -> SqlResult<()> {
        let conn = self.conn();
        for sql in stmts {
            conn.execute(sql, [])?;
        }
        Ok(())
    }

    fn query_row_opt<T, F>(&self, sql: &str, params: impl rusqlite::Params, mapper: F) -> SqlResult<Option<T>>
    where
        F: FnOnce(&Row<'_>) -> SqlResult<T>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        match rows.next()? {
            Some(row) => Ok(Some(mapper(row)?)),
            None => Ok(None),
        }
    }

    fn query_all<T, F>(&self, sql: &str, params: impl rusqlite::Params, mut mapper: F) -> SqlResult<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> SqlResult<T>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(mapper(row)?);
        }
        Ok(out)
    }
}

impl ConnExt for Connection {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl ConnExt for Transaction<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}
