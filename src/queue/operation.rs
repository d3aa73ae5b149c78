/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The operation model (C3's unit of work): an intent-based description of
//! a local mutation, queued for egress and reduced by the coalescer before
//! it is pushed.

use crate::timestamp::Timestamp;
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Create,
    Set,
    Increment,
    Delete,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpKind::Create => "create",
            OpKind::Set => "set",
            OpKind::Increment => "increment",
            OpKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for OpKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OpKind::Create),
            "set" => Ok(OpKind::Set),
            "increment" => Ok(OpKind::Increment),
            "delete" => Ok(OpKind::Delete),
            other => Err(format!("unknown op kind {other:?}")),
        }
    }
}

impl ToSql for OpKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for OpKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse().map_err(|_| rusqlite::types::FromSqlError::InvalidType)
    }
}

/// A queued operation. `op_id` is `None` until it has been persisted
/// (assigned by `enqueue`).
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub op_id: Option<i64>,
    pub table: String,
    pub entity_id: String,
    pub kind: OpKind,
    pub field: Option<String>,
    pub value: Option<JsonValue>,
    pub enqueued_at: Timestamp,
    pub retries: u32,
    pub last_attempt_at: Option<Timestamp>,
}

impl Operation {
    pub fn new(table: impl Into<String>, entity_id: impl Into<String>, kind: OpKind) -> Self {
        Operation {
            op_id: None,
            table: table.into(),
            entity_id: entity_id.into(),
            kind,
            field: None,
            value: None,
            enqueued_at: Timestamp::now(),
            retries: 0,
            last_attempt_at: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_value(mut self, value: JsonValue) -> Self {
        self.value = Some(value);
        self
    }

    pub fn create(table: impl Into<String>, entity_id: impl Into<String>, payload: JsonValue) -> Self {
        Operation::new(table, entity_id, OpKind::Create).with_value(payload)
    }

    pub fn delete(table: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Operation::new(table, entity_id, OpKind::Delete)
    }

    pub fn set_whole(table: impl Into<String>, entity_id: impl Into<String>, payload: JsonValue) -> Self {
        Operation::new(table, entity_id, OpKind::Set).with_value(payload)
    }

    pub fn set_field(
        table: impl Into<String>,
        entity_id: impl Into<String>,
        field: impl Into<String>,
        value: JsonValue,
    ) -> Self {
        Operation::new(table, entity_id, OpKind::Set)
            .with_field(field)
            .with_value(value)
    }

    pub fn increment(
        table: impl Into<String>,
        entity_id: impl Into<String>,
        field: impl Into<String>,
        delta: f64,
    ) -> Self {
        Operation::new(table, entity_id, OpKind::Increment)
            .with_field(field)
            .with_value(JsonValue::from(delta))
    }

    pub fn is_field_scoped(&self) -> bool {
        self.field.is_some()
    }

    pub fn delta(&self) -> f64 {
        self.value.as_ref().and_then(JsonValue::as_f64).unwrap_or(0.0)
    }
}
