/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The synced record model. System columns are typed; application fields
//! live in an untyped JSON bag, mirroring `remerge`'s split between its
//! typed record envelope and the schema-declared field map - except here
//! the "schema" is just whatever fields the host puts in the bag, since
//! table configuration is consumed, not owned (see `config.rs`).

use crate::guid::Guid;
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// A row the engine replicates, as held locally and as exchanged with the
/// remote store. `fields` holds every application-defined column; the
/// system columns below are broken out because the engine's invariants
/// reason about them directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncedRecord {
    pub id: Guid,
    pub ownership_key: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted: bool,
    #[serde(rename = "_version", default = "default_version")]
    pub version: i64,
    pub device_id: Guid,
    #[serde(flatten)]
    pub fields: Map<String, JsonValue>,
}

fn default_version() -> i64 {
    1
}

impl SyncedRecord {
    pub fn new(id: Guid, ownership_key: impl Into<String>, device_id: Guid, now: Timestamp) -> Self {
        SyncedRecord {
            id,
            ownership_key: ownership_key.into(),
            created_at: now,
            updated_at: now,
            deleted: false,
            version: 1,
            device_id,
            fields: Map::new(),
        }
    }

    /// Missing `_version` on legacy remote rows is treated as 1, per the
    /// data model's open question resolution.
    pub fn version_or_default(&self) -> i64 {
        if self.version == 0 {
            1
        } else {
            self.version
        }
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        match field {
            "id" => None,
            "deleted" => None,
            _ => self.fields.get(field),
        }
    }

    pub fn set(&mut self, field: &str, value: JsonValue) {
        self.fields.insert(field.to_string(), value);
    }

    /// All field keys present on this record, excluding system columns.
    pub fn field_keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn to_json(&self) -> serde_json::Result<JsonValue> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_version_default_for_legacy_rows() {
        let mut r = SyncedRecord::new(
            Guid::from("a"),
            "user-1",
            Guid::from("dev-1"),
            Timestamp::now(),
        );
        r.version = 0;
        assert_eq!(r.version_or_default(), 1);
    }

    #[test]
    fn test_fields_roundtrip_through_json() {
        let mut r = SyncedRecord::new(
            Guid::from("a"),
            "user-1",
            Guid::from("dev-1"),
            Timestamp::from_millis(1000),
        );
        r.set("title", JsonValue::String("hello".into()));
        let v = r.to_json().unwrap();
        assert_eq!(v["title"], "hello");
        assert_eq!(v["id"], "a");
    }
}
