/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The Conflict Resolver (C5): a pure, three-tier field merge between a
//! local and a remote copy of the same entity. No I/O happens here -
//! `sync::coordinator` and `sync::realtime` call `resolve` and then hand
//! the resulting `merged` record and resolutions to the caller's
//! transaction, persisting history via `resolve::history::persist`.

use crate::config::TableConfig;
use crate::queue::{OpKind, Operation};
use crate::record::SyncedRecord;
use crate::resolve::history::{Strategy, Winner};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct FieldResolution {
    pub field: String,
    pub local_value: Option<JsonValue>,
    pub remote_value: Option<JsonValue>,
    pub resolved_value: Option<JsonValue>,
    pub winner: Winner,
    pub strategy: Strategy,
}

#[derive(Debug)]
pub struct ResolveOutcome {
    pub merged: SyncedRecord,
    pub resolutions: Vec<FieldResolution>,
    pub had_conflict: bool,
}

/// Step 1: per-field pending-op coverage, plus whether a delete is
/// pending. Field-scoped ops record their field; whole-object `set` ops
/// record every top-level key of their payload.
fn pending_coverage(pending_ops: &[Operation]) -> (HashSet<String>, bool) {
    let mut fields = HashSet::new();
    let mut pending_delete = false;
    for op in pending_ops {
        match op.kind {
            OpKind::Delete => pending_delete = true,
            OpKind::Set if op.field.is_none() => {
                if let Some(JsonValue::Object(obj)) = &op.value {
                    fields.extend(obj.keys().cloned());
                }
            }
            _ => {
                if let Some(field) = &op.field {
                    fields.insert(field.clone());
                }
            }
        }
    }
    (fields, pending_delete)
}

/// `last_write` tiebreak: strictly later `updated_at` wins; on an exact
/// tie, the lexicographically lower non-empty `device_id` wins, and local
/// wins if the ids are equal or remote carries no `device_id`.
fn last_write_pick(
    local: &SyncedRecord,
    remote: &SyncedRecord,
    local_value: Option<&JsonValue>,
    remote_value: Option<&JsonValue>,
) -> (Option<JsonValue>, Winner) {
    match remote.updated_at.cmp(&local.updated_at) {
        Ordering::Greater => (remote_value.cloned(), Winner::Remote),
        Ordering::Less => (local_value.cloned(), Winner::Local),
        Ordering::Equal => {
            let remote_id = remote.device_id.as_str();
            let local_id = local.device_id.as_str();
            if !remote_id.is_empty() && remote_id != local_id && remote_id < local_id {
                (remote_value.cloned(), Winner::Remote)
            } else {
                (local_value.cloned(), Winner::Local)
            }
        }
    }
}

/// Merges `local` and `remote` per spec §4.5. `local` absent means the
/// entity is only known remotely - returned unchanged, no conflict.
pub fn resolve(
    table_cfg: &TableConfig,
    local: Option<&SyncedRecord>,
    remote: &SyncedRecord,
    pending_ops: &[Operation],
) -> ResolveOutcome {
    let Some(local) = local else {
        return ResolveOutcome {
            merged: remote.clone(),
            resolutions: Vec::new(),
            had_conflict: false,
        };
    };

    let (pending_fields, pending_delete) = pending_coverage(pending_ops);

    // Step 2: delete resolution, terminal - no per-field loop if it fires.
    if pending_delete && !remote.deleted {
        let mut merged = local.clone();
        merged.deleted = true;
        merged.updated_at = std::cmp::max(local.updated_at, remote.updated_at);
        merged.version = std::cmp::max(local.version_or_default(), remote.version_or_default()) + 1;
        return ResolveOutcome {
            merged,
            resolutions: vec![FieldResolution {
                field: "deleted".into(),
                local_value: Some(JsonValue::Bool(true)),
                remote_value: Some(JsonValue::Bool(remote.deleted)),
                resolved_value: Some(JsonValue::Bool(true)),
                winner: Winner::Local,
                strategy: Strategy::LocalPending,
            }],
            had_conflict: true,
        };
    }
    if remote.deleted && !pending_delete {
        return ResolveOutcome {
            merged: remote.clone(),
            resolutions: vec![FieldResolution {
                field: "deleted".into(),
                local_value: Some(JsonValue::Bool(local.deleted)),
                remote_value: Some(JsonValue::Bool(true)),
                resolved_value: Some(JsonValue::Bool(true)),
                winner: Winner::Remote,
                strategy: Strategy::DeleteWins,
            }],
            had_conflict: true,
        };
    }

    // Step 3: per-field loop, deterministic order for reproducible tests.
    let mut keys: Vec<&String> = local
        .fields
        .keys()
        .chain(remote.fields.keys())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    keys.sort();

    let mut merged = local.clone();
    let mut resolutions = Vec::new();

    for field in keys {
        if field == "deleted" || table_cfg.is_excluded(field) {
            continue;
        }
        let lv = local.fields.get(field);
        let rv = remote.fields.get(field);
        if lv == rv {
            continue;
        }

        let (resolved, winner, strategy) = if pending_fields.contains(field) {
            (lv.cloned(), Winner::Local, Strategy::LocalPending)
        } else if table_cfg.is_numeric_merge(field)
            && lv.map(JsonValue::is_number).unwrap_or(false)
            && rv.map(JsonValue::is_number).unwrap_or(false)
        {
            let (value, winner) = last_write_pick(local, remote, lv, rv);
            (value, winner, Strategy::NumericMerge)
        } else {
            let (value, winner) = last_write_pick(local, remote, lv, rv);
            (value, winner, Strategy::LastWrite)
        };

        match &resolved {
            Some(v) => {
                merged.fields.insert(field.clone(), v.clone());
            }
            None => {
                merged.fields.remove(field);
            }
        }
        resolutions.push(FieldResolution {
            field: field.clone(),
            local_value: lv.cloned(),
            remote_value: rv.cloned(),
            resolved_value: resolved,
            winner,
            strategy,
        });
    }

    if !resolutions.is_empty() {
        merged.version = std::cmp::max(local.version_or_default(), remote.version_or_default()) + 1;
    }
    merged.updated_at = std::cmp::max(local.updated_at, remote.updated_at);

    let had_conflict = !resolutions.is_empty();
    ResolveOutcome {
        merged,
        resolutions,
        had_conflict,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::TableConfig;
    use crate::guid::Guid;
    use crate::timestamp::Timestamp;
    use serde_json::json;

    fn record(device: &str, updated_at: i64, title: &str) -> SyncedRecord {
        let mut r = SyncedRecord::new(
            Guid::from("x"),
            "user-1",
            Guid::from(device),
            Timestamp::from_millis(updated_at),
        );
        r.set("title", json!(title));
        r
    }

    #[test]
    fn absent_local_passes_remote_through() {
        let cfg = TableConfig::new("goals");
        let remote = record("dev-b", 10, "remote-title");
        let outcome = resolve(&cfg, None, &remote, &[]);
        assert!(!outcome.had_conflict);
        assert_eq!(outcome.merged.get("title").unwrap(), "remote-title");
    }

    #[test]
    fn pending_local_delete_wins_over_live_remote() {
        let cfg = TableConfig::new("goals");
        let local = record("dev-a", 5, "local-title");
        let remote = record("dev-b", 10, "remote-title");
        let pending = vec![Operation::delete("goals", "x")];
        let outcome = resolve(&cfg, Some(&local), &remote, &pending);
        assert!(outcome.merged.deleted);
        assert_eq!(outcome.resolutions.len(), 1);
        assert_eq!(outcome.resolutions[0].strategy, Strategy::LocalPending);
    }

    #[test]
    fn remote_delete_wins_with_no_pending_local_delete() {
        let cfg = TableConfig::new("goals");
        let local = record("dev-a", 5, "edited");
        let mut remote = record("dev-b", 10, "edited");
        remote.deleted = true;
        let pending = vec![Operation::set_field("goals", "x", "title", json!("edited"))];
        let outcome = resolve(&cfg, Some(&local), &remote, &pending);
        assert!(outcome.merged.deleted);
        assert_eq!(outcome.resolutions.len(), 1);
        assert_eq!(outcome.resolutions[0].strategy, Strategy::DeleteWins);
        assert_eq!(outcome.resolutions[0].field, "deleted");
    }

    #[test]
    fn local_pending_field_wins_regardless_of_timestamps() {
        let cfg = TableConfig::new("goals");
        let local = record("dev-a", 5, "user-typed");
        let remote = record("dev-b", 10, "server-value");
        let pending = vec![Operation::set_field("goals", "x", "title", json!("user-typed"))];
        let outcome = resolve(&cfg, Some(&local), &remote, &pending);
        assert_eq!(outcome.merged.get("title").unwrap(), "user-typed");
        assert_eq!(outcome.resolutions[0].strategy, Strategy::LocalPending);
    }

    #[test]
    fn last_write_picks_strictly_later_timestamp() {
        let cfg = TableConfig::new("goals");
        let local = record("dev-a", 5, "old");
        let remote = record("dev-b", 10, "new");
        let outcome = resolve(&cfg, Some(&local), &remote, &[]);
        assert_eq!(outcome.merged.get("title").unwrap(), "new");
        assert_eq!(outcome.resolutions[0].winner, Winner::Remote);
    }

    #[test]
    fn exact_tie_breaks_on_lower_device_id() {
        let cfg = TableConfig::new("goals");
        let local = record("dev-b", 10, "local-val");
        let remote = record("dev-a", 10, "remote-val");
        let outcome = resolve(&cfg, Some(&local), &remote, &[]);
        // "dev-a" < "dev-b" lexicographically, so remote wins.
        assert_eq!(outcome.merged.get("title").unwrap(), "remote-val");
        assert_eq!(outcome.resolutions[0].winner, Winner::Remote);
    }

    #[test]
    fn exact_tie_with_equal_device_ids_prefers_local() {
        let cfg = TableConfig::new("goals");
        let local = record("dev-a", 10, "local-val");
        let remote = record("dev-a", 10, "remote-val");
        let outcome = resolve(&cfg, Some(&local), &remote, &[]);
        assert_eq!(outcome.merged.get("title").unwrap(), "local-val");
        assert_eq!(outcome.resolutions[0].winner, Winner::Local);
    }

    #[test]
    fn deep_equal_fields_produce_no_resolution() {
        let cfg = TableConfig::new("goals");
        let local = record("dev-a", 5, "same");
        let remote = record("dev-b", 10, "same");
        let outcome = resolve(&cfg, Some(&local), &remote, &[]);
        assert!(outcome.resolutions.is_empty());
        assert!(!outcome.had_conflict);
    }

    #[test]
    fn version_bumps_only_when_a_resolution_occurred() {
        let cfg = TableConfig::new("goals");
        let mut local = record("dev-a", 5, "same");
        local.version = 3;
        let mut remote = record("dev-b", 10, "same");
        remote.version = 2;
        let outcome = resolve(&cfg, Some(&local), &remote, &[]);
        assert_eq!(outcome.merged.version, 3, "no conflict, version untouched");
    }

    #[test]
    fn excluded_fields_are_never_resolved() {
        let cfg = TableConfig::new("goals").exclude_fields(["secret"]);
        let mut local = record("dev-a", 5, "same");
        local.set("secret", json!("local-secret"));
        let mut remote = record("dev-b", 10, "same");
        remote.set("secret", json!("remote-secret"));
        let outcome = resolve(&cfg, Some(&local), &remote, &[]);
        assert!(outcome.resolutions.is_empty());
        assert_eq!(outcome.merged.get("secret").unwrap(), "local-secret");
    }
}
