/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The Coalescer (C4): a pure reduction over the queued operations for one
//! entity. No I/O happens here - `queue::queue` is responsible for
//! persisting the outcome as a single batched write. Grounded on the
//! field-merge taxonomy in `remerge::schema::merge_kinds`, generalized
//! from schema-declared per-field merge strategies to a
//! create/set/increment/delete algebra over queued intents.

use super::operation::{OpKind, Operation};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct CoalesceOutcome {
    /// Operations that should remain in the queue, with their final
    /// `field`/`value`. `enqueued_at` is always the carrier's original
    /// value - coalescing never rewrites push order.
    pub surviving: Vec<Operation>,
    /// `op_id`s of operations that should be removed from the queue.
    pub removed_op_ids: Vec<i64>,
}

fn json_num(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// Reduces the full set of queued operations, grouped by `(table,
/// entity_id)`, per the coalescer pipeline (spec §4.4 steps 1-6).
pub fn coalesce(mut ops: Vec<Operation>) -> CoalesceOutcome {
    ops.sort_by_key(|o| o.enqueued_at);

    let mut order: Vec<(String, String)> = Vec::new();
    let mut groups: HashMap<(String, String), Vec<Operation>> = HashMap::new();
    for op in ops {
        let key = (op.table.clone(), op.entity_id.clone());
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(op);
    }

    let mut outcome = CoalesceOutcome::default();
    for key in order {
        let group = groups.remove(&key).unwrap();
        let (survivors, removed) = reduce_entity_group(group);
        outcome.surviving.extend(survivors);
        outcome.removed_op_ids.extend(removed);
    }
    outcome
}

fn reduce_entity_group(mut group: Vec<Operation>) -> (Vec<Operation>, Vec<i64>) {
    group.sort_by_key(|o| o.enqueued_at);
    let has_create = group.iter().any(|o| o.kind == OpKind::Create);
    let has_delete = group.iter().any(|o| o.kind == OpKind::Delete);
    let mut removed = Vec::new();

    // 2a: create + delete in the same group cancels out entirely.
    if has_create && has_delete {
        for o in group {
            if let Some(id) = o.op_id {
                removed.push(id);
            }
        }
        return (Vec::new(), removed);
    }

    // 2b: delete with no create - keep only the delete.
    if has_delete {
        let mut kept = None;
        for o in group {
            if o.kind == OpKind::Delete && kept.is_none() {
                kept = Some(o);
            } else if let Some(id) = o.op_id {
                removed.push(id);
            }
        }
        return (kept.into_iter().collect(), removed);
    }

    // 2c: create with no delete - fold every later set/increment into the
    // create's payload.
    if has_create {
        let mut create_op = None;
        let mut others = Vec::new();
        for o in group {
            if o.kind == OpKind::Create && create_op.is_none() {
                create_op = Some(o);
            } else {
                others.push(o);
            }
        }
        let mut create_op = create_op.expect("has_create implies a Create op exists");
        let mut payload = match create_op.value.take() {
            Some(JsonValue::Object(m)) => m,
            _ => Map::new(),
        };
        for o in others {
            match o.kind {
                OpKind::Set => {
                    if let Some(field) = &o.field {
                        payload.insert(field.clone(), o.value.clone().unwrap_or(JsonValue::Null));
                    } else if let Some(JsonValue::Object(obj)) = &o.value {
                        for (k, v) in obj {
                            payload.insert(k.clone(), v.clone());
                        }
                    }
                }
                OpKind::Increment => {
                    if let Some(field) = &o.field {
                        let cur = payload.get(field).and_then(JsonValue::as_f64).unwrap_or(0.0);
                        payload.insert(field.clone(), json_num(cur + o.delta()));
                    }
                }
                _ => {}
            }
            if let Some(id) = o.op_id {
                removed.push(id);
            }
        }
        create_op.value = Some(JsonValue::Object(payload));
        return (vec![create_op], removed);
    }

    // 2d: neither create nor delete - field-level reduction.
    let survivors = field_level_reduce(group, &mut removed);
    (survivors, removed)
}

fn field_level_reduce(group: Vec<Operation>, removed: &mut Vec<i64>) -> Vec<Operation> {
    let mut by_field: HashMap<String, Vec<Operation>> = HashMap::new();
    let mut whole_sets: Vec<Operation> = Vec::new();
    for o in group {
        match (&o.field, o.kind) {
            (Some(f), _) => by_field.entry(f.clone()).or_default().push(o),
            (None, OpKind::Set) => whole_sets.push(o),
            _ => {
                // A whole-object increment is not a representable intent;
                // drop it defensively rather than corrupt the payload.
                if let Some(id) = o.op_id {
                    removed.push(id);
                }
            }
        }
    }

    // Step 3: per-field, a set followed by increments collapses to one set.
    let mut field_survivors: Vec<Operation> = Vec::new();
    for (_field, mut ops) in by_field {
        ops.sort_by_key(|o| o.enqueued_at);
        let has_set = ops.iter().any(|o| o.kind == OpKind::Set);
        let has_incr = ops.iter().any(|o| o.kind == OpKind::Increment);
        if has_set && has_incr {
            let last_set_pos = ops.iter().rposition(|o| o.kind == OpKind::Set).unwrap();
            let mut incr_sum = 0.0;
            for (i, o) in ops.iter().enumerate() {
                let fold_in = i < last_set_pos || (i > last_set_pos && o.kind == OpKind::Increment);
                if fold_in {
                    if o.kind == OpKind::Increment && i > last_set_pos {
                        incr_sum += o.delta();
                    }
                    if let Some(id) = o.op_id {
                        removed.push(id);
                    }
                }
            }
            let mut last_set = ops.into_iter().nth(last_set_pos).unwrap();
            let cur = last_set.value.as_ref().and_then(JsonValue::as_f64).unwrap_or(0.0);
            last_set.value = Some(json_num(cur + incr_sum));
            field_survivors.push(last_set);
        } else {
            field_survivors.extend(ops);
        }
    }

    // Step 4: sum surviving increments per field into the oldest.
    let mut by_field2: HashMap<String, Vec<Operation>> = HashMap::new();
    let mut non_incr: Vec<Operation> = Vec::new();
    for o in field_survivors {
        if o.kind == OpKind::Increment {
            by_field2
                .entry(o.field.clone().expect("increment is field-scoped"))
                .or_default()
                .push(o);
        } else {
            non_incr.push(o);
        }
    }
    let mut incr_survivors = Vec::new();
    for (_field, mut ops) in by_field2 {
        ops.sort_by_key(|o| o.enqueued_at);
        if ops.len() > 1 {
            let sum: f64 = ops.iter().map(|o| o.delta()).sum();
            let mut oldest = ops.remove(0);
            for rest in ops {
                if let Some(id) = rest.op_id {
                    removed.push(id);
                }
            }
            oldest.value = Some(json_num(sum));
            incr_survivors.push(oldest);
        } else {
            incr_survivors.extend(ops);
        }
    }

    // Step 5: merge every surviving set (field-scoped or whole-object)
    // into one whole-object set carried by the oldest.
    let mut all_sets = non_incr;
    all_sets.extend(whole_sets);
    let mut set_result = Vec::new();
    if all_sets.len() > 1 {
        all_sets.sort_by_key(|o| o.enqueued_at);
        let mut merged = Map::new();
        for o in &all_sets {
            match (&o.field, &o.value) {
                (Some(f), Some(v)) => {
                    merged.insert(f.clone(), v.clone());
                }
                (None, Some(JsonValue::Object(obj))) => {
                    for (k, v) in obj {
                        merged.insert(k.clone(), v.clone());
                    }
                }
                _ => {}
            }
        }
        let mut oldest = all_sets.remove(0);
        for rest in all_sets {
            if let Some(id) = rest.op_id {
                removed.push(id);
            }
        }
        oldest.field = None;
        oldest.value = Some(JsonValue::Object(merged));
        set_result.push(oldest);
    } else {
        set_result.extend(all_sets);
    }

    let mut result = incr_survivors;
    result.extend(set_result);

    // Step 6: prune no-ops. Anything dropped here still needs its op_id
    // reported as removed so the caller acks it out of the queue.
    let is_noop = |o: &Operation| match o.kind {
        OpKind::Increment => o.delta() == 0.0,
        OpKind::Set => match (&o.field, &o.value) {
            (Some(f), _) if f == "updated_at" => true,
            (Some(_), None) => true,
            (None, Some(JsonValue::Object(m))) => m.is_empty() || (m.len() == 1 && m.contains_key("updated_at")),
            (None, Some(JsonValue::Null)) | (None, None) => true,
            _ => false,
        },
        _ => false,
    };
    for o in &result {
        if is_noop(o) {
            if let Some(id) = o.op_id {
                removed.push(id);
            }
        }
    }
    result.retain(|o| !is_noop(o));
    result
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn op(id: i64, kind: OpKind, table: &str, entity: &str, millis: i64) -> Operation {
        Operation {
            op_id: Some(id),
            table: table.into(),
            entity_id: entity.into(),
            kind,
            field: None,
            value: None,
            enqueued_at: crate::timestamp::Timestamp::from_millis(millis),
            retries: 0,
            last_attempt_at: None,
        }
    }

    #[test]
    fn s1_offline_create_then_delete_cancels() {
        let mut c = op(1, OpKind::Create, "goals", "A", 1);
        c.value = Some(json!({"title": "x"}));
        let d = op(2, OpKind::Delete, "goals", "A", 2);
        let outcome = coalesce(vec![c, d]);
        assert!(outcome.surviving.is_empty());
        assert_eq!(outcome.removed_op_ids.len(), 2);
    }

    #[test]
    fn s2_increment_coalescing_zero_sum_prunes() {
        let mut i1 = op(1, OpKind::Increment, "goals", "A", 1);
        i1.field = Some("score".into());
        i1.value = Some(json!(3));
        let mut i2 = op(2, OpKind::Increment, "goals", "A", 2);
        i2.field = Some("score".into());
        i2.value = Some(json!(5));
        let mut i3 = op(3, OpKind::Increment, "goals", "A", 3);
        i3.field = Some("score".into());
        i3.value = Some(json!(-8));
        let outcome = coalesce(vec![i1, i2, i3]);
        assert!(outcome.surviving.is_empty(), "{:?}", outcome.surviving);
    }

    #[test]
    fn s3_set_after_increment_with_intervening_create() {
        let mut create = op(1, OpKind::Create, "goals", "A", 1);
        create.value = Some(json!({"score": 0}));
        let mut i1 = op(2, OpKind::Increment, "goals", "A", 2);
        i1.field = Some("score".into());
        i1.value = Some(json!(5));
        let mut s1 = op(3, OpKind::Set, "goals", "A", 3);
        s1.field = Some("score".into());
        s1.value = Some(json!(100));
        let mut i2 = op(4, OpKind::Increment, "goals", "A", 4);
        i2.field = Some("score".into());
        i2.value = Some(json!(1));

        let outcome = coalesce(vec![create, i1, s1, i2]);
        assert_eq!(outcome.surviving.len(), 1);
        let survivor = &outcome.surviving[0];
        assert_eq!(survivor.kind, OpKind::Create);
        assert_eq!(survivor.value.as_ref().unwrap()["score"], 101.0);
    }

    #[test]
    fn coalescing_twice_is_idempotent() {
        let mut i1 = op(1, OpKind::Increment, "goals", "A", 1);
        i1.field = Some("score".into());
        i1.value = Some(json!(3));
        let mut i2 = op(2, OpKind::Increment, "goals", "A", 2);
        i2.field = Some("score".into());
        i2.value = Some(json!(5));
        let first = coalesce(vec![i1, i2]);
        assert_eq!(first.surviving.len(), 1);
        let second = coalesce(first.surviving);
        assert_eq!(second.surviving.len(), 1);
        assert_eq!(
            second.surviving[0].value.as_ref().unwrap().as_f64(),
            Some(8.0)
        );
    }

    #[test]
    fn empty_object_set_is_pruned() {
        let mut s = op(1, OpKind::Set, "goals", "A", 1);
        s.value = Some(json!({}));
        let outcome = coalesce(vec![s]);
        assert!(outcome.surviving.is_empty());
    }

    #[test]
    fn updated_at_only_set_is_pruned() {
        let mut s = op(1, OpKind::Set, "goals", "A", 1);
        s.field = Some("updated_at".into());
        s.value = Some(json!("2024-01-01T00:00:00Z"));
        let outcome = coalesce(vec![s]);
        assert!(outcome.surviving.is_empty());
    }
}
