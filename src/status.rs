/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Status & Diagnostics Surface (C8): read-only observable state for a UI
//! layer. Patterned on `error-support`'s report/observe split - callers
//! subscribe once and receive a snapshot on every state-changing event
//! rather than polling the engine's internals directly.

use crate::error::ErrorClass;
use crate::timestamp::Timestamp;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

const CONFLICT_WINDOW: usize = 50;

#[derive(Debug, Clone)]
pub struct ConflictSummary {
    pub table: String,
    pub entity_id: String,
    pub field: String,
    pub winner: String,
    pub strategy: String,
    pub at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub pending_count: usize,
    pub unsynced_entity_count: usize,
    pub last_push_at: Option<Timestamp>,
    pub last_pull_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub last_error_class: Option<ErrorClass>,
    pub connected: bool,
    pub reaped_tables: Vec<String>,
    pub recent_conflicts: Vec<ConflictSummary>,
}

#[derive(Default)]
struct Inner {
    last_push_at: Option<Timestamp>,
    last_pull_at: Option<Timestamp>,
    last_error: Option<(String, ErrorClass)>,
    connected: bool,
    reaped_tables: HashSet<String>,
    recent_conflicts: VecDeque<ConflictSummary>,
}

type Listener = Box<dyn Fn(&StatusSnapshot) + Send + Sync>;

pub struct StatusState {
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<Listener>>,
}

impl Default for StatusState {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusState {
    pub fn new() -> Self {
        StatusState {
            inner: Mutex::new(Inner::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn record_push_success(&self, at: Timestamp) {
        self.inner.lock().last_push_at = Some(at);
    }

    pub fn record_pull(&self, at: Timestamp) {
        self.inner.lock().last_pull_at = Some(at);
    }

    pub fn record_error(&self, message: impl Into<String>, class: ErrorClass) {
        self.inner.lock().last_error = Some((message.into(), class));
    }

    pub fn record_reaped(&self, tables: HashSet<String>) {
        self.inner.lock().reaped_tables.extend(tables);
    }

    pub fn record_conflict(&self, summary: ConflictSummary) {
        let mut inner = self.inner.lock();
        inner.recent_conflicts.push_front(summary);
        inner.recent_conflicts.truncate(CONFLICT_WINDOW);
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().connected = connected;
    }

    pub fn subscribe(&self, callback: impl Fn(&StatusSnapshot) + Send + Sync + 'static) {
        self.listeners.lock().push(Box::new(callback));
    }

    /// Builds a fresh snapshot from the engine-supplied live counts plus
    /// accumulated state, and notifies every subscriber.
    pub fn publish(&self, pending_count: usize, unsynced_entity_count: usize) -> StatusSnapshot {
        let inner = self.inner.lock();
        let snapshot = StatusSnapshot {
            pending_count,
            unsynced_entity_count,
            last_push_at: inner.last_push_at,
            last_pull_at: inner.last_pull_at,
            last_error: inner.last_error.as_ref().map(|(m, _)| m.clone()),
            last_error_class: inner.last_error.as_ref().map(|(_, c)| *c),
            connected: inner.connected,
            reaped_tables: inner.reaped_tables.iter().cloned().collect(),
            recent_conflicts: inner.recent_conflicts.iter().cloned().collect(),
        };
        drop(inner);
        for listener in self.listeners.lock().iter() {
            listener(&snapshot);
        }
        snapshot
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn publish_notifies_subscribers_with_latest_state() {
        let status = StatusState::new();
        let seen = std::sync::Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        status.subscribe(move |snap| {
            *seen2.lock() = Some(snap.pending_count);
        });
        status.record_push_success(Timestamp::from_millis(10));
        status.publish(3, 1);
        assert_eq!(*seen.lock(), Some(3));
    }

    #[test]
    fn conflict_window_is_bounded() {
        let status = StatusState::new();
        for i in 0..(CONFLICT_WINDOW + 10) {
            status.record_conflict(ConflictSummary {
                table: "goals".into(),
                entity_id: format!("e{i}"),
                field: "title".into(),
                winner: "remote".into(),
                strategy: "last_write".into(),
                at: Timestamp::from_millis(i as i64),
            });
        }
        let snap = status.publish(0, 0);
        assert_eq!(snap.recent_conflicts.len(), CONFLICT_WINDOW);
    }
}
