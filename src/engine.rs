/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The embedded application API (§6.1): the single entry point a host
//! application links against. Every write here is transactional - the
//! entity mutation and its matching queued intent commit or roll back
//! together, per `LocalStore::with_write_tx`.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::guid::Guid;
use crate::identity::DeviceIdentity;
use crate::queue::{self, Operation};
use crate::record::SyncedRecord;
use crate::resolve::history::{self, ConflictHistoryRecord};
use crate::status::{StatusSnapshot, StatusState};
use crate::storage::{store as store_fns, LocalStore};
use crate::sync::{Clock, RealtimeIngestor, RemoteStore, SyncCoordinator, SystemClock};
use serde_json::{Map, Value as JsonValue};
use std::path::Path;
use std::sync::Arc;

/// One unit of work for `batch_write`, applied inside a single
/// transaction alongside every other intent in the batch.
pub enum WriteIntent {
    Create { table: String, id: Option<String>, fields: Map<String, JsonValue> },
    Update { table: String, id: String, partial: Map<String, JsonValue> },
    Delete { table: String, id: String },
    Increment { table: String, id: String, field: String, delta: f64 },
}

pub struct Engine {
    store: Arc<LocalStore>,
    identity: Arc<DeviceIdentity>,
    status: Arc<StatusState>,
    remote: Arc<dyn RemoteStore>,
    coordinator: Arc<SyncCoordinator>,
    realtime: Arc<RealtimeIngestor>,
}

impl Engine {
    pub fn init(path: impl AsRef<Path>, config: EngineConfig, remote: Arc<dyn RemoteStore>) -> Result<Self> {
        Self::build(LocalStore::open(path, &config)?, config, remote, Arc::new(SystemClock))
    }

    pub fn init_in_memory(config: EngineConfig, remote: Arc<dyn RemoteStore>) -> Result<Self> {
        Self::build(LocalStore::open_in_memory(&config)?, config, remote, Arc::new(SystemClock))
    }

    /// For tests that need deterministic debounce/backoff timing.
    pub fn init_in_memory_with_clock(
        config: EngineConfig,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::build(LocalStore::open_in_memory(&config)?, config, remote, clock)
    }

    fn build(store: LocalStore, config: EngineConfig, remote: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Arc::new(store);
        let identity = Arc::new(DeviceIdentity::load_or_create(&store.meta())?);
        let status = Arc::new(StatusState::new());
        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            remote.clone(),
            identity.clone(),
            clock,
            status.clone(),
            config,
        ));
        let realtime = Arc::new(RealtimeIngestor::new(coordinator.clone(), remote.clone()));
        Ok(Engine {
            store,
            identity,
            status,
            remote,
            coordinator,
            realtime,
        })
    }

    pub fn device_id(&self) -> &Guid {
        self.identity.id()
    }

    // -- writes --------------------------------------------------------

    pub fn create(&self, table: &str, fields: Map<String, JsonValue>) -> Result<SyncedRecord> {
        self.create_with_id(table, Guid::random(), fields)
    }

    /// Same as `create`, but with a caller-chosen id - used by tests that
    /// need deterministic entity ids to assert on queue/merge outcomes.
    pub fn create_with_id(&self, table: &str, id: Guid, fields: Map<String, JsonValue>) -> Result<SyncedRecord> {
        let ownership_key = self.store.config().identity_prefix.clone();
        let rec = self.store.with_write_tx(|tx| {
            let rec = store_fns::create_record(tx, table, id.clone(), &ownership_key, self.identity.id().clone(), fields.clone())?;
            queue::queue::enqueue(tx, &Operation::create(table, id.as_str(), JsonValue::Object(fields)))?;
            Ok(rec)
        })?;
        self.after_enqueue();
        Ok(rec)
    }

    pub fn update(&self, table: &str, id: &str, partial: Map<String, JsonValue>) -> Result<Option<SyncedRecord>> {
        let result = self.store.with_write_tx(|tx| {
            let updated = store_fns::update_fields(tx, table, id, partial.clone())?;
            if updated.is_some() {
                queue::queue::enqueue(tx, &Operation::set_whole(table, id, JsonValue::Object(partial)))?;
            }
            Ok(updated)
        })?;
        if result.is_some() {
            self.after_enqueue();
        }
        Ok(result)
    }

    pub fn delete(&self, table: &str, id: &str) -> Result<bool> {
        let deleted = self.store.with_write_tx(|tx| {
            let deleted = store_fns::soft_delete(tx, table, id)?;
            if deleted {
                queue::queue::enqueue(tx, &Operation::delete(table, id))?;
            }
            Ok(deleted)
        })?;
        if deleted {
            self.after_enqueue();
        }
        Ok(deleted)
    }

    pub fn increment(
        &self,
        table: &str,
        id: &str,
        field: &str,
        delta: f64,
        extra: Option<Map<String, JsonValue>>,
    ) -> Result<Option<SyncedRecord>> {
        let result = self.store.with_write_tx(|tx| {
            let Some(rec) = store_fns::get_record(tx, table, id)? else {
                return Ok(None);
            };
            let current = rec.get(field).and_then(JsonValue::as_f64).unwrap_or(0.0);
            let mut partial = extra.clone().unwrap_or_default();
            partial.insert(field.to_string(), JsonValue::from(current + delta));
            let updated = store_fns::update_fields(tx, table, id, partial)?;
            queue::queue::enqueue(tx, &Operation::increment(table, id, field, delta))?;
            if let Some(extra) = extra {
                if !extra.is_empty() {
                    queue::queue::enqueue(tx, &Operation::set_whole(table, id, JsonValue::Object(extra)))?;
                }
            }
            Ok(updated)
        })?;
        if result.is_some() {
            self.after_enqueue();
        }
        Ok(result)
    }

    /// Applies every intent inside one transaction: either all of the
    /// batch's entity writes and queue enqueues commit, or none do.
    pub fn batch_write(&self, intents: Vec<WriteIntent>) -> Result<()> {
        if intents.is_empty() {
            return Ok(());
        }
        let ownership_key = self.store.config().identity_prefix.clone();
        self.store.with_write_tx(|tx| {
            for intent in intents {
                match intent {
                    WriteIntent::Create { table, id, fields } => {
                        let id = id.map(Guid::from).unwrap_or_else(Guid::random);
                        store_fns::create_record(tx, &table, id.clone(), &ownership_key, self.identity.id().clone(), fields.clone())?;
                        queue::queue::enqueue(tx, &Operation::create(table.as_str(), id.as_str(), JsonValue::Object(fields)))?;
                    }
                    WriteIntent::Update { table, id, partial } => {
                        if store_fns::update_fields(tx, &table, &id, partial.clone())?.is_some() {
                            queue::queue::enqueue(
                                tx,
                                &Operation::set_whole(table.as_str(), id.as_str(), JsonValue::Object(partial)),
                            )?;
                        }
                    }
                    WriteIntent::Delete { table, id } => {
                        if store_fns::soft_delete(tx, &table, &id)? {
                            queue::queue::enqueue(tx, &Operation::delete(table.as_str(), id.as_str()))?;
                        }
                    }
                    WriteIntent::Increment { table, id, field, delta } => {
                        if let Some(rec) = store_fns::get_record(tx, &table, &id)? {
                            let current = rec.get(&field).and_then(JsonValue::as_f64).unwrap_or(0.0);
                            let mut partial = Map::new();
                            partial.insert(field.clone(), JsonValue::from(current + delta));
                            store_fns::update_fields(tx, &table, &id, partial)?;
                            queue::queue::enqueue(
                                tx,
                                &Operation::increment(table.as_str(), id.as_str(), field.as_str(), delta),
                            )?;
                        }
                    }
                }
            }
            Ok(())
        })?;
        self.after_enqueue();
        Ok(())
    }

    fn after_enqueue(&self) {
        self.coordinator.note_enqueue();
        self.publish_status();
    }

    fn publish_status(&self) -> StatusSnapshot {
        let queue = queue::OperationQueue::new(&self.store);
        let pending_count = queue.len().unwrap_or(0);
        let unsynced_entity_count = queue
            .all()
            .map(|ops| {
                ops.into_iter()
                    .map(|op| (op.table, op.entity_id))
                    .collect::<std::collections::HashSet<_>>()
                    .len()
            })
            .unwrap_or(0);
        self.status.publish(pending_count, unsynced_entity_count)
    }

    // -- reads -----------------------------------------------------------

    pub fn get(&self, table: &str, id: &str, remote_fallback: bool) -> Result<Option<SyncedRecord>> {
        if let Some(rec) = self.store.get(table, id)? {
            return Ok(Some(rec));
        }
        if remote_fallback {
            if let Some(rec) = self.remote.select_by_id(table, id)? {
                self.store.put(table, &rec)?;
                return Ok(Some(rec));
            }
        }
        Ok(None)
    }

    pub fn get_all(&self, table: &str, order_by_updated_at: bool) -> Result<Vec<SyncedRecord>> {
        self.store.get_all(table, order_by_updated_at)
    }

    pub fn query(&self, table: &str, field: &str, value: &JsonValue) -> Result<Vec<SyncedRecord>> {
        self.store.query_equal(table, field, value)
    }

    pub fn query_range(&self, table: &str, field: &str, lo: &JsonValue, hi: &JsonValue) -> Result<Vec<SyncedRecord>> {
        self.store.query_range(table, field, lo, hi)
    }

    pub fn get_or_create(
        &self,
        table: &str,
        field: &str,
        value: &JsonValue,
        defaults: Map<String, JsonValue>,
    ) -> Result<SyncedRecord> {
        if let Some(rec) = self.store.query_equal(table, field, value)?.into_iter().next() {
            return Ok(rec);
        }
        let mut fields = defaults;
        fields.insert(field.to_string(), value.clone());
        self.create(table, fields)
    }

    // -- sync lifecycle ----------------------------------------------------

    pub fn start_sync(&self) -> Result<()> {
        self.coordinator.start()
    }

    pub fn stop_sync(&self) {
        self.coordinator.stop()
    }

    pub fn set_connected(&self, connected: bool) {
        self.coordinator.set_connected(connected);
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.coordinator.set_authenticated(authenticated);
    }

    /// Drives one cooperative scheduling step: runs a push cycle if the
    /// debounce window has elapsed, then drains realtime changes. Meant to
    /// be called from the host's own event loop.
    pub fn tick(&self) -> Result<()> {
        self.coordinator.tick()?;
        if let Err(err) = self.realtime.poll() {
            self.status.record_error(err.to_string(), err.class());
        }
        self.publish_status();
        Ok(())
    }

    pub fn run_push_cycle(&self) -> Result<()> {
        self.coordinator.run_push_cycle()?;
        self.publish_status();
        Ok(())
    }

    pub fn run_pull_cycle(&self) -> Result<()> {
        self.coordinator.run_pull_cycle()?;
        self.publish_status();
        Ok(())
    }

    pub fn poll_realtime(&self) -> Result<usize> {
        let n = self.realtime.poll()?;
        self.publish_status();
        Ok(n)
    }

    pub fn subscribe_status(&self, callback: impl Fn(&StatusSnapshot) + Send + Sync + 'static) {
        self.status.subscribe(callback);
    }

    pub fn status(&self) -> StatusSnapshot {
        self.publish_status()
    }

    /// Scans the persisted, retention-pruned conflict history, newest
    /// first - the full audit trail behind `status()`'s bounded rolling
    /// window, for hosts that want their own diagnostics view.
    pub fn conflict_history(&self, limit: usize) -> Result<Vec<ConflictHistoryRecord>> {
        self.store.with_connection(|conn| history::recent(conn, limit))
    }
}
