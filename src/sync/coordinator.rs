/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The Sync Coordinator (C6): push/pull cycle orchestration, debouncing,
//! echo suppression and backpressure. Adapted from `remerge::sync::driver`
//! and `sync::store`'s push-then-pull shape, generalized away from the
//! Sync15 BSO protocol to a generic `RemoteStore` contract.
//!
//! This crate ships no scheduler thread: per §5's single-threaded
//! cooperative model, the host drives `tick()` from its own event loop
//! (or directly calls `run_push_cycle`/`run_pull_cycle`). `Clock` makes
//! that cooperative timing deterministically testable.

use crate::config::EngineConfig;
use crate::error::{Error, ErrorClass, Result};
use crate::identity::DeviceIdentity;
use crate::queue::{self, coalesce, Operation, OperationQueue};
use crate::record::SyncedRecord;
use crate::resolve::{self, history::ConflictHistoryEntry};
use crate::status::{ConflictSummary, StatusState};
use crate::storage::meta::{watermark_key, MetaStore};
use crate::storage::{store as store_fns, LocalStore};
use crate::sync::clock::Clock;
use crate::sync::remote::RemoteStore;
use crate::timestamp::Timestamp;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    identity: Arc<DeviceIdentity>,
    clock: Arc<dyn Clock>,
    status: Arc<StatusState>,
    config: EngineConfig,

    last_enqueue_at: Mutex<Option<Timestamp>>,
    push_running: AtomicBool,
    push_rerun_requested: AtomicBool,
    started: AtomicBool,
    connected: AtomicBool,
    authenticated: AtomicBool,
    extra_backoff_until: Mutex<Option<Timestamp>>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        identity: Arc<DeviceIdentity>,
        clock: Arc<dyn Clock>,
        status: Arc<StatusState>,
        config: EngineConfig,
    ) -> Self {
        SyncCoordinator {
            store,
            remote,
            identity,
            clock,
            status,
            config,
            last_enqueue_at: Mutex::new(None),
            push_running: AtomicBool::new(false),
            push_rerun_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            authenticated: AtomicBool::new(true),
            extra_backoff_until: Mutex::new(None),
        }
    }

    pub fn identity_id(&self) -> &str {
        self.identity.id().as_str()
    }

    pub fn set_connected(&self, connected: bool) {
        let was_connected = self.connected.swap(connected, Ordering::SeqCst);
        self.status.set_connected(connected);
        if connected && !was_connected && self.started.load(Ordering::SeqCst) {
            let _ = self.run_pull_cycle();
        }
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    /// Idempotent. Valid only when authenticated; schedules the first
    /// pull. Realtime subscription is owned by `RealtimeIngestor`, which
    /// the host polls alongside this coordinator.
    pub fn start(&self) -> Result<()> {
        if !self.authenticated.load(Ordering::SeqCst) {
            return Err(Error::AuthRequired);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.run_pull_cycle()
    }

    /// Drains any in-flight push to completion without starting another;
    /// cancels no queued operations.
    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn note_enqueue(&self) {
        *self.last_enqueue_at.lock() = Some(self.clock.now());
    }

    fn debounce_elapsed(&self) -> bool {
        match *self.last_enqueue_at.lock() {
            None => false,
            Some(enqueued) => {
                let elapsed = self.clock.now().as_millis() - enqueued.as_millis();
                elapsed >= self.config.timing.push_debounce.as_millis() as i64
            }
        }
    }

    /// Called by the host's event loop. Runs a push cycle if the debounce
    /// window has elapsed since the last enqueue, pending any additional
    /// backpressure wait from a prior transport failure.
    pub fn tick(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        let now = self.clock.now();
        let backoff_clear = match *self.extra_backoff_until.lock() {
            Some(until) => now >= until,
            None => true,
        };
        if backoff_clear && self.debounce_elapsed() {
            *self.last_enqueue_at.lock() = None;
            self.run_push_cycle()?;
        }
        Ok(())
    }

    /// Serialized: at most one push cycle runs at a time. A trigger that
    /// arrives while one is in flight sets a "run again" flag instead of
    /// overlapping.
    pub fn run_push_cycle(&self) -> Result<()> {
        if self.push_running.swap(true, Ordering::SeqCst) {
            self.push_rerun_requested.store(true, Ordering::SeqCst);
            return Ok(());
        }
        let result = self.run_push_cycle_inner();
        self.push_running.store(false, Ordering::SeqCst);
        if self.push_rerun_requested.swap(false, Ordering::SeqCst) {
            return self.run_push_cycle();
        }
        result
    }

    fn run_push_cycle_inner(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) || !self.authenticated.load(Ordering::SeqCst) {
            return Ok(());
        }

        let queue = OperationQueue::new(&self.store);
        let all_ops = queue.all()?;
        let outcome = coalesce::coalesce(all_ops);
        self.apply_coalesce_outcome(&outcome)?;

        let now = self.clock.now();
        let ready = queue.pending_ready(self.config.timing.retry_ceiling, now)?;
        let mut rate_limited = false;
        for op in ready {
            let op_id = op.op_id.expect("queued operation always has an op_id");
            match self.push_one(&op) {
                Ok(()) => {
                    self.store.with_write_tx(|tx| queue::queue::ack(tx, op_id))?;
                    self.status.record_push_success(self.clock.now());
                }
                Err(err) => {
                    self.status.record_error(err.to_string(), err.class());
                    match err.class() {
                        ErrorClass::Validation => {
                            // Non-retryable: the remote will never accept this
                            // payload as-is, so reap it now instead of burning
                            // through the retry ceiling first.
                            self.store.with_write_tx(|tx| queue::queue::ack(tx, op_id))?;
                            self.status.record_reaped(HashSet::from([op.table.clone()]));
                        }
                        ErrorClass::ConflictRejected => {
                            // Pull and resolve this table's rows through the
                            // conflict resolver; leave the op queued so it
                            // re-pushes against the merged state next cycle.
                            self.pull_table(&op.table)?;
                        }
                        ErrorClass::AuthRequired => {
                            // Halt sync entirely until the host re-authenticates
                            // rather than treating this like a transient failure.
                            self.authenticated.store(false, Ordering::SeqCst);
                            break;
                        }
                        ErrorClass::Corrupted => {
                            // Best-effort scrub: a corrupted queued op can't be
                            // retried meaningfully, so drop it and move on.
                            log::warn!(
                                "scrubbing corrupted queued operation {op_id} ({}/{}): {err}",
                                op.table,
                                op.entity_id
                            );
                            self.store.with_write_tx(|tx| queue::queue::ack(tx, op_id))?;
                        }
                        ErrorClass::TransientTransport => {
                            self.store
                                .with_write_tx(|tx| queue::queue::bump(tx, op_id, self.clock.now()))?;
                            rate_limited = true;
                        }
                        ErrorClass::LocalStore => {
                            self.store
                                .with_write_tx(|tx| queue::queue::bump(tx, op_id, self.clock.now()))?;
                        }
                    }
                }
            }
        }

        if rate_limited {
            let wait_ms = self.config.timing.push_debounce.as_millis() as i64 * 4;
            *self.extra_backoff_until.lock() = Some(Timestamp::from_millis(self.clock.now().as_millis() + wait_ms));
        }

        let (reaped, tables) = queue.reap_exhausted(self.config.timing.retry_ceiling)?;
        if reaped > 0 {
            self.status.record_reaped(tables);
        }
        Ok(())
    }

    fn push_one(&self, op: &Operation) -> Result<()> {
        use crate::queue::OpKind;
        match op.kind {
            OpKind::Create => {
                let rec = self.require_local(&op.table, &op.entity_id)?;
                self.remote.insert(&op.table, &rec)
            }
            OpKind::Set | OpKind::Increment => {
                let rec = self.require_local(&op.table, &op.entity_id)?;
                self.remote.update(&op.table, &rec)
            }
            OpKind::Delete => self.remote.soft_delete(&op.table, &op.entity_id, self.clock.now()),
        }
    }

    fn require_local(&self, table: &str, id: &str) -> Result<SyncedRecord> {
        self.store
            .get(table, id)?
            .ok_or_else(|| Error::NoSuchRecord(id.to_string(), table.to_string()))
    }

    fn apply_coalesce_outcome(&self, outcome: &coalesce::CoalesceOutcome) -> Result<()> {
        if outcome.removed_op_ids.is_empty() {
            return Ok(());
        }
        self.store.with_write_tx(|tx| {
            for id in &outcome.removed_op_ids {
                queue::queue::ack(tx, *id)?;
            }
            for op in &outcome.surviving {
                if let Some(op_id) = op.op_id {
                    queue::queue::update_payload(tx, op_id, op.field.as_deref(), op.value.as_ref())?;
                }
            }
            Ok(())
        })
    }

    /// Triggered on startup, reconnect, and the configured interval.
    /// Fetches rows updated since each table's high watermark.
    pub fn run_pull_cycle(&self) -> Result<()> {
        for table in self.config.tables.clone() {
            self.pull_table(&table.name)?;
        }
        self.status.record_pull(self.clock.now());
        Ok(())
    }

    fn pull_table(&self, table: &str) -> Result<()> {
        let key = watermark_key(table);
        let since = self
            .store
            .meta()
            .get_string(&key)?
            .and_then(|s| s.parse::<i64>().ok())
            .map(Timestamp::from_millis)
            .unwrap_or(Timestamp::from_millis(0));

        let rows = self.remote.select_updated_since(table, since)?;
        let mut high_watermark = since;
        for row in rows {
            if row.updated_at > high_watermark {
                high_watermark = row.updated_at;
            }
            self.apply_incoming(table, row)?;
        }
        self.store.meta().set_string(&key, &high_watermark.as_millis().to_string())?;
        Ok(())
    }

    /// Shared by the pull cycle and the realtime ingestor: echo
    /// suppression, then direct-apply vs. route-to-resolver, per §4.6/§4.7.
    pub(crate) fn apply_incoming(&self, table: &str, row: SyncedRecord) -> Result<()> {
        let local = self.store.get(table, row.id.as_str())?;

        if row.device_id.as_str() == self.identity.id().as_str() {
            let local_version = local.as_ref().map(SyncedRecord::version_or_default).unwrap_or(0);
            if row.version_or_default() <= local_version {
                return Ok(()); // echo: already reflected locally, discard.
            }
        }

        let queue = OperationQueue::new(&self.store);
        let pending_ops: Vec<Operation> = queue
            .all()?
            .into_iter()
            .filter(|op| op.table == table && op.entity_id == row.id.as_str())
            .collect();

        let apply_directly = match &local {
            None => true,
            Some(l) => {
                pending_ops.is_empty()
                    && (row.updated_at, row.version_or_default()) > (l.updated_at, l.version_or_default())
            }
        };

        if apply_directly {
            self.store.with_write_tx(|tx| store_fns::put_record(tx, table, &row))?;
            return Ok(());
        }

        let table_cfg = self
            .config
            .table(table)
            .ok_or_else(|| Error::UnknownTable(table.to_string()))?;
        let outcome = resolve::resolve(table_cfg, local.as_ref(), &row, &pending_ops);
        let now = self.clock.now();
        let entries: Vec<ConflictHistoryEntry> = outcome
            .resolutions
            .iter()
            .map(|r| ConflictHistoryEntry {
                table: table.to_string(),
                entity_id: row.id.clone().into_string(),
                field: r.field.clone(),
                local_value: r.local_value.clone(),
                remote_value: r.remote_value.clone(),
                resolved_value: r.resolved_value.clone(),
                winner: r.winner,
                strategy: r.strategy,
                timestamp: now,
            })
            .collect();

        self.store.with_write_tx(|tx| {
            store_fns::put_record(tx, table, &outcome.merged)?;
            resolve::history::persist(tx, &entries);
            Ok(())
        })?;

        for entry in &entries {
            self.status.record_conflict(ConflictSummary {
                table: entry.table.clone(),
                entity_id: entry.entity_id.clone(),
                field: entry.field.clone(),
                winner: entry.winner.to_string(),
                strategy: entry.strategy.to_string(),
                at: entry.timestamp,
            });
        }
        Ok(())
    }
}
