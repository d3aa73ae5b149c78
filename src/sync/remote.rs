/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The remote-store contract (§6.2): the one collaborator this engine
//! consumes rather than owns. Object-safe and blocking, matching the
//! single-threaded cooperative model - no async trait, no `tokio`. A host
//! binds this to whatever transport it has (HTTP client, websocket,
//! embedded replica); `testing::InMemoryRemoteStore` is the fake used by
//! this crate's own tests.

use crate::error::Result;
use crate::record::SyncedRecord;
use crate::timestamp::Timestamp;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One realtime notification as consumed by the Realtime Ingestor (C7).
#[derive(Debug, Clone)]
pub struct RemoteChange {
    pub table: String,
    pub kind: ChangeKind,
    pub row: SyncedRecord,
}

/// Everything the engine needs from a remote backing store, per spec §6.2.
/// Rows sent or received always carry every system column, including
/// `device_id` and `_version` - the engine relies on both for echo
/// suppression and conflict resolution.
pub trait RemoteStore: Send + Sync {
    fn select_by_id(&self, table: &str, id: &str) -> Result<Option<SyncedRecord>>;

    fn select_by_field(&self, table: &str, field: &str, value: &JsonValue) -> Result<Vec<SyncedRecord>>;

    /// Rows with `updated_at > since`, ascending, for the pull cycle's
    /// high-watermark sweep.
    fn select_updated_since(&self, table: &str, since: Timestamp) -> Result<Vec<SyncedRecord>>;

    fn insert(&self, table: &str, record: &SyncedRecord) -> Result<()>;

    fn update(&self, table: &str, record: &SyncedRecord) -> Result<()>;

    fn soft_delete(&self, table: &str, id: &str, updated_at: Timestamp) -> Result<()>;

    /// Drains whatever realtime notifications have arrived since the last
    /// call, already filtered server-side by ownership. An empty result is
    /// not distinguishable from "nothing happened yet" - only an `Err`
    /// signals a stream that needs reconnecting.
    fn poll_changes(&self) -> Result<Vec<RemoteChange>>;
}
