/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! `convergence-sync`: an offline-first, multi-device synchronization
//! engine built around an intent-based operation queue, algebraic
//! coalescing of queued intents, and three-tier conflict resolution over
//! a local SQLite replica.
//!
//! The host links against [`Engine`]: every write goes through it, every
//! sync cycle is driven by it, and every diagnostic surface is read from
//! it. Everything else in this crate is a component `Engine` wires
//! together - the operation queue (`queue`), the coalescer
//! (`queue::coalesce`), the conflict resolver (`resolve`), the sync
//! coordinator and realtime ingestor (`sync`), and the local SQLite store
//! (`storage`).

pub mod config;
pub mod engine;
pub mod error;
pub mod guid;
pub mod identity;
pub mod queue;
pub mod record;
pub mod resolve;
pub mod status;
pub mod storage;
pub mod sync;
pub mod timestamp;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{EngineConfig, TableConfig, TimingConfig};
pub use engine::{Engine, WriteIntent};
pub use error::{Error, ErrorClass, Result};
pub use guid::Guid;
pub use identity::DeviceIdentity;
pub use queue::{OpKind, Operation, OperationQueue};
pub use record::SyncedRecord;
pub use resolve::{ConflictHistoryRecord, FieldResolution, ResolveOutcome, Strategy, Winner};
pub use status::{StatusSnapshot, StatusState};
pub use storage::LocalStore;
pub use sync::{ChangeKind, Clock, FakeClock, RealtimeIngestor, RemoteChange, RemoteStore, SyncCoordinator, SystemClock};
pub use timestamp::Timestamp;
