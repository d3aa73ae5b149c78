/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

pub mod clock;
pub mod coordinator;
pub mod realtime;
pub mod remote;

pub use clock::{Clock, FakeClock, SystemClock};
pub use coordinator::SyncCoordinator;
pub use realtime::RealtimeIngestor;
pub use remote::{ChangeKind, RemoteChange, RemoteStore};
