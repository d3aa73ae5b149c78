/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

pub mod coalesce;
pub mod operation;
pub mod queue;

pub use coalesce::{coalesce, CoalesceOutcome};
pub use operation::{OpKind, Operation};
pub use queue::OperationQueue;
