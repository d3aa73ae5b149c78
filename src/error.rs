/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Crate-wide error type. Errors additionally classify themselves (see
//! `ErrorClass`) so the operation queue and sync coordinator can decide
//! whether to retry, reap, or surface without every caller hand-rolling
//! that judgement - this mirrors the taxonomy in the error handling design.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error executing SQL: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("error (de)serializing JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("error parsing timestamp: {0}")]
    TimestampParse(#[from] chrono::ParseError),

    #[error("no record with id {0:?} in table {1:?}")]
    NoSuchRecord(String, String),

    #[error("unknown table {0:?}")]
    UnknownTable(String),

    #[error("transient transport failure: {0}")]
    Transport(String),

    #[error("remote rejected operation (conflict): {0}")]
    RemoteConflict(String),

    #[error("validation rejected by remote: {0}")]
    Validation(String),

    #[error("sync requires (re-)authentication")]
    AuthRequired,

    #[error("local store is corrupted: {0}")]
    Corrupted(String),

    #[error("operation timed out")]
    Timeout,

    #[error("engine is not initialized")]
    NotInitialized,
}

/// Coarse classification used by `OperationQueue`/`SyncCoordinator` to
/// decide retry vs. reap vs. surface-and-halt, per the error handling
/// design's taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network down, 5xx, timeout: retried with backoff up to the ceiling.
    TransientTransport,
    /// Server rejected on a version check: pull, merge, re-enqueue.
    ConflictRejected,
    /// 4xx-equivalent: non-retryable, reaped immediately.
    Validation,
    /// Local store failure: surfaced, queued ops preserved.
    LocalStore,
    /// Halts sync until the host re-authenticates.
    AuthRequired,
    /// Best-effort scrub and continue.
    Corrupted,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Transport(_) | Error::Timeout => ErrorClass::TransientTransport,
            Error::RemoteConflict(_) => ErrorClass::ConflictRejected,
            Error::Validation(_) => ErrorClass::Validation,
            Error::Sql(_) | Error::NoSuchRecord(..) | Error::UnknownTable(_) => {
                ErrorClass::LocalStore
            }
            Error::AuthRequired => ErrorClass::AuthRequired,
            Error::Corrupted(_) => ErrorClass::Corrupted,
            Error::Json(_) | Error::TimestampParse(_) | Error::NotInitialized => {
                ErrorClass::LocalStore
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::TransientTransport | ErrorClass::ConflictRejected
        )
    }
}
