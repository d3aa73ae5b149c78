/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Engine configuration: table set and timing knobs, read-only after
//! `init()`. Table configuration is *consumed* here, not parsed from a
//! schema language - the host application hands us a `TableConfig` per
//! synced table rather than a JSON schema document.

use std::collections::HashSet;
use std::time::Duration;

/// Fields every table excludes from conflict resolution unless the host
/// augments the set further.
pub fn default_excluded_fields() -> HashSet<String> {
    ["id", "ownership_key", "created_at", "_version"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone)]
pub struct TableConfig {
    pub name: String,
    /// Columns to select from the remote store; empty means "all".
    pub projection: Vec<String>,
    /// Fields excluded from conflict resolution (augments the defaults).
    pub excluded_fields: HashSet<String>,
    /// Fields eligible for the (currently inert) numeric-merge hook.
    pub numeric_merge_fields: HashSet<String>,
    /// Singleton tables are constrained to one row per ownership key.
    pub singleton: bool,
}

impl TableConfig {
    pub fn new(name: impl Into<String>) -> Self {
        TableConfig {
            name: name.into(),
            projection: Vec::new(),
            excluded_fields: default_excluded_fields(),
            numeric_merge_fields: HashSet::new(),
            singleton: false,
        }
    }

    pub fn exclude_fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.excluded_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn numeric_merge(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.numeric_merge_fields
            .extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn is_excluded(&self, field: &str) -> bool {
        field == "deleted" || self.excluded_fields.contains(field)
    }

    pub fn is_numeric_merge(&self, field: &str) -> bool {
        self.numeric_merge_fields.contains(field)
    }
}

#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Debounce window after an enqueue before a push cycle runs.
    pub push_debounce: Duration,
    /// How often a background pull cycle is triggered.
    pub pull_interval: Duration,
    /// Number of retries before an operation is reaped.
    pub retry_ceiling: u32,
    /// Deadline applied to every remote call.
    pub remote_call_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            push_debounce: Duration::from_millis(500),
            pull_interval: Duration::from_secs(5 * 60),
            retry_ceiling: 5,
            remote_call_timeout: Duration::from_secs(30),
        }
    }
}

/// Top-level engine configuration, the single writer of which is `init()`.
/// Everything after that is read-only, per the "no global mutable
/// configuration after init" design note.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub identity_prefix: String,
    pub tables: Vec<TableConfig>,
    pub timing: TimingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            identity_prefix: String::new(),
            tables: Vec::new(),
            timing: TimingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(identity_prefix: impl Into<String>) -> Self {
        EngineConfig {
            identity_prefix: identity_prefix.into(),
            tables: Vec::new(),
            timing: TimingConfig::default(),
        }
    }

    pub fn with_table(mut self, table: TableConfig) -> Self {
        self.tables.push(table);
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }
}
