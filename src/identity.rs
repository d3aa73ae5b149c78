/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Device identity (C1): a stable per-installation UUID v4, persisted
//! through the same key-value meta table the rest of the local store uses
//! (`storage::meta`), generated once and cached for the process lifetime.

use crate::error::Result;
use crate::guid::Guid;
use crate::storage::meta::MetaStore;

const DEVICE_ID_KEY: &str = "device_id";

/// A placeholder used only where no local storage is available (e.g. a
/// dry-run / schema-validation context). Callers must treat it as
/// "identity unknown" and never use it for write-side merge decisions.
pub const UNKNOWN_DEVICE_PLACEHOLDER: &str = "00000000-0000-0000-0000-000000000000";

pub struct DeviceIdentity {
    id: Guid,
}

impl DeviceIdentity {
    /// On first call against a given store, generates a UUID v4 and
    /// persists it. Subsequent calls (even across process restarts)
    /// return the cached value.
    pub fn load_or_create(meta: &dyn MetaStore) -> Result<Self> {
        if let Some(existing) = meta.get_string(DEVICE_ID_KEY)? {
            return Ok(DeviceIdentity {
                id: Guid::from(existing),
            });
        }
        let fresh = Guid::random();
        meta.set_string(DEVICE_ID_KEY, fresh.as_str())?;
        Ok(DeviceIdentity { id: fresh })
    }

    /// Identity unknown - no durable storage backs this instance.
    pub fn unknown() -> Self {
        DeviceIdentity {
            id: Guid::from(UNKNOWN_DEVICE_PLACEHOLDER),
        }
    }

    pub fn is_known(&self) -> bool {
        self.id.as_str() != UNKNOWN_DEVICE_PLACEHOLDER
    }

    pub fn id(&self) -> &Guid {
        &self.id
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::store::LocalStore;

    #[test]
    fn test_first_call_generates_and_persists() {
        let store = LocalStore::open_in_memory(&Default::default()).unwrap();
        let a = DeviceIdentity::load_or_create(&store.meta()).unwrap();
        let b = DeviceIdentity::load_or_create(&store.meta()).unwrap();
        assert_eq!(a.id(), b.id());
        assert!(a.is_known());
    }

    #[test]
    fn test_unknown_placeholder_is_flagged() {
        let u = DeviceIdentity::unknown();
        assert!(!u.is_known());
    }
}
