/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! An injectable time source, following `interrupt-support::Interruptee`'s
//! idiom of decoupling "what triggers a check" from "what is checked."
//! Debounce and backoff windows are computed against `Clock::now()` rather
//! than a real timer, so tests can advance time deterministically instead
//! of sleeping.

use crate::timestamp::Timestamp;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A manually-advanced clock for deterministic tests of debounce, backoff,
/// and pull-interval behavior.
#[derive(Debug)]
pub struct FakeClock {
    current: parking_lot::Mutex<Timestamp>,
}

impl FakeClock {
    pub fn new(start: Timestamp) -> Self {
        FakeClock {
            current: parking_lot::Mutex::new(start),
        }
    }

    pub fn advance_millis(&self, millis: i64) {
        let mut guard = self.current.lock();
        *guard = Timestamp::from_millis(guard.as_millis() + millis);
    }

    pub fn set(&self, at: Timestamp) {
        *self.current.lock() = at;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Timestamp {
        *self.current.lock()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fake_clock_advances_deterministically() {
        let clock = FakeClock::new(Timestamp::from_millis(1000));
        assert_eq!(clock.now().as_millis(), 1000);
        clock.advance_millis(500);
        assert_eq!(clock.now().as_millis(), 1500);
    }
}
