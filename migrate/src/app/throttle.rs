// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The gate capping concurrent storage migrations on this node.

use apiary_common::api::Error;
use std::sync::Mutex;

/// Counting gate over the node's storage migrations.
///
/// Storage mirrors are expensive (they tie up tapdisk datapaths and
/// inter-host bandwidth for as long as the guest keeps dirtying blocks),
/// so each node admits at most `limit` at a time.  The count is
/// per-process state; it is intentionally not stored in the cluster
/// database.
#[derive(Debug)]
pub struct MigrationThrottle {
    limit: u32,
    active: Mutex<u32>,
}

impl MigrationThrottle {
    pub fn new(limit: u32) -> MigrationThrottle {
        MigrationThrottle { limit, active: Mutex::new(0) }
    }

    /// Admits one migration, or fails with `too_many_storage_migrates`
    /// leaving the count untouched.  The returned permit releases its
    /// slot when dropped, so release happens on every exit path.
    pub fn enter(&self) -> Result<MigrationPermit<'_>, Error> {
        let mut active = self.active.lock().unwrap();
        if *active >= self.limit {
            return Err(Error::TooManyStorageMigrates { limit: self.limit });
        }
        *active += 1;
        Ok(MigrationPermit { throttle: self })
    }

    pub fn active(&self) -> u32 {
        *self.active.lock().unwrap()
    }
}

/// RAII membership in the throttle.
#[derive(Debug)]
pub struct MigrationPermit<'a> {
    throttle: &'a MigrationThrottle,
}

impl Drop for MigrationPermit<'_> {
    fn drop(&mut self) {
        let mut active = self.throttle.active.lock().unwrap();
        *active -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_at_limit() {
        let throttle = MigrationThrottle::new(3);
        let _a = throttle.enter().unwrap();
        let _b = throttle.enter().unwrap();
        let _c = throttle.enter().unwrap();
        let err = throttle.enter().unwrap_err();
        assert_eq!(err, Error::TooManyStorageMigrates { limit: 3 });
        assert_eq!(err.params(), vec!["3".to_string()]);
        // A failed entry must not perturb the count.
        assert_eq!(throttle.active(), 3);
    }

    #[test]
    fn dropping_a_permit_releases_its_slot() {
        let throttle = MigrationThrottle::new(1);
        let permit = throttle.enter().unwrap();
        assert!(throttle.enter().is_err());
        drop(permit);
        assert_eq!(throttle.active(), 0);
        let _again = throttle.enter().unwrap();
    }
}
