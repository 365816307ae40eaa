// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fault-injection pause points.
//!
//! A test harness creates a flag file named after a pause point in the
//! configured fist directory; the engine then parks at that point,
//! re-checking every five seconds, until the file is removed.  With no
//! fist directory configured (production) every pause is a no-op.

use camino::Utf8Path;
use slog::{info, Logger};
use std::time::Duration;

pub const PAUSE_STORAGE_MIGRATE_PLAN: &str = "storage_migrate_plan";
pub const PAUSE_BEFORE_MEMORY_MIGRATE: &str = "before_memory_migrate";
pub const PAUSE_BEFORE_FINALIZE: &str = "before_finalize";

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Parks while the flag file for `point` exists under `fist_dir`.
pub async fn pause(log: &Logger, fist_dir: Option<&Utf8Path>, point: &str) {
    let Some(dir) = fist_dir else {
        return;
    };
    let flag = dir.join(point);
    while flag.exists() {
        info!(log, "paused on fist point"; "point" => point);
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
