// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Retry policies for operations against loosely-coupled components.
//!
//! These are for transient reachability faults (a destination cluster
//! that is still coming up, a congested management network).  Protocol
//! retries with fixed attempt counts — such as the memory-migration
//! reboot retry — are deliberately not expressed with these policies.

use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// Policy for probing a remote cluster's management plane.
///
/// Bounded: feasibility checking must fail promptly when the destination
/// is genuinely unreachable, so we give up after a few seconds rather
/// than retrying forever.
pub fn retry_policy_remote_ping() -> ::backoff::ExponentialBackoff {
    ::backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(250))
        .with_multiplier(2.0)
        .with_max_interval(Duration::from_secs(2))
        .with_max_elapsed_time(Some(Duration::from_secs(5)))
        .build()
}

/// Policy for conditions local to this node, where repeating the request
/// cannot overload anything remote.
pub fn retry_policy_local() -> ::backoff::ExponentialBackoff {
    ::backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(50))
        .with_multiplier(2.0)
        .with_max_interval(Duration::from_secs(1))
        .with_max_elapsed_time(None)
        .build()
}
