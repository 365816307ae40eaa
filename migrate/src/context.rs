// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-operation context threaded through the engine.

use crate::db::Datastore;
use apiary_common::api::{Error, TaskRef};
use slog::Logger;

/// Context for one externally visible operation.
///
/// Carries the operation's logger and the cluster task record under
/// which the operation runs.  Cancellation is cooperative: long-running
/// paths call [`OpContext::check_cancelled`] at their suspension points
/// and unwind with `task_cancelled` when a cancel has been requested.
#[derive(Clone)]
pub struct OpContext {
    pub log: Logger,
    pub task: TaskRef,
}

impl OpContext {
    pub fn new(log: Logger, task: TaskRef) -> OpContext {
        OpContext { log, task }
    }

    /// Debug identifier passed to the storage and hypervisor agents so
    /// their logs can be correlated with this task.
    pub fn dbg(&self) -> String {
        self.task.0.to_string()
    }

    pub async fn check_cancelled(
        &self,
        datastore: &dyn Datastore,
    ) -> Result<(), Error> {
        let task = datastore.task(&self.task).await?;
        if task.cancelling {
            return Err(Error::TaskCancelled { task: self.task });
        }
        Ok(())
    }
}
