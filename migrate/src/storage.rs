// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client interface to the storage agent (SMAPI).
//!
//! The storage plane performs the raw disk copies and live mirrors; this
//! engine only drives it.  Operations identify SRs by UUID and VDIs by
//! their backend location, which is how the agent keys them — cluster
//! references mean nothing to it.

use apiary_common::api::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A handle identifying a storage-agent session for one (VDI, consumer)
/// pair.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Datapath(pub String);

impl fmt::Display for Datapath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a registered live mirror, derived from the source SR
/// and VDI location so both ends compute the same id.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct MirrorId(pub String);

impl MirrorId {
    pub fn derive(sr: &Uuid, vdi_location: &str) -> Self {
        MirrorId(format!("{}/{}", sr, vdi_location))
    }
}

impl fmt::Display for MirrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle for a long-running storage-agent task.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct StorageTaskId(pub String);

impl fmt::Display for StorageTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Successful result of a storage-agent task.
#[derive(Clone, Debug, PartialEq)]
pub enum StorageTaskResult {
    /// A new VDI was produced (copy); its location on the destination.
    Vdi { location: String },
    /// A mirror reached the synchronized state.
    Mirror { id: MirrorId },
    Unit,
}

/// Point-in-time view of a storage-agent task.
#[derive(Clone, Debug)]
pub struct StorageTaskStatus {
    /// Fraction complete, in `[0, 1]`.
    pub progress: f64,
    /// `None` while the task is still running.
    pub result: Option<Result<StorageTaskResult, StorageError>>,
}

/// State of a registered mirror.
#[derive(Clone, Debug)]
pub struct MirrorStat {
    pub source_vdi: String,
    /// Location of the receiving VDI on the destination SR.
    pub dest_vdi: String,
    pub failed: bool,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum StorageError {
    /// A backend driver failure, passed through with its own code.
    #[error("storage backend error {code} {params:?}")]
    Backend { code: String, params: Vec<String> },

    #[error("storage operation {operation} is not implemented")]
    Unimplemented { operation: String },

    #[error("no such {kind}: {id}")]
    DoesNotExist { kind: &'static str, id: String },

    #[error("storage task {task} was cancelled")]
    Cancelled { task: String },

    #[error("storage agent internal error: {message}")]
    Internal { message: String },
}

impl From<StorageError> for Error {
    /// Translation to the cluster-visible error surface: backend errors
    /// keep their own code and params, unimplemented operations get the
    /// dedicated code, the rest become internal errors.  Cancellation is
    /// translated separately by the orchestrator, which knows whether
    /// the cluster task was cancelled.
    fn from(e: StorageError) -> Error {
        match e {
            StorageError::Backend { code, params } => {
                Error::StorageBackend { code, params }
            }
            StorageError::Unimplemented { operation } => {
                Error::UnimplementedInSmBackend { operation }
            }
            StorageError::DoesNotExist { kind, id } => {
                Error::handle_invalid(kind, id)
            }
            StorageError::Cancelled { task } => Error::InternalError {
                internal_message: format!(
                    "storage task {} cancelled outside of task cancellation",
                    task
                ),
            },
            StorageError::Internal { message } => {
                Error::InternalError { internal_message: message }
            }
        }
    }
}

#[async_trait]
pub trait StorageAgent: Send + Sync {
    async fn vdi_attach(
        &self,
        dbg: &str,
        dp: &Datapath,
        sr: &Uuid,
        vdi: &str,
        read_write: bool,
    ) -> Result<(), StorageError>;

    async fn vdi_activate(
        &self,
        dbg: &str,
        dp: &Datapath,
        sr: &Uuid,
        vdi: &str,
    ) -> Result<(), StorageError>;

    async fn dp_destroy(
        &self,
        dbg: &str,
        dp: &Datapath,
        allow_leak: bool,
    ) -> Result<(), StorageError>;

    /// One-shot replication of a VDI to `dest_sr` behind `url`.
    async fn data_copy(
        &self,
        dbg: &str,
        sr: &Uuid,
        vdi: &str,
        copy_vm: &str,
        url: &str,
        dest_sr: &Uuid,
        verify_dest: bool,
    ) -> Result<StorageTaskId, StorageError>;

    /// Starts a live mirror of a VDI to `dest_sr` behind `url`.  The
    /// returned task completes once the destination is in sync.
    #[allow(clippy::too_many_arguments)]
    async fn mirror_start(
        &self,
        dbg: &str,
        sr: &Uuid,
        vdi: &str,
        dp: &Datapath,
        mirror_vm: &str,
        copy_vm: &str,
        url: &str,
        dest_sr: &Uuid,
        verify_dest: bool,
    ) -> Result<StorageTaskId, StorageError>;

    async fn mirror_stop(
        &self,
        dbg: &str,
        id: &MirrorId,
    ) -> Result<(), StorageError>;

    async fn mirror_stat(
        &self,
        dbg: &str,
        id: &MirrorId,
    ) -> Result<MirrorStat, StorageError>;

    /// Rewrites snapshot-chain metadata on the destination so that the
    /// copied snapshots hang off the copied leaf.
    #[allow(clippy::too_many_arguments)]
    async fn update_snapshot_info_src(
        &self,
        dbg: &str,
        sr: &Uuid,
        vdi: &str,
        url: &str,
        dest_sr: &Uuid,
        dest_vdi: &str,
        snapshot_pairs: &[(String, String)],
        verify_dest: bool,
    ) -> Result<(), StorageError>;

    async fn task_stat(
        &self,
        dbg: &str,
        task: &StorageTaskId,
    ) -> Result<StorageTaskStatus, StorageError>;

    async fn task_destroy(
        &self,
        dbg: &str,
        task: &StorageTaskId,
    ) -> Result<(), StorageError>;
}
