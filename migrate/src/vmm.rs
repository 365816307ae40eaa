// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client interface to the hypervisor-control agent.
//!
//! The agent owns guest domains: it performs the actual memory-state
//! transfer, keeps its own cached copy of VM metadata, and emits
//! state-change events that the control plane normally consumes.  The
//! engine addresses VMs by UUID here — the agent knows nothing about
//! cluster references.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Handle for a long-running agent task.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct VmmTaskId(pub String);

impl fmt::Display for VmmTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Guest state as reported by the agent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GuestState {
    Halted,
    Paused,
    Running,
    Suspended,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum VmmError {
    /// The agent-side task was cancelled.  This also surfaces when the
    /// guest rebooted mid-transfer, which is why the orchestrator only
    /// treats it as fatal when the cluster task was itself cancelled.
    #[error("agent task {task} was cancelled")]
    Cancelled { task: String },

    /// An internal agent failure.  `End_of_file` here is the other
    /// guest-rebooted-mid-transfer signature.
    #[error("agent internal error: {message}")]
    Internal { message: String },

    #[error("no such VM known to the agent: {uuid}")]
    DoesNotExist { uuid: Uuid },
}

pub const END_OF_FILE: &str = "End_of_file";

#[async_trait]
pub trait VmmAgent: Send + Sync {
    /// Starts a memory-state migration of `vm_uuid` toward the agent at
    /// `url`.  The maps translate source-side device identities into
    /// destination-side ones: VDI locator → locator, VIF device →
    /// bridge, vGPU device → PCI address.
    #[allow(clippy::too_many_arguments)]
    async fn vm_migrate(
        &self,
        dbg: &str,
        vm_uuid: &Uuid,
        vdi_map: &BTreeMap<String, String>,
        vif_map: &BTreeMap<String, String>,
        vgpu_map: &BTreeMap<String, String>,
        url: &str,
        compress: bool,
        verify_dest: bool,
    ) -> Result<VmmTaskId, VmmError>;

    /// Blocks until the given agent task completes.
    async fn task_wait(
        &self,
        dbg: &str,
        task: &VmmTaskId,
    ) -> Result<(), VmmError>;

    async fn vm_stat(
        &self,
        dbg: &str,
        vm_uuid: &Uuid,
    ) -> Result<GuestState, VmmError>;

    async fn vm_shutdown(
        &self,
        dbg: &str,
        vm_uuid: &Uuid,
    ) -> Result<(), VmmError>;

    /// Drops the agent's cached metadata for a VM that no longer runs
    /// here.
    async fn metadata_delete(
        &self,
        dbg: &str,
        vm_uuid: &Uuid,
    ) -> Result<(), VmmError>;

    /// Suppresses state-change events for `vm_uuid` on the source
    /// queue.  While suppressed, the control plane will not react to
    /// the domain flickering through transient states — without this, a
    /// resumed event mid-migration can trigger spurious VBD teardown.
    async fn events_suppress(&self, vm_uuid: &Uuid) -> Result<(), VmmError>;

    async fn events_resume(&self, vm_uuid: &Uuid) -> Result<(), VmmError>;

    /// Detaches the VM's network backends on this host.
    async fn network_detach(
        &self,
        dbg: &str,
        vm_uuid: &Uuid,
    ) -> Result<(), VmmError>;
}
