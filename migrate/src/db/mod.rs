// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the cluster database.
//!
//! The database itself is an external collaborator: this module defines
//! the narrow read/write surface the migration engine needs, and each
//! deployment wires a concrete implementation (the in-tree one is the
//! test simulation in [`crate::sim`]).  All writes serialize inside the
//! database layer, so the engine never takes locks around them.

pub mod model;

use apiary_common::api::{
    Error, GpuGroupRef, HostRef, MessageRef, NetworkRef, PgpuRef, SrRef,
    TaskRef, VbdRef, VdiRef, VgpuRef, VifRef, VmRef, VtpmRef,
};
use async_trait::async_trait;
use model::{
    GpuGroupRecord, HostRecord, MessageRecord, NetworkRecord, PbdRecord,
    PgpuRecord, PifRecord, PoolRecord, SrRecord, TaskRecord, VbdRecord,
    VdiRecord, VgpuRecord, VifRecord, VmRecord,
};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait]
pub trait Datastore: Send + Sync {
    // Reads.  Lookups by reference fail with `handle_invalid` when the
    // reference is dangling.
    async fn pool(&self) -> Result<PoolRecord>;
    async fn host(&self, host: &HostRef) -> Result<HostRecord>;
    async fn host_by_uuid(&self, uuid: &Uuid) -> Result<Option<HostRef>>;
    async fn vm(&self, vm: &VmRef) -> Result<VmRecord>;
    async fn vm_by_uuid(&self, uuid: &Uuid) -> Result<Option<VmRef>>;
    async fn vbd(&self, vbd: &VbdRef) -> Result<VbdRecord>;
    async fn vbds_for_vdi(&self, vdi: &VdiRef) -> Result<Vec<VbdRecord>>;
    async fn vdi(&self, vdi: &VdiRef) -> Result<VdiRecord>;
    async fn vdi_by_uuid(&self, uuid: &Uuid) -> Result<Option<VdiRef>>;
    async fn sr(&self, sr: &SrRef) -> Result<SrRecord>;
    async fn pbds_for_sr(&self, sr: &SrRef) -> Result<Vec<PbdRecord>>;
    async fn vif(&self, vif: &VifRef) -> Result<VifRecord>;
    async fn network(&self, network: &NetworkRef) -> Result<NetworkRecord>;
    async fn network_by_name(&self, name: &str)
        -> Result<Option<NetworkRef>>;
    async fn pifs_for_host(&self, host: &HostRef) -> Result<Vec<PifRecord>>;
    async fn vgpu(&self, vgpu: &VgpuRef) -> Result<VgpuRecord>;
    async fn pgpu(&self, pgpu: &PgpuRef) -> Result<PgpuRecord>;
    async fn gpu_group(&self, group: &GpuGroupRef)
        -> Result<GpuGroupRecord>;
    async fn task(&self, task: &TaskRef) -> Result<TaskRecord>;
    async fn messages_for_vm(&self, vm_uuid: &Uuid)
        -> Result<Vec<MessageRecord>>;

    // Writes.
    async fn vm_set_resident_on(
        &self,
        vm: &VmRef,
        host: Option<HostRef>,
    ) -> Result<()>;
    async fn vm_set_suspend_vdi(
        &self,
        vm: &VmRef,
        vdi: Option<VdiRef>,
    ) -> Result<()>;
    async fn vm_set_suspend_sr(
        &self,
        vm: &VmRef,
        sr: Option<SrRef>,
    ) -> Result<()>;
    async fn vm_destroy(&self, vm: &VmRef) -> Result<()>;
    async fn vbd_set_vdi(&self, vbd: &VbdRef, vdi: VdiRef) -> Result<()>;
    /// Marks a CD drive empty and detaches its medium.
    async fn vbd_eject(&self, vbd: &VbdRef) -> Result<()>;
    async fn vbd_destroy(&self, vbd: &VbdRef) -> Result<()>;
    async fn vtpm_destroy(&self, vtpm: &VtpmRef) -> Result<()>;
    async fn vdi_add_other_config(
        &self,
        vdi: &VdiRef,
        key: &str,
        value: &str,
    ) -> Result<()>;
    async fn vdi_remove_other_config(
        &self,
        vdi: &VdiRef,
        key: &str,
    ) -> Result<()>;
    async fn vif_add_other_config(
        &self,
        vif: &VifRef,
        key: &str,
        value: &str,
    ) -> Result<()>;
    async fn vif_remove_other_config(
        &self,
        vif: &VifRef,
        key: &str,
    ) -> Result<()>;
    async fn vgpu_add_other_config(
        &self,
        vgpu: &VgpuRef,
        key: &str,
        value: &str,
    ) -> Result<()>;
    async fn vgpu_remove_other_config(
        &self,
        vgpu: &VgpuRef,
        key: &str,
    ) -> Result<()>;
    /// Clears a stale SR-IOV function address left behind by migration.
    async fn vgpu_clear_pci(&self, vgpu: &VgpuRef) -> Result<()>;
    async fn message_destroy(&self, message: &MessageRef) -> Result<()>;

    // Task plumbing.  Every externally-visible operation runs under a
    // task record, which carries progress, cancellation state, and
    // free-form annotations.
    async fn task_create(&self, label: &str) -> Result<TaskRef>;
    async fn task_set_progress(
        &self,
        task: &TaskRef,
        progress: f64,
    ) -> Result<()>;
    async fn task_set_cancellable(
        &self,
        task: &TaskRef,
        cancellable: bool,
    ) -> Result<()>;
    async fn task_add_other_config(
        &self,
        task: &TaskRef,
        key: &str,
        value: &str,
    ) -> Result<()>;
    /// Requests cooperative cancellation; a no-op once the task has been
    /// marked non-cancellable.
    async fn task_cancel(&self, task: &TaskRef) -> Result<()>;
}
