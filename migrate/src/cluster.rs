// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to a destination cluster's management plane.
//!
//! For an intra-cluster migration this is the local plane; for a
//! cross-cluster one it is an RPC client authenticated with the session
//! handle from the destination descriptor.  The orchestrator is written
//! against this one interface so the two cases share a single code
//! path; a [`ClusterResolver`] supplied at deployment time wires a
//! [`crate::app::dest::Destination`] to the concrete transport.

use crate::app::dest::Destination;
use crate::db::model::{
    GpuGroupRecord, HostRecord, MessageRecord, NetworkRecord, PbdRecord,
    PoolRecord, SrRecord, VdiRecord,
};
use apiary_common::api::{
    Error, GpuGroupRef, HostRef, NetworkRef, PbdRef, SrRef, VdiRef, VmRef,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Arguments to the remote metadata export/import.
#[derive(Clone, Debug)]
pub struct MetadataImportArgs {
    pub vm: VmRef,
    pub dry_run: bool,
    pub live: bool,
    pub send_snapshots: bool,
    pub check_cpu: bool,
}

/// Outcome of a metadata export/import.
#[derive(Clone, Debug)]
pub struct MetadataImportOutcome {
    /// Human-readable descriptions of objects that could not be
    /// reconciled.  Must be empty for a migration to be feasible.
    pub conflicts: Vec<String>,
    /// Reference of the VM created on the destination; `None` for a dry
    /// run.
    pub vm: Option<VmRef>,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// True when this is the local cluster (intra-cluster migration).
    fn is_local(&self) -> bool;

    async fn pool(&self) -> Result<PoolRecord, Error>;
    async fn host(&self, host: &HostRef) -> Result<HostRecord, Error>;
    async fn sr(&self, sr: &SrRef) -> Result<SrRecord, Error>;
    async fn pbds_for_sr(&self, sr: &SrRef) -> Result<Vec<PbdRecord>, Error>;
    async fn pbd_plug(&self, pbd: &PbdRef) -> Result<(), Error>;

    /// Rescans an SR so freshly written volumes appear as VDI records.
    async fn sr_scan(&self, sr: &SrRef) -> Result<(), Error>;
    async fn vdi_by_uuid(&self, uuid: &Uuid) -> Result<Option<VdiRef>, Error>;
    async fn vdi(&self, vdi: &VdiRef) -> Result<VdiRecord, Error>;
    async fn vdis_in_sr_by_location(
        &self,
        sr: &SrRef,
        location: &str,
    ) -> Result<Vec<VdiRef>, Error>;
    async fn vdi_destroy(&self, vdi: &VdiRef) -> Result<(), Error>;
    async fn vdi_add_other_config(
        &self,
        vdi: &VdiRef,
        key: &str,
        value: &str,
    ) -> Result<(), Error>;

    async fn network(
        &self,
        network: &NetworkRef,
    ) -> Result<NetworkRecord, Error>;

    async fn gpu_group(
        &self,
        group: &GpuGroupRef,
    ) -> Result<GpuGroupRecord, Error>;

    /// Derives the vGPU device → PCI address map for a VM resident (or
    /// about to be resident) on this cluster.
    async fn vgpu_pci_map(
        &self,
        vm: &VmRef,
    ) -> Result<BTreeMap<String, String>, Error>;

    async fn vm_by_uuid(&self, uuid: &Uuid) -> Result<Option<VmRef>, Error>;
    async fn vm_destroy(&self, vm: &VmRef) -> Result<(), Error>;
    async fn vm_set_ha_always_run(
        &self,
        vm: &VmRef,
        value: bool,
    ) -> Result<(), Error>;

    async fn import_metadata(
        &self,
        args: &MetadataImportArgs,
    ) -> Result<MetadataImportOutcome, Error>;

    /// Destination post-handler: updates the VM's resident host and
    /// cleans up state left stale by the move.
    async fn pool_migrate_complete(
        &self,
        vm_uuid: &Uuid,
        host: &HostRef,
    ) -> Result<(), Error>;

    // Ancillary replication, fire-and-forget from the orchestrator's
    // point of view.
    async fn create_message(&self, message: &MessageRecord)
        -> Result<(), Error>;
    async fn put_blob(
        &self,
        vm_uuid: &Uuid,
        name: &str,
        content: &str,
    ) -> Result<(), Error>;
    async fn receive_rrds(&self, vm_uuid: &Uuid) -> Result<(), Error>;
}

/// Wires a resolved destination descriptor to a concrete management
/// plane.  Implementations decide transport, TLS policy, and session
/// handling; `connect` fails with `cannot_contact_host` when the plane
/// is unreachable.
#[async_trait]
pub trait ClusterResolver: Send + Sync {
    async fn connect(
        &self,
        dest: &Destination,
    ) -> Result<Arc<dyn ClusterApi>, Error>;
}
