// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated destination management plane.
//!
//! One `SimCluster` fronts one cluster's datastore, for both the
//! intra-cluster case (fronting the source's own datastore) and the
//! cross-cluster case (fronting a second datastore).  Metadata import
//! reconstructs the VM graph on the fronted side, honoring the
//! remote-reference hints the engine stamped into the source objects.

use super::datastore::SimDatastore;
use super::storage::SimStorageAgent;
use crate::app::checks::cpu_features_subset;
use crate::app::dest::Destination;
use crate::app::{maps, metadata};
use crate::cluster::{
    ClusterApi, ClusterResolver, MetadataImportArgs, MetadataImportOutcome,
};
use crate::db::model::{
    GpuGroupRecord, HostRecord, MessageRecord, NetworkRecord, OnBoot,
    PbdRecord, PoolRecord, SrRecord, VbdRecord, VdiRecord, VgpuRecord,
    VifRecord, VmRecord,
};
use crate::db::Datastore;
use apiary_common::api::{
    Error, GpuGroupRef, HostRef, NetworkRef, PbdRef, PowerState, SrRef,
    VbdRef, VdiRef, VgpuRef, VifRef, VmRef,
};
use async_trait::async_trait;
use futures::lock::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
struct Counters {
    rrds_received: Vec<Uuid>,
    blobs: Vec<(Uuid, String)>,
}

pub struct SimCluster {
    local: Arc<SimDatastore>,
    source: Arc<SimDatastore>,
    storage: Arc<SimStorageAgent>,
    is_local: bool,
    counters: Mutex<Counters>,
}

impl SimCluster {
    /// A destination plane fronting `local`; `source` is the cluster
    /// migrations will arrive from (used to read exported metadata).
    pub fn new(
        local: Arc<SimDatastore>,
        source: Arc<SimDatastore>,
        storage: Arc<SimStorageAgent>,
    ) -> Arc<SimCluster> {
        let is_local = Arc::ptr_eq(&local, &source);
        Arc::new(SimCluster {
            local,
            source,
            storage,
            is_local,
            counters: Mutex::new(Counters::default()),
        })
    }

    pub async fn rrds_received(&self) -> Vec<Uuid> {
        self.counters.lock().await.rrds_received.clone()
    }

    pub async fn blobs_received(&self) -> Vec<(Uuid, String)> {
        self.counters.lock().await.blobs.clone()
    }

    /// Materializes one VM record (plus its devices) on the fronted
    /// cluster from the exported source record.
    async fn clone_vm(
        &self,
        src: &VmRecord,
        fresh_identity: bool,
        preserve_power: bool,
    ) -> Result<VmRef, Error> {
        let new_ref = VmRef::generate();

        let mut vbds = Vec::new();
        for vbd_ref in &src.vbds {
            let vbd = self.source.vbd(vbd_ref).await?;
            let vdi = match vbd.vdi {
                Some(vdi_ref) => {
                    let record = self.source.vdi(&vdi_ref).await?;
                    match record.other_config.get(metadata::KEY_VDI_MAP) {
                        Some(hint) => {
                            Some(hint.parse::<VdiRef>().map_err(|_| {
                                Error::internal_error(
                                    "bad VDI hint in exported metadata",
                                )
                            })?)
                        }
                        // Media without a transferred image (CDs)
                        // arrive as empty drives.
                        None => None,
                    }
                }
                None => None,
            };
            let new_vbd = VbdRecord {
                reference: VbdRef::generate(),
                vm: new_ref,
                empty: vdi.is_none(),
                vdi,
                device: vbd.device.clone(),
                mode: vbd.mode,
                kind: vbd.kind,
                currently_attached: false,
            };
            vbds.push(new_vbd.reference);
            self.local.insert_vbd(new_vbd).await;
        }

        let mut vifs = Vec::new();
        for vif_ref in &src.vifs {
            let vif = self.source.vif(vif_ref).await?;
            let network = match vif.other_config.get(metadata::KEY_VIF_MAP) {
                Some(hint) => hint.parse::<NetworkRef>().map_err(|_| {
                    Error::internal_error(
                        "bad network hint in exported metadata",
                    )
                })?,
                None => vif.network,
            };
            let new_vif = VifRecord {
                reference: VifRef::generate(),
                vm: new_ref,
                device: vif.device.clone(),
                mac: vif.mac.clone(),
                network,
                other_config: BTreeMap::new(),
            };
            vifs.push(new_vif.reference);
            self.local.insert_vif(new_vif).await;
        }

        let mut vgpus = Vec::new();
        for vgpu_ref in &src.vgpus {
            let vgpu = self.source.vgpu(vgpu_ref).await?;
            let group = match vgpu.other_config.get(metadata::KEY_VGPU_MAP) {
                Some(hint) => {
                    hint.parse::<GpuGroupRef>().map_err(|_| {
                        Error::internal_error(
                            "bad GPU group hint in exported metadata",
                        )
                    })?
                }
                None => vgpu.gpu_group,
            };
            // Schedule onto any pGPU of the target group; the memory
            // migration needs a placement before the guest arrives.
            let scheduled = self.pgpu_in_group(&group).await;
            let new_vgpu = VgpuRecord {
                reference: VgpuRef::generate(),
                vm: new_ref,
                device: vgpu.device.clone(),
                gpu_group: group,
                vgpu_type: vgpu.vgpu_type.clone(),
                scheduled_to_be_resident_on: scheduled,
                pci_address: None,
                other_config: BTreeMap::new(),
            };
            vgpus.push(new_vgpu.reference);
            self.local.insert_vgpu(new_vgpu).await;
        }

        let suspend_vdi = match src.suspend_vdi {
            Some(vdi_ref) => {
                let record = self.source.vdi(&vdi_ref).await?;
                match record.other_config.get(metadata::KEY_VDI_MAP) {
                    Some(hint) => hint.parse::<VdiRef>().ok(),
                    None => None,
                }
            }
            None => None,
        };

        self.local
            .insert_vm(VmRecord {
                reference: new_ref,
                uuid: if fresh_identity { Uuid::new_v4() } else { src.uuid },
                name_label: src.name_label.clone(),
                power_state: if preserve_power {
                    src.power_state
                } else {
                    PowerState::Halted
                },
                is_a_snapshot: src.is_a_snapshot,
                snapshot_of: None,
                snapshots: Vec::new(),
                resident_on: None,
                vbds,
                vifs,
                vgpus,
                vtpms: Vec::new(),
                suspend_vdi,
                suspend_sr: None,
                ha_always_run: false,
                vcpus: src.vcpus,
                last_boot_cpu_flags: src.last_boot_cpu_flags.clone(),
                hardware_platform_version: src.hardware_platform_version,
                has_legacy_hardware: src.has_legacy_hardware,
                blobs: BTreeMap::new(),
                other_config: src.other_config.clone(),
            })
            .await;
        Ok(new_ref)
    }

    async fn pgpu_in_group(
        &self,
        group: &GpuGroupRef,
    ) -> Option<apiary_common::api::PgpuRef> {
        self.local.pgpus_in_group(group).await.first().copied()
    }
}

#[async_trait]
impl ClusterApi for SimCluster {
    fn is_local(&self) -> bool {
        self.is_local
    }

    async fn pool(&self) -> Result<PoolRecord, Error> {
        self.local.pool().await
    }

    async fn host(&self, host: &HostRef) -> Result<HostRecord, Error> {
        self.local.host(host).await
    }

    async fn sr(&self, sr: &SrRef) -> Result<SrRecord, Error> {
        self.local.sr(sr).await
    }

    async fn pbds_for_sr(&self, sr: &SrRef) -> Result<Vec<PbdRecord>, Error> {
        self.local.pbds_for_sr(sr).await
    }

    async fn pbd_plug(&self, pbd: &PbdRef) -> Result<(), Error> {
        self.local.set_pbd_attached_by_ref(pbd, true).await
    }

    async fn sr_scan(&self, sr: &SrRef) -> Result<(), Error> {
        let record = self.local.sr(sr).await?;
        for volume in self.storage.take_volumes(&record.uuid).await {
            self.local
                .insert_vdi(VdiRecord {
                    reference: VdiRef::generate(),
                    uuid: volume.uuid,
                    sr: *sr,
                    location: volume.location,
                    virtual_size: volume.virtual_size,
                    on_boot: OnBoot::Persist,
                    cbt_enabled: false,
                    sm_config: BTreeMap::new(),
                    snapshot_of: None,
                    snapshot_time: volume.snapshot_time,
                    other_config: BTreeMap::new(),
                })
                .await;
        }
        Ok(())
    }

    async fn vdi_by_uuid(&self, uuid: &Uuid) -> Result<Option<VdiRef>, Error> {
        self.local.vdi_by_uuid(uuid).await
    }

    async fn vdi(&self, vdi: &VdiRef) -> Result<VdiRecord, Error> {
        self.local.vdi(vdi).await
    }

    async fn vdis_in_sr_by_location(
        &self,
        sr: &SrRef,
        location: &str,
    ) -> Result<Vec<VdiRef>, Error> {
        Ok(self.local.vdis_in_sr_by_location(sr, location).await)
    }

    async fn vdi_destroy(&self, vdi: &VdiRef) -> Result<(), Error> {
        self.local.vdi_destroy(vdi).await
    }

    async fn vdi_add_other_config(
        &self,
        vdi: &VdiRef,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        Datastore::vdi_add_other_config(&*self.local, vdi, key, value).await
    }

    async fn network(
        &self,
        network: &NetworkRef,
    ) -> Result<NetworkRecord, Error> {
        self.local.network(network).await
    }

    async fn gpu_group(
        &self,
        group: &GpuGroupRef,
    ) -> Result<GpuGroupRecord, Error> {
        self.local.gpu_group(group).await
    }

    async fn vgpu_pci_map(
        &self,
        vm: &VmRef,
    ) -> Result<BTreeMap<String, String>, Error> {
        let record = self.local.vm(vm).await?;
        let mut pairs = Vec::new();
        for vgpu_ref in &record.vgpus {
            let vgpu = self.local.vgpu(vgpu_ref).await?;
            let pgpu = match vgpu.scheduled_to_be_resident_on {
                Some(pgpu) => Some(self.local.pgpu(&pgpu).await?),
                None => None,
            };
            pairs.push((vgpu, pgpu));
        }
        maps::vgpu_pci_pairs(&pairs).map_err(|_| {
            maps::vgpu_mapping_failed(*vm, "source", "destination")
        })
    }

    async fn vm_by_uuid(&self, uuid: &Uuid) -> Result<Option<VmRef>, Error> {
        self.local.vm_by_uuid(uuid).await
    }

    async fn vm_destroy(&self, vm: &VmRef) -> Result<(), Error> {
        Datastore::vm_destroy(&*self.local, vm).await
    }

    async fn vm_set_ha_always_run(
        &self,
        vm: &VmRef,
        value: bool,
    ) -> Result<(), Error> {
        self.local
            .update_vm(vm, |record| record.ha_always_run = value)
            .await
    }

    async fn import_metadata(
        &self,
        args: &MetadataImportArgs,
    ) -> Result<MetadataImportOutcome, Error> {
        let src_vm = self.source.vm(&args.vm).await?;
        // A copy gets a fresh identity on this side; a move keeps its
        // UUID, so a leftover VM with that UUID is a conflict.
        let fresh_identity = !args.send_snapshots;
        let mut conflicts = Vec::new();
        if !fresh_identity
            && self.local.vm_by_uuid(&src_vm.uuid).await?.is_some()
        {
            conflicts
                .push(format!("VM {} already exists here", src_vm.uuid));
        }
        if args.check_cpu {
            let pool = self.local.pool().await?;
            let host = self.local.host(&pool.coordinator).await?;
            if !cpu_features_subset(
                &src_vm.last_boot_cpu_flags,
                &host.cpu_features,
            ) {
                conflicts.push(
                    "VM CPU featureset is not compatible with the \
                     destination"
                        .to_owned(),
                );
            }
        }
        if args.dry_run {
            return Ok(MetadataImportOutcome { conflicts, vm: None });
        }
        if !conflicts.is_empty() {
            return Err(Error::not_allowed(conflicts.join("; ")));
        }

        // A suspended VM arrives suspended (its memory image traveled
        // as a disk); anything else arrives halted until the memory
        // stream lands.
        let preserve_power = src_vm.power_state == PowerState::Suspended;
        let new_vm =
            self.clone_vm(&src_vm, fresh_identity, preserve_power).await?;
        if args.send_snapshots {
            let mut snapshot_refs = Vec::new();
            for snap_ref in &src_vm.snapshots {
                let snap = self.source.vm(snap_ref).await?;
                let new_snap = self.clone_vm(&snap, false, true).await?;
                self.local
                    .update_vm(&new_snap, |record| {
                        record.snapshot_of = Some(new_vm);
                    })
                    .await?;
                snapshot_refs.push(new_snap);
            }
            self.local
                .update_vm(&new_vm, |record| {
                    record.snapshots = snapshot_refs;
                })
                .await?;
        }
        Ok(MetadataImportOutcome { conflicts: Vec::new(), vm: Some(new_vm) })
    }

    async fn pool_migrate_complete(
        &self,
        vm_uuid: &Uuid,
        host: &HostRef,
    ) -> Result<(), Error> {
        let vm = self
            .local
            .vm_record_by_uuid(vm_uuid)
            .await
            .ok_or_else(|| Error::handle_invalid("VM", vm_uuid))?;
        self.local
            .update_vm(&vm.reference, |record| {
                record.resident_on = Some(*host);
            })
            .await?;
        for vgpu_ref in &vm.vgpus {
            let vgpu = self.local.vgpu(vgpu_ref).await?;
            if vgpu.pci_address.is_none() {
                continue;
            }
            let stale = match vgpu.scheduled_to_be_resident_on {
                Some(pgpu) => self.local.pgpu(&pgpu).await?.host != *host,
                None => true,
            };
            if stale {
                self.local.vgpu_clear_pci(vgpu_ref).await?;
            }
        }
        Ok(())
    }

    async fn create_message(
        &self,
        message: &MessageRecord,
    ) -> Result<(), Error> {
        self.local.insert_message(message.clone()).await;
        Ok(())
    }

    async fn put_blob(
        &self,
        vm_uuid: &Uuid,
        name: &str,
        content: &str,
    ) -> Result<(), Error> {
        self.counters
            .lock()
            .await
            .blobs
            .push((*vm_uuid, name.to_owned()));
        if let Some(vm) = self.local.vm_record_by_uuid(vm_uuid).await {
            self.local
                .update_vm(&vm.reference, |record| {
                    record
                        .blobs
                        .insert(name.to_owned(), content.to_owned());
                })
                .await?;
        }
        Ok(())
    }

    async fn receive_rrds(&self, vm_uuid: &Uuid) -> Result<(), Error> {
        self.counters.lock().await.rrds_received.push(*vm_uuid);
        Ok(())
    }
}

/// Wires destinations to their simulated planes by destination host
/// reference.
pub struct SimResolver {
    planes: Mutex<BTreeMap<HostRef, Arc<dyn ClusterApi>>>,
}

impl Default for SimResolver {
    fn default() -> Self {
        SimResolver { planes: Mutex::new(BTreeMap::new()) }
    }
}

impl SimResolver {
    pub fn new() -> Arc<SimResolver> {
        Arc::new(SimResolver::default())
    }

    pub async fn register(&self, host: HostRef, plane: Arc<dyn ClusterApi>) {
        self.planes.lock().await.insert(host, plane);
    }
}

#[async_trait]
impl ClusterResolver for SimResolver {
    async fn connect(
        &self,
        dest: &Destination,
    ) -> Result<Arc<dyn ClusterApi>, Error> {
        self.planes.lock().await.get(&dest.host).cloned().ok_or_else(|| {
            Error::CannotContactHost { url: dest.master_url.to_string() }
        })
    }
}
