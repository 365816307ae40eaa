// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated cluster database.
//!
//! A plain in-memory object store behind one lock.  Tests build a
//! cluster's record graph with the `insert_*` helpers and then hand the
//! datastore to the engine as its `Datastore`.

use crate::db::model::{
    GpuGroupRecord, HostRecord, MessageRecord, NetworkRecord, PbdRecord,
    PgpuRecord, PifRecord, PoolRecord, SrRecord, TaskRecord, VbdRecord,
    VdiRecord, VgpuRecord, VifRecord, VmRecord,
};
use crate::db::{Datastore, Result};
use apiary_common::api::{
    Error, GpuGroupRef, HostRef, MessageRef, NetworkRef, PgpuRef, SrRef,
    TaskRef, VbdRef, VdiRef, VgpuRef, VifRef, VmRef, VtpmRef,
};
use async_trait::async_trait;
use futures::lock::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    pool: Option<PoolRecord>,
    hosts: BTreeMap<HostRef, HostRecord>,
    vms: BTreeMap<VmRef, VmRecord>,
    vbds: BTreeMap<VbdRef, VbdRecord>,
    vdis: BTreeMap<VdiRef, VdiRecord>,
    srs: BTreeMap<SrRef, SrRecord>,
    pbds: Vec<PbdRecord>,
    vifs: BTreeMap<VifRef, VifRecord>,
    networks: BTreeMap<NetworkRef, NetworkRecord>,
    pifs: Vec<PifRecord>,
    vgpus: BTreeMap<VgpuRef, VgpuRecord>,
    pgpus: BTreeMap<PgpuRef, PgpuRecord>,
    gpu_groups: BTreeMap<GpuGroupRef, GpuGroupRecord>,
    tasks: BTreeMap<TaskRef, TaskRecord>,
    messages: BTreeMap<MessageRef, MessageRecord>,
    vtpms: BTreeSet<VtpmRef>,
}

fn get<K: Ord, V: Clone>(
    map: &BTreeMap<K, V>,
    key: &K,
    type_name: &'static str,
    reference: impl Display,
) -> Result<V> {
    map.get(key)
        .cloned()
        .ok_or_else(|| Error::handle_invalid(type_name, reference))
}

pub struct SimDatastore {
    inner: Mutex<Inner>,
}

impl Default for SimDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDatastore {
    pub fn new() -> SimDatastore {
        SimDatastore { inner: Mutex::new(Inner::default()) }
    }

    pub async fn set_pool(&self, pool: PoolRecord) {
        self.inner.lock().await.pool = Some(pool);
    }

    pub async fn insert_host(&self, host: HostRecord) {
        self.inner.lock().await.hosts.insert(host.reference, host);
    }

    pub async fn insert_vm(&self, vm: VmRecord) {
        self.inner.lock().await.vms.insert(vm.reference, vm);
    }

    pub async fn insert_vbd(&self, vbd: VbdRecord) {
        self.inner.lock().await.vbds.insert(vbd.reference, vbd);
    }

    pub async fn insert_vdi(&self, vdi: VdiRecord) {
        self.inner.lock().await.vdis.insert(vdi.reference, vdi);
    }

    pub async fn insert_sr(&self, sr: SrRecord) {
        self.inner.lock().await.srs.insert(sr.reference, sr);
    }

    pub async fn insert_pbd(&self, pbd: PbdRecord) {
        self.inner.lock().await.pbds.push(pbd);
    }

    pub async fn insert_vif(&self, vif: VifRecord) {
        self.inner.lock().await.vifs.insert(vif.reference, vif);
    }

    pub async fn insert_network(&self, network: NetworkRecord) {
        self.inner
            .lock()
            .await
            .networks
            .insert(network.reference, network);
    }

    pub async fn insert_pif(&self, pif: PifRecord) {
        self.inner.lock().await.pifs.push(pif);
    }

    pub async fn insert_vgpu(&self, vgpu: VgpuRecord) {
        self.inner.lock().await.vgpus.insert(vgpu.reference, vgpu);
    }

    pub async fn insert_pgpu(&self, pgpu: PgpuRecord) {
        self.inner.lock().await.pgpus.insert(pgpu.reference, pgpu);
    }

    pub async fn insert_gpu_group(&self, group: GpuGroupRecord) {
        self.inner
            .lock()
            .await
            .gpu_groups
            .insert(group.reference, group);
    }

    pub async fn insert_message(&self, message: MessageRecord) {
        self.inner
            .lock()
            .await
            .messages
            .insert(message.reference, message);
    }

    pub async fn insert_vtpm(&self, vtpm: VtpmRef) {
        self.inner.lock().await.vtpms.insert(vtpm);
    }

    /// Looks a VDI up the way the storage plane identifies it.
    pub async fn vdi_by_sr_location(
        &self,
        sr_uuid: &Uuid,
        location: &str,
    ) -> Option<VdiRecord> {
        let inner = self.inner.lock().await;
        let sr = inner.srs.values().find(|sr| &sr.uuid == sr_uuid)?;
        inner
            .vdis
            .values()
            .find(|vdi| vdi.sr == sr.reference && vdi.location == location)
            .cloned()
    }

    pub async fn sr_by_uuid(&self, sr_uuid: &Uuid) -> Option<SrRecord> {
        let inner = self.inner.lock().await;
        inner.srs.values().find(|sr| &sr.uuid == sr_uuid).cloned()
    }

    pub async fn vm_record_by_uuid(&self, uuid: &Uuid) -> Option<VmRecord> {
        let inner = self.inner.lock().await;
        inner.vms.values().find(|vm| &vm.uuid == uuid).cloned()
    }

    pub async fn update_vm<F>(&self, vm: &VmRef, f: F) -> Result<()>
    where
        F: FnOnce(&mut VmRecord),
    {
        let mut inner = self.inner.lock().await;
        let record = inner
            .vms
            .get_mut(vm)
            .ok_or_else(|| Error::handle_invalid("VM", vm))?;
        f(record);
        Ok(())
    }

    pub async fn update_vgpu<F>(&self, vgpu: &VgpuRef, f: F) -> Result<()>
    where
        F: FnOnce(&mut VgpuRecord),
    {
        let mut inner = self.inner.lock().await;
        let record = inner
            .vgpus
            .get_mut(vgpu)
            .ok_or_else(|| Error::handle_invalid("VGPU", vgpu))?;
        f(record);
        Ok(())
    }

    pub async fn set_pbd_attached(
        &self,
        host: &HostRef,
        sr: &SrRef,
        attached: bool,
    ) {
        let mut inner = self.inner.lock().await;
        for pbd in &mut inner.pbds {
            if &pbd.host == host && &pbd.sr == sr {
                pbd.currently_attached = attached;
            }
        }
    }

    pub async fn set_pbd_attached_by_ref(
        &self,
        pbd: &apiary_common::api::PbdRef,
        attached: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for record in &mut inner.pbds {
            if &record.reference == pbd {
                record.currently_attached = attached;
                return Ok(());
            }
        }
        Err(Error::handle_invalid("PBD", pbd))
    }

    pub async fn vdis_in_sr_by_location(
        &self,
        sr: &SrRef,
        location: &str,
    ) -> Vec<VdiRef> {
        let inner = self.inner.lock().await;
        inner
            .vdis
            .values()
            .filter(|vdi| &vdi.sr == sr && vdi.location == location)
            .map(|vdi| vdi.reference)
            .collect()
    }

    pub async fn pgpus_in_group(
        &self,
        group: &GpuGroupRef,
    ) -> Vec<PgpuRef> {
        let inner = self.inner.lock().await;
        inner
            .pgpus
            .values()
            .filter(|pgpu| &pgpu.gpu_group == group)
            .map(|pgpu| pgpu.reference)
            .collect()
    }

    pub async fn vdi_destroy(&self, vdi: &VdiRef) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .vdis
            .remove(vdi)
            .map(|_| ())
            .ok_or_else(|| Error::handle_invalid("VDI", vdi))
    }

    pub async fn task_record(&self, task: &TaskRef) -> Result<TaskRecord> {
        let inner = self.inner.lock().await;
        get(&inner.tasks, task, "task", task)
    }
}

#[async_trait]
impl Datastore for SimDatastore {
    async fn pool(&self) -> Result<PoolRecord> {
        self.inner
            .lock()
            .await
            .pool
            .clone()
            .ok_or_else(|| Error::internal_error("no pool record"))
    }

    async fn host(&self, host: &HostRef) -> Result<HostRecord> {
        let inner = self.inner.lock().await;
        get(&inner.hosts, host, "host", host)
    }

    async fn host_by_uuid(&self, uuid: &Uuid) -> Result<Option<HostRef>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .hosts
            .values()
            .find(|h| &h.uuid == uuid)
            .map(|h| h.reference))
    }

    async fn vm(&self, vm: &VmRef) -> Result<VmRecord> {
        let inner = self.inner.lock().await;
        get(&inner.vms, vm, "VM", vm)
    }

    async fn vm_by_uuid(&self, uuid: &Uuid) -> Result<Option<VmRef>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .vms
            .values()
            .find(|vm| &vm.uuid == uuid)
            .map(|vm| vm.reference))
    }

    async fn vbd(&self, vbd: &VbdRef) -> Result<VbdRecord> {
        let inner = self.inner.lock().await;
        get(&inner.vbds, vbd, "VBD", vbd)
    }

    async fn vbds_for_vdi(&self, vdi: &VdiRef) -> Result<Vec<VbdRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .vbds
            .values()
            .filter(|vbd| vbd.vdi == Some(*vdi))
            .cloned()
            .collect())
    }

    async fn vdi(&self, vdi: &VdiRef) -> Result<VdiRecord> {
        let inner = self.inner.lock().await;
        get(&inner.vdis, vdi, "VDI", vdi)
    }

    async fn vdi_by_uuid(&self, uuid: &Uuid) -> Result<Option<VdiRef>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .vdis
            .values()
            .find(|vdi| &vdi.uuid == uuid)
            .map(|vdi| vdi.reference))
    }

    async fn sr(&self, sr: &SrRef) -> Result<SrRecord> {
        let inner = self.inner.lock().await;
        get(&inner.srs, sr, "SR", sr)
    }

    async fn pbds_for_sr(&self, sr: &SrRef) -> Result<Vec<PbdRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .pbds
            .iter()
            .filter(|pbd| &pbd.sr == sr)
            .cloned()
            .collect())
    }

    async fn vif(&self, vif: &VifRef) -> Result<VifRecord> {
        let inner = self.inner.lock().await;
        get(&inner.vifs, vif, "VIF", vif)
    }

    async fn network(&self, network: &NetworkRef) -> Result<NetworkRecord> {
        let inner = self.inner.lock().await;
        get(&inner.networks, network, "network", network)
    }

    async fn network_by_name(
        &self,
        name: &str,
    ) -> Result<Option<NetworkRef>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .networks
            .values()
            .find(|n| n.name_label == name)
            .map(|n| n.reference))
    }

    async fn pifs_for_host(&self, host: &HostRef) -> Result<Vec<PifRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .pifs
            .iter()
            .filter(|pif| &pif.host == host)
            .cloned()
            .collect())
    }

    async fn vgpu(&self, vgpu: &VgpuRef) -> Result<VgpuRecord> {
        let inner = self.inner.lock().await;
        get(&inner.vgpus, vgpu, "VGPU", vgpu)
    }

    async fn pgpu(&self, pgpu: &PgpuRef) -> Result<PgpuRecord> {
        let inner = self.inner.lock().await;
        get(&inner.pgpus, pgpu, "PGPU", pgpu)
    }

    async fn gpu_group(
        &self,
        group: &GpuGroupRef,
    ) -> Result<GpuGroupRecord> {
        let inner = self.inner.lock().await;
        get(&inner.gpu_groups, group, "GPU group", group)
    }

    async fn task(&self, task: &TaskRef) -> Result<TaskRecord> {
        let inner = self.inner.lock().await;
        get(&inner.tasks, task, "task", task)
    }

    async fn messages_for_vm(
        &self,
        vm_uuid: &Uuid,
    ) -> Result<Vec<MessageRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .values()
            .filter(|m| &m.vm_uuid == vm_uuid)
            .cloned()
            .collect())
    }

    async fn vm_set_resident_on(
        &self,
        vm: &VmRef,
        host: Option<HostRef>,
    ) -> Result<()> {
        self.update_vm(vm, |record| record.resident_on = host).await
    }

    async fn vm_set_suspend_vdi(
        &self,
        vm: &VmRef,
        vdi: Option<VdiRef>,
    ) -> Result<()> {
        self.update_vm(vm, |record| record.suspend_vdi = vdi).await
    }

    async fn vm_set_suspend_sr(
        &self,
        vm: &VmRef,
        sr: Option<SrRef>,
    ) -> Result<()> {
        self.update_vm(vm, |record| record.suspend_sr = sr).await
    }

    async fn vm_destroy(&self, vm: &VmRef) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .vms
            .remove(vm)
            .ok_or_else(|| Error::handle_invalid("VM", vm))?;
        for vbd in &record.vbds {
            inner.vbds.remove(vbd);
        }
        for vif in &record.vifs {
            inner.vifs.remove(vif);
        }
        for vgpu in &record.vgpus {
            inner.vgpus.remove(vgpu);
        }
        Ok(())
    }

    async fn vbd_set_vdi(&self, vbd: &VbdRef, vdi: VdiRef) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .vbds
            .get_mut(vbd)
            .ok_or_else(|| Error::handle_invalid("VBD", vbd))?;
        record.vdi = Some(vdi);
        record.empty = false;
        Ok(())
    }

    async fn vbd_eject(&self, vbd: &VbdRef) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .vbds
            .get_mut(vbd)
            .ok_or_else(|| Error::handle_invalid("VBD", vbd))?;
        record.vdi = None;
        record.empty = true;
        Ok(())
    }

    async fn vbd_destroy(&self, vbd: &VbdRef) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .vbds
            .remove(vbd)
            .map(|_| ())
            .ok_or_else(|| Error::handle_invalid("VBD", vbd))
    }

    async fn vtpm_destroy(&self, vtpm: &VtpmRef) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.vtpms.remove(vtpm) {
            Ok(())
        } else {
            Err(Error::handle_invalid("VTPM", vtpm))
        }
    }

    async fn vdi_add_other_config(
        &self,
        vdi: &VdiRef,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .vdis
            .get_mut(vdi)
            .ok_or_else(|| Error::handle_invalid("VDI", vdi))?;
        record.other_config.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn vdi_remove_other_config(
        &self,
        vdi: &VdiRef,
        key: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .vdis
            .get_mut(vdi)
            .ok_or_else(|| Error::handle_invalid("VDI", vdi))?;
        record.other_config.remove(key);
        Ok(())
    }

    async fn vif_add_other_config(
        &self,
        vif: &VifRef,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .vifs
            .get_mut(vif)
            .ok_or_else(|| Error::handle_invalid("VIF", vif))?;
        record.other_config.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn vif_remove_other_config(
        &self,
        vif: &VifRef,
        key: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .vifs
            .get_mut(vif)
            .ok_or_else(|| Error::handle_invalid("VIF", vif))?;
        record.other_config.remove(key);
        Ok(())
    }

    async fn vgpu_add_other_config(
        &self,
        vgpu: &VgpuRef,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.update_vgpu(vgpu, |record| {
            record.other_config.insert(key.to_owned(), value.to_owned());
        })
        .await
    }

    async fn vgpu_remove_other_config(
        &self,
        vgpu: &VgpuRef,
        key: &str,
    ) -> Result<()> {
        self.update_vgpu(vgpu, |record| {
            record.other_config.remove(key);
        })
        .await
    }

    async fn vgpu_clear_pci(&self, vgpu: &VgpuRef) -> Result<()> {
        self.update_vgpu(vgpu, |record| record.pci_address = None).await
    }

    async fn message_destroy(&self, message: &MessageRef) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .messages
            .remove(message)
            .map(|_| ())
            .ok_or_else(|| Error::handle_invalid("message", message))
    }

    async fn task_create(&self, label: &str) -> Result<TaskRef> {
        let mut inner = self.inner.lock().await;
        let reference = TaskRef::generate();
        inner.tasks.insert(
            reference,
            TaskRecord {
                reference,
                label: label.to_owned(),
                progress: 0.0,
                cancellable: true,
                cancelling: false,
                other_config: BTreeMap::new(),
            },
        );
        Ok(reference)
    }

    async fn task_set_progress(
        &self,
        task: &TaskRef,
        progress: f64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .tasks
            .get_mut(task)
            .ok_or_else(|| Error::handle_invalid("task", task))?;
        record.progress = progress;
        Ok(())
    }

    async fn task_set_cancellable(
        &self,
        task: &TaskRef,
        cancellable: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .tasks
            .get_mut(task)
            .ok_or_else(|| Error::handle_invalid("task", task))?;
        record.cancellable = cancellable;
        Ok(())
    }

    async fn task_add_other_config(
        &self,
        task: &TaskRef,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .tasks
            .get_mut(task)
            .ok_or_else(|| Error::handle_invalid("task", task))?;
        record.other_config.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn task_cancel(&self, task: &TaskRef) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .tasks
            .get_mut(task)
            .ok_or_else(|| Error::handle_invalid("task", task))?;
        if record.cancellable {
            record.cancelling = true;
        }
        Ok(())
    }
}
