// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cluster-facing migration operations and their commit/rollback
//! spine.
//!
//! `migrate_send` is the primary entry point.  Its phases are: resolve
//! the destination and device maps, assert feasibility, take a throttle
//! permit, establish the disk mirrors, and then — with source
//! state-change events suppressed — transfer metadata and drive the
//! memory migration.  Success finalizes; any failure after the permit
//! unwinds best-effort and re-raises.  Failures after the memory
//! migration has committed are recovered locally and never surfaced.

use super::checks::cpu_features_subset;
use super::dest::{self, DestinationKind};
use super::mirror::MirrorRecord;
use super::{maps, Engine, MigrateOptions, MigrationSpec};
use crate::context::OpContext;
use crate::fist;
use crate::vmm::GuestState;
use apiary_common::api::options::{OPTION_INTERNAL_VM, OPTION_NETWORK};
use apiary_common::api::{
    Error, GpuGroupRef, HostRef, NetworkRef, PowerState, SrRef, VdiRef,
    VgpuRef, VifRef, VmRef,
};
use slog::{info, warn};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Task annotation set by the storage layer when a live mirror breaks.
/// During rollback this wins over whatever error was in flight.
pub const KEY_MIRROR_FAILED: &str = "mirror_failed";

/// `other_config` keys worth carrying over to the destination copy of a
/// VDI.
const VDI_OTHER_CONFIG_WHITELIST: &[&str] = &["content_id", "tags"];

impl Engine {
    /// Dry-run validation of a migration request.  Pure: no state is
    /// mutated anywhere, and repeating the call returns the same
    /// verdict.
    #[allow(clippy::too_many_arguments)]
    pub async fn assert_can_migrate(
        &self,
        opctx: &OpContext,
        vm: VmRef,
        dest: &BTreeMap<String, String>,
        live: bool,
        vdi_map: BTreeMap<VdiRef, SrRef>,
        vif_map: BTreeMap<VifRef, NetworkRef>,
        vgpu_map: BTreeMap<VgpuRef, GpuGroupRef>,
        options: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let spec = self
            .resolve_spec(vm, dest, live, vdi_map, vif_map, vgpu_map, options)
            .await?;
        self.check_feasibility(opctx, &spec).await
    }

    /// Migrates `vm` (and its storage) to the destination described by
    /// `dest`, returning the reference of the VM at its new home.
    #[allow(clippy::too_many_arguments)]
    pub async fn migrate_send(
        &self,
        opctx: &OpContext,
        vm: VmRef,
        dest: &BTreeMap<String, String>,
        live: bool,
        vdi_map: BTreeMap<VdiRef, SrRef>,
        vif_map: BTreeMap<VifRef, NetworkRef>,
        vgpu_map: BTreeMap<VgpuRef, GpuGroupRef>,
        options: &BTreeMap<String, String>,
    ) -> Result<VmRef, Error> {
        let spec = self
            .resolve_spec(vm, dest, live, vdi_map, vif_map, vgpu_map, options)
            .await?;
        self.check_feasibility_sender(opctx, &spec).await?;

        // The permit's Drop releases the slot on every exit path.
        let _permit = self.throttle().enter()?;
        opctx.check_cancelled(self.datastore()).await?;
        info!(opctx.log, "starting migration";
            "vm" => %spec.vm.reference,
            "vm_uuid" => %spec.vm.uuid,
            "dest_host" => %spec.dest.host,
            "intra_cluster" => spec.intra_cluster(),
            "copy" => spec.options.copy,
        );
        self.migrate_send_inner(opctx, &spec).await
    }

    async fn resolve_spec(
        &self,
        vm: VmRef,
        dest: &BTreeMap<String, String>,
        live: bool,
        vdi_map: BTreeMap<VdiRef, SrRef>,
        vif_map: BTreeMap<VifRef, NetworkRef>,
        vgpu_map: BTreeMap<VgpuRef, GpuGroupRef>,
        options: &BTreeMap<String, String>,
    ) -> Result<MigrationSpec, Error> {
        let options = MigrateOptions::parse(live, options)?;
        let vm = self.datastore().vm(&vm).await?;
        let pool = self.datastore().pool().await?;
        let source_host_ref = vm.resident_on.unwrap_or(pool.coordinator);
        let source_host = self.datastore().host(&source_host_ref).await?;
        let dest =
            dest::resolve(self.datastore(), &source_host.address, dest)
                .await?;
        let destc = self.clusters().connect(&dest).await?;
        Ok(MigrationSpec {
            vm,
            source_host,
            dest,
            destc,
            options,
            vdi_map,
            vif_map,
            vgpu_map,
        })
    }

    async fn migrate_send_inner(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
    ) -> Result<VmRef, Error> {
        let mut records: Vec<MirrorRecord> = Vec::new();

        let plan = match self.plan_transfers(opctx, spec).await {
            Ok(plan) => plan,
            Err(e) => return Err(self.rollback(opctx, spec, &records, e).await),
        };
        fist::pause(
            &opctx.log,
            self.tuning().fist_dir.as_deref(),
            fist::PAUSE_STORAGE_MIGRATE_PLAN,
        )
        .await;

        if let Err(e) =
            self.run_transfers(opctx, spec, &plan, &mut records).await
        {
            return Err(self.rollback(opctx, spec, &records, e).await);
        }

        // From the first destination metadata mutation through the
        // memory migration, the source's state-change events stay
        // suppressed; reacting to the domain's transient states here
        // would tear down VBDs out from under the mirror.
        if let Err(e) = self.vmm().events_suppress(&spec.vm.uuid).await {
            let e = Error::internal_error(&format!(
                "failed to suppress events for {}: {}",
                spec.vm.uuid, e
            ));
            return Err(self.rollback(opctx, spec, &records, e).await);
        }

        let result = self.migrate_send_suppressed(opctx, spec, &records).await;
        match result {
            Ok(new_vm) => {
                self.resume_events(opctx, &spec.vm.uuid).await;
                self.finalize(opctx, spec, &records, new_vm).await;
                Ok(new_vm)
            }
            Err(e) => {
                // Rollback runs with events still suppressed so that
                // the cleanup itself cannot race the event pipeline.
                let e = self.rollback(opctx, spec, &records, e).await;
                self.resume_events(opctx, &spec.vm.uuid).await;
                Err(e)
            }
        }
    }

    /// Metadata transfer and memory migration, inside the suppressed
    /// events window.  Returns the destination VM reference.
    async fn migrate_send_suppressed(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
        records: &[MirrorRecord],
    ) -> Result<VmRef, Error> {
        opctx.check_cancelled(self.datastore()).await?;
        let vifs = self.vm_vifs(&spec.vm).await?;
        let vif_map = if spec.intra_cluster() {
            BTreeMap::new()
        } else {
            maps::complete_vif_map(&vifs, &spec.vif_map)?
        };

        let new_vm = if spec.intra_cluster() {
            spec.vm.reference
        } else {
            self.metadata_transfer(opctx, spec, records, &vif_map).await?
        };

        fist::pause(
            &opctx.log,
            self.tuning().fist_dir.as_deref(),
            fist::PAUSE_BEFORE_MEMORY_MIGRATE,
        )
        .await;

        // Last cancellation point.  Once the memory migration begins
        // the destination may own the guest, so from here on the task
        // cannot be cancelled.
        opctx.check_cancelled(self.datastore()).await?;
        self.datastore()
            .task_set_cancellable(&opctx.task, false)
            .await?;

        if spec.vm.power_state.has_domain() {
            let mut vdi_locators: BTreeMap<String, String> = records
                .iter()
                .map(|r| {
                    (
                        r.local_xenops_locator.clone(),
                        r.remote_xenops_locator.clone(),
                    )
                })
                .collect();
            // Disks that never moved keep their locators.
            for vbd in self.vm_disk_vbds(&spec.vm).await? {
                let Some(vdi_ref) = vbd.vdi else { continue };
                if records.iter().any(|r| r.local_vdi == vdi_ref) {
                    continue;
                }
                let vdi = self.datastore().vdi(&vdi_ref).await?;
                let sr_uuid = self.datastore().sr(&vdi.sr).await?.uuid;
                let locator = format!("{}/{}", sr_uuid, vdi.location);
                vdi_locators.insert(locator.clone(), locator);
            }

            let mut bridge_map = BTreeMap::new();
            for vif in &vifs {
                let target = if spec.intra_cluster() {
                    vif.network
                } else {
                    *vif_map.get(&vif.reference).ok_or(
                        Error::VifNotInMap { vif: vif.reference },
                    )?
                };
                let network = spec.destc.network(&target).await?;
                bridge_map.insert(vif.device.clone(), network.bridge);
            }

            let vgpu_map = spec.destc.vgpu_pci_map(&new_vm).await?;

            self.migrate_memory(
                opctx,
                &spec.vm.uuid,
                &vdi_locators,
                &bridge_map,
                &vgpu_map,
                &spec.dest.xenops_url.to_string(),
                self.resolve_compress(spec).await?,
                self.verify_dest(spec),
            )
            .await?;
        }

        Ok(new_vm)
    }

    async fn resolve_compress(
        &self,
        spec: &MigrationSpec,
    ) -> Result<bool, Error> {
        match spec.options.compress {
            Some(compress) => Ok(compress),
            // A same-host move never leaves the machine; compressing
            // the loopback stream is pure overhead.
            None if spec.dest.host == spec.source_host.reference => Ok(false),
            None => {
                Ok(self.datastore().pool().await?.migration_compression)
            }
        }
    }

    fn verify_dest(&self, spec: &MigrationSpec) -> bool {
        match spec.dest.kind {
            DestinationKind::IntraCluster => false,
            DestinationKind::CrossCluster { verify_cert } => verify_cert,
        }
    }

    async fn resume_events(&self, opctx: &OpContext, vm_uuid: &Uuid) {
        if let Err(e) = self.vmm().events_resume(vm_uuid).await {
            warn!(opctx.log, "failed to resume agent events";
                "vm_uuid" => %vm_uuid, "error" => %e);
        }
    }

    /// Success path.  The guest has committed to the destination, so
    /// every step here is recovered locally when it fails — logged,
    /// never surfaced to the caller.
    async fn finalize(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
        records: &[MirrorRecord],
        new_vm: VmRef,
    ) {
        fist::pause(
            &opctx.log,
            self.tuning().fist_dir.as_deref(),
            fist::PAUSE_BEFORE_FINALIZE,
        )
        .await;
        let dbg = opctx.dbg();

        if let Err(e) = spec.destc.receive_rrds(&spec.vm.uuid).await {
            warn!(opctx.log, "failed to transfer metrics";
                "vm_uuid" => %spec.vm.uuid, "error" => %e);
        }

        if spec.dest.host != spec.source_host.reference {
            if let Err(e) =
                self.vmm().network_detach(&dbg, &spec.vm.uuid).await
            {
                warn!(opctx.log, "failed to detach source networks";
                    "vm_uuid" => %spec.vm.uuid, "error" => %e);
            }
        }

        if !spec.intra_cluster() && !spec.options.copy {
            self.replicate_messages_and_blobs(opctx, spec, new_vm).await;
        }

        if spec.vm.power_state.has_domain() && !spec.options.copy {
            if let Err(e) = spec
                .destc
                .pool_migrate_complete(&spec.vm.uuid, &spec.dest.host)
                .await
            {
                warn!(opctx.log, "destination post-migration handler failed";
                    "vm_uuid" => %spec.vm.uuid, "error" => %e);
            }
        }

        if spec.intra_cluster() {
            self.remap_local_storage(opctx, spec, records).await;
        } else if !spec.options.copy {
            self.destroy_source_vm(opctx, spec).await;
        }

        info!(opctx.log, "migration complete";
            "vm" => %spec.vm.reference, "new_vm" => %new_vm);
    }

    async fn replicate_messages_and_blobs(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
        new_vm: VmRef,
    ) {
        match self.datastore().messages_for_vm(&spec.vm.uuid).await {
            Ok(messages) => {
                for message in messages {
                    if let Err(e) = spec.destc.create_message(&message).await
                    {
                        warn!(opctx.log, "failed to replicate message";
                            "message" => %message.reference, "error" => %e);
                        continue;
                    }
                    if let Err(e) = self
                        .datastore()
                        .message_destroy(&message.reference)
                        .await
                    {
                        warn!(opctx.log, "failed to destroy local message";
                            "message" => %message.reference, "error" => %e);
                    }
                }
            }
            Err(e) => {
                warn!(opctx.log, "failed to list messages";
                    "vm_uuid" => %spec.vm.uuid, "error" => %e);
            }
        }

        for (name, content) in &spec.vm.blobs {
            if let Err(e) =
                spec.destc.put_blob(&spec.vm.uuid, name, content).await
            {
                warn!(opctx.log, "failed to replicate blob";
                    "blob" => name.clone(), "error" => %e);
            }
        }

        // HA protection does not survive the VM object's destruction on
        // this side; re-arm it on the destination copy.
        let ha_enabled = match self.datastore().pool().await {
            Ok(pool) => pool.ha_enabled,
            Err(_) => false,
        };
        if ha_enabled && spec.vm.ha_always_run {
            if let Err(e) =
                spec.destc.vm_set_ha_always_run(&new_vm, true).await
            {
                warn!(opctx.log, "failed to restore HA protection";
                    "vm" => %new_vm, "error" => %e);
            }
        }
    }

    /// Intra-cluster commit: point the VM's own records at the new
    /// images.
    async fn remap_local_storage(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
        records: &[MirrorRecord],
    ) {
        for record in records {
            if record.pre_existing {
                continue;
            }
            match self.datastore().vbds_for_vdi(&record.local_vdi).await {
                Ok(vbds) => {
                    for vbd in vbds {
                        if let Err(e) = self
                            .datastore()
                            .vbd_set_vdi(&vbd.reference, record.remote_vdi)
                            .await
                        {
                            warn!(opctx.log, "failed to remap VBD";
                                "vbd" => %vbd.reference, "error" => %e);
                        }
                    }
                }
                Err(e) => {
                    warn!(opctx.log, "failed to list VBDs for remap";
                        "vdi" => %record.local_vdi, "error" => %e);
                }
            }
            if spec.vm.suspend_vdi == Some(record.local_vdi) {
                if let Err(e) = self
                    .datastore()
                    .vm_set_suspend_vdi(
                        &spec.vm.reference,
                        Some(record.remote_vdi),
                    )
                    .await
                {
                    warn!(opctx.log, "failed to remap suspend VDI";
                        "vm" => %spec.vm.reference, "error" => %e);
                }
            }
            if let Ok(local) = self.datastore().vdi(&record.local_vdi).await
            {
                for key in VDI_OTHER_CONFIG_WHITELIST {
                    if let Some(value) = local.other_config.get(*key) {
                        if let Err(e) = spec
                            .destc
                            .vdi_add_other_config(
                                &record.remote_vdi,
                                key,
                                value,
                            )
                            .await
                        {
                            warn!(opctx.log,
                                "failed to copy VDI other-config key";
                                "vdi" => %record.remote_vdi,
                                "key" => *key,
                                "error" => %e);
                        }
                    }
                }
            }
        }

        // A suspend SR the destination cannot reach is worse than no
        // suspend SR at all.
        if let Some(sr) = spec.vm.suspend_sr {
            let reachable = match spec.destc.pbds_for_sr(&sr).await {
                Ok(pbds) => pbds.iter().any(|p| p.host == spec.dest.host),
                Err(_) => false,
            };
            if !reachable {
                if let Err(e) = self
                    .datastore()
                    .vm_set_suspend_sr(&spec.vm.reference, None)
                    .await
                {
                    warn!(opctx.log, "failed to clear suspend SR";
                        "vm" => %spec.vm.reference, "error" => %e);
                }
            }
        }
    }

    /// Cross-cluster commit: the VM now lives entirely on the other
    /// side, so the local object graph goes away.
    async fn destroy_source_vm(&self, opctx: &OpContext, spec: &MigrationSpec) {
        for vbd_ref in &spec.vm.vbds {
            if let Err(e) = self.datastore().vbd_destroy(vbd_ref).await {
                warn!(opctx.log, "failed to destroy source VBD";
                    "vbd" => %vbd_ref, "error" => %e);
            }
        }
        for snapshot in &spec.vm.snapshots {
            if let Err(e) = self.datastore().vm_destroy(snapshot).await {
                warn!(opctx.log, "failed to destroy source snapshot";
                    "vm" => %snapshot, "error" => %e);
            }
        }
        if let Err(e) = self.datastore().vm_destroy(&spec.vm.reference).await
        {
            warn!(opctx.log, "failed to destroy source VM";
                "vm" => %spec.vm.reference, "error" => %e);
        }
        for vtpm in &spec.vm.vtpms {
            if let Err(e) = self.datastore().vtpm_destroy(vtpm).await {
                warn!(opctx.log, "failed to destroy source VTPM";
                    "vtpm" => %vtpm, "error" => %e);
            }
        }
    }

    /// Unwinds a failed migration.  Every step is best-effort: the
    /// returned error — the in-flight one, unless a recorded mirror
    /// failure wins — is what the caller reports.
    async fn rollback(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
        records: &[MirrorRecord],
        error: Error,
    ) -> Error {
        warn!(opctx.log, "migration failed; rolling back";
            "vm" => %spec.vm.reference, "error" => %error);
        let dbg = opctx.dbg();

        // A failed memory migration can leave the source guest
        // suspended; a suspended guest with no suspend image is
        // unrecoverable, so shut it down cleanly instead.
        match self.vmm().vm_stat(&dbg, &spec.vm.uuid).await {
            Ok(GuestState::Suspended) => {
                if let Err(e) =
                    self.vmm().vm_shutdown(&dbg, &spec.vm.uuid).await
                {
                    warn!(opctx.log, "rollback: failed to shut down \
                        suspended source VM";
                        "vm_uuid" => %spec.vm.uuid, "error" => %e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(opctx.log, "rollback: failed to stat source VM";
                    "vm_uuid" => %spec.vm.uuid, "error" => %e);
            }
        }

        self.teardown_transfers(opctx, spec, records).await;

        if !spec.intra_cluster() {
            self.destroy_stale_destination_vms(opctx, spec).await;
        }

        // A recorded mirror failure explains the situation better than
        // whatever error it caused downstream.
        if let Ok(task) = self.datastore().task(&opctx.task).await {
            if let Some(uuid) = task.other_config.get(KEY_MIRROR_FAILED) {
                if let Ok(uuid) = uuid.parse::<Uuid>() {
                    if let Ok(Some(vdi)) =
                        self.datastore().vdi_by_uuid(&uuid).await
                    {
                        return Error::MirrorFailed { vdi };
                    }
                }
            }
        }

        error
    }

    /// Destroys any half-imported VM objects on the destination whose
    /// UUID matches the source VM or one of its snapshots.
    async fn destroy_stale_destination_vms(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
    ) {
        let mut uuids = vec![spec.vm.uuid];
        for snapshot in &spec.vm.snapshots {
            match self.datastore().vm(snapshot).await {
                Ok(snap) => uuids.push(snap.uuid),
                Err(e) => {
                    warn!(opctx.log, "rollback: failed to read snapshot";
                        "vm" => %snapshot, "error" => %e);
                }
            }
        }
        for uuid in uuids {
            match spec.destc.vm_by_uuid(&uuid).await {
                Ok(Some(stale)) => {
                    if let Err(e) = spec.destc.vm_destroy(&stale).await {
                        warn!(opctx.log,
                            "rollback: failed to destroy stale \
                             destination VM";
                            "vm_uuid" => %uuid, "error" => %e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(opctx.log,
                        "rollback: failed to look up destination VM";
                        "vm_uuid" => %uuid, "error" => %e);
                }
            }
        }
    }

    /// Intra-cluster live migration of memory only: the VM's storage
    /// stays where it is.
    pub async fn pool_migrate(
        &self,
        opctx: &OpContext,
        vm: VmRef,
        host: HostRef,
        options: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let parsed = MigrateOptions::parse(true, options)?;
        let vmr = self.datastore().vm(&vm).await?;
        if vmr.power_state != PowerState::Running {
            return Err(Error::VmBadPowerState {
                vm,
                expected: PowerState::Running,
                actual: vmr.power_state,
            });
        }
        let pool = self.datastore().pool().await?;
        let source_host = self
            .datastore()
            .host(&vmr.resident_on.unwrap_or(pool.coordinator))
            .await?;
        let dest_host = self.datastore().host(&host).await?;
        if !dest_host.enabled {
            return Err(Error::HostDisabled { host });
        }
        if dest_host.platform_version < source_host.platform_version {
            return Err(Error::VmHostIncompatibleVersionMigrate {
                host,
                vm,
            });
        }
        if !parsed.force
            && !cpu_features_subset(
                &vmr.last_boot_cpu_flags,
                &dest_host.cpu_features,
            )
        {
            return Err(Error::VmIncompatibleWithThisHost {
                vm,
                host,
                reason: "the VM's CPU featureset is not a subset of the \
                         host's"
                    .to_owned(),
            });
        }

        // Memory stream endpoint: the named network's IP on the
        // destination if requested, the management IP otherwise.
        let stream_ip = match options.get(OPTION_NETWORK) {
            Some(name) => {
                let network = self
                    .datastore()
                    .network_by_name(name)
                    .await?
                    .ok_or_else(|| {
                        Error::invalid_value(
                            OPTION_NETWORK,
                            format!("no network named {:?}", name),
                        )
                    })?;
                self.datastore()
                    .pifs_for_host(&host)
                    .await?
                    .into_iter()
                    .find(|p| p.network == network)
                    .and_then(|p| p.ip)
                    .ok_or(Error::HostHasNoManagementIp { host })?
            }
            None => dest_host.address.clone(),
        };
        let xenops_url = format!("http://{}/services/xenops", stream_ip);

        // Identity locator map: every disk stays put.
        let mut vdi_locators = BTreeMap::new();
        for vbd in self.vm_disk_vbds(&vmr).await? {
            let Some(vdi_ref) = vbd.vdi else { continue };
            let vdi = self.datastore().vdi(&vdi_ref).await?;
            let sr_uuid = self.datastore().sr(&vdi.sr).await?.uuid;
            let locator = format!("{}/{}", sr_uuid, vdi.location);
            vdi_locators.insert(locator.clone(), locator);
        }
        let mut bridge_map = BTreeMap::new();
        for vif in self.vm_vifs(&vmr).await? {
            let network = self.datastore().network(&vif.network).await?;
            bridge_map.insert(vif.device, network.bridge);
        }
        let mut vgpu_records = Vec::new();
        for vgpu_ref in &vmr.vgpus {
            let vgpu = self.datastore().vgpu(vgpu_ref).await?;
            let pgpu = match vgpu.scheduled_to_be_resident_on {
                Some(p) => Some(self.datastore().pgpu(&p).await?),
                None => None,
            };
            vgpu_records.push((vgpu, pgpu));
        }
        let vgpu_map =
            maps::vgpu_pci_pairs(&vgpu_records).map_err(|_| {
                maps::vgpu_mapping_failed(
                    vm,
                    &source_host.name_label,
                    &dest_host.name_label,
                )
            })?;
        let compress = match parsed.compress {
            Some(compress) => compress,
            None => pool.migration_compression,
        };

        if let Err(e) = self.vmm().events_suppress(&vmr.uuid).await {
            return Err(Error::internal_error(&format!(
                "failed to suppress events for {}: {}",
                vmr.uuid, e
            )));
        }
        opctx.check_cancelled(self.datastore()).await?;
        self.datastore()
            .task_set_cancellable(&opctx.task, false)
            .await?;
        let result = self
            .migrate_memory(
                opctx,
                &vmr.uuid,
                &vdi_locators,
                &bridge_map,
                &vgpu_map,
                &xenops_url,
                compress,
                false,
            )
            .await;
        match result {
            Ok(()) => {
                self.resume_events(opctx, &vmr.uuid).await;
                if let Err(e) =
                    self.pool_migrate_complete(opctx, vm, host).await
                {
                    warn!(opctx.log,
                        "post-migration completion failed";
                        "vm" => %vm, "error" => %e);
                }
                Ok(())
            }
            Err(error) => {
                let dbg = opctx.dbg();
                if let Ok(GuestState::Suspended) =
                    self.vmm().vm_stat(&dbg, &vmr.uuid).await
                {
                    if let Err(e) =
                        self.vmm().vm_shutdown(&dbg, &vmr.uuid).await
                    {
                        warn!(opctx.log, "rollback: failed to shut down \
                            suspended source VM";
                            "vm_uuid" => %vmr.uuid, "error" => %e);
                    }
                }
                self.resume_events(opctx, &vmr.uuid).await;
                Err(error)
            }
        }
    }

    /// Destination-side post-handler: records the new resident host and
    /// clears vGPU function addresses that the move made stale.
    pub async fn pool_migrate_complete(
        &self,
        opctx: &OpContext,
        vm: VmRef,
        host: HostRef,
    ) -> Result<(), Error> {
        let vmr = self.datastore().vm(&vm).await?;
        self.datastore().vm_set_resident_on(&vm, Some(host)).await?;
        for vgpu_ref in &vmr.vgpus {
            let vgpu = self.datastore().vgpu(vgpu_ref).await?;
            if vgpu.pci_address.is_none() {
                continue;
            }
            let stale = match vgpu.scheduled_to_be_resident_on {
                Some(pgpu) => {
                    self.datastore().pgpu(&pgpu).await?.host != host
                }
                None => true,
            };
            if stale {
                self.datastore().vgpu_clear_pci(vgpu_ref).await?;
            }
        }
        info!(opctx.log, "migration completion recorded";
            "vm" => %vm, "host" => %host);
        Ok(())
    }

    /// Moves a single disk of a running VM to another SR, returning the
    /// new VDI reference.  Implemented as a same-host storage migration
    /// of just that disk.
    pub async fn vdi_pool_migrate(
        &self,
        opctx: &OpContext,
        vdi: VdiRef,
        sr: SrRef,
        options: &BTreeMap<String, String>,
    ) -> Result<VdiRef, Error> {
        let vm_ref = match options.get(OPTION_INTERNAL_VM) {
            Some(value) => value.parse::<VmRef>().map_err(|_| {
                Error::invalid_value(OPTION_INTERNAL_VM, "not a VM reference")
            })?,
            None => {
                let vbds = self.datastore().vbds_for_vdi(&vdi).await?;
                let mut owner = None;
                for vbd in &vbds {
                    let vm = self.datastore().vm(&vbd.vm).await?;
                    if !vm.is_a_snapshot {
                        owner = Some(vm.reference);
                        break;
                    }
                }
                owner.ok_or_else(|| {
                    Error::not_allowed("VDI is not attached to any VM")
                })?
            }
        };

        let vmr = self.datastore().vm(&vm_ref).await?;
        if vmr.power_state != PowerState::Running {
            return Err(Error::VmBadPowerState {
                vm: vm_ref,
                expected: PowerState::Running,
                actual: vmr.power_state,
            });
        }
        let host_ref = vmr.resident_on.ok_or_else(|| {
            Error::internal_error("running VM has no resident host")
        })?;
        let host = self.datastore().host(&host_ref).await?;
        let pool = self.datastore().pool().await?;
        let coordinator = self.datastore().host(&pool.coordinator).await?;

        // Remember which VBDs will be remapped so the new reference can
        // be read back afterwards.
        let vbd_refs: Vec<_> = self
            .datastore()
            .vbds_for_vdi(&vdi)
            .await?
            .into_iter()
            .map(|vbd| vbd.reference)
            .collect();

        let dest: BTreeMap<String, String> = [
            (
                dest::KEY_MASTER.to_owned(),
                format!("http://{}/jsonrpc", coordinator.address),
            ),
            (
                dest::KEY_XENOPS.to_owned(),
                format!("http://{}/services/xenops", host.address),
            ),
            (
                dest::KEY_SM.to_owned(),
                format!("http://{}/services/SM", host.address),
            ),
            (dest::KEY_HOST.to_owned(), host_ref.to_string()),
            (
                dest::KEY_SESSION.to_owned(),
                format!("internal:{}", opctx.task),
            ),
        ]
        .into_iter()
        .collect();

        // Every other attached disk maps to where it already lives.
        let mut vdi_map = BTreeMap::from([(vdi, sr)]);
        for vbd in self.vm_disk_vbds(&vmr).await? {
            let Some(other) = vbd.vdi else { continue };
            if !vdi_map.contains_key(&other) {
                let current = self.datastore().vdi(&other).await?.sr;
                vdi_map.insert(other, current);
            }
        }
        self.migrate_send(
            opctx,
            vm_ref,
            &dest,
            true,
            vdi_map,
            BTreeMap::new(),
            BTreeMap::new(),
            options,
        )
        .await?;

        for vbd_ref in vbd_refs {
            let vbd = self.datastore().vbd(&vbd_ref).await?;
            if let Some(new_vdi) = vbd.vdi {
                if new_vdi != vdi {
                    return Ok(new_vdi);
                }
            }
        }
        Err(Error::internal_error(
            "disk migration finished but no remapped VBD was found",
        ))
    }
}
