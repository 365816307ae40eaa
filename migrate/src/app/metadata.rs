// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cross-cluster transfer of the VM's object graph.
//!
//! The destination reconstructs the VM from an export of its metadata.
//! To let the import connect devices to objects that already exist over
//! there (the freshly mirrored VDIs, the mapped networks and GPU
//! groups), we stamp remote-reference hints into the source objects'
//! other-config just before the export and remove them again no matter
//! how the call ends — the hints are migration plumbing, not durable
//! state.

use super::{Engine, MigrationSpec};
use crate::cluster::{MetadataImportArgs, MetadataImportOutcome};
use crate::context::OpContext;
use crate::app::mirror::MirrorRecord;
use apiary_common::api::{Error, NetworkRef, PowerState, VifRef, VmRef};
use slog::{info, warn};
use std::collections::BTreeMap;

pub(crate) const KEY_VDI_MAP: &str = "storage_migrate_vdi_map";
pub(crate) const KEY_VIF_MAP: &str = "storage_migrate_vif_map";
pub(crate) const KEY_VGPU_MAP: &str = "storage_migrate_vgpu_map";

impl Engine {
    fn import_args(spec: &MigrationSpec, dry_run: bool) -> MetadataImportArgs {
        MetadataImportArgs {
            vm: spec.vm.reference,
            dry_run,
            live: spec.options.live,
            send_snapshots: !spec.options.copy,
            check_cpu: !spec.options.force
                && spec.vm.power_state != PowerState::Halted,
        }
    }

    /// Dry-run import used by feasibility checking; returns the
    /// destination's conflict list without mutating anything.
    pub(crate) async fn metadata_dry_run(
        &self,
        _opctx: &OpContext,
        spec: &MigrationSpec,
    ) -> Result<MetadataImportOutcome, Error> {
        spec.destc.import_metadata(&Self::import_args(spec, true)).await
    }

    /// Exports the VM's metadata to the destination cluster, annotated
    /// with remote-reference hints for every transferred VDI, every
    /// VIF, and every vGPU.  Returns the reference of the VM created on
    /// the destination.
    pub(crate) async fn metadata_transfer(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
        records: &[MirrorRecord],
        vif_map: &BTreeMap<VifRef, NetworkRef>,
    ) -> Result<VmRef, Error> {
        self.stamp_hints(opctx, spec, records, vif_map).await;
        let result = spec
            .destc
            .import_metadata(&Self::import_args(spec, false))
            .await;
        // The hints come off even when the import blew up; leaving them
        // behind would corrupt the next migration attempt.
        self.remove_hints(opctx, spec, records, vif_map).await;

        let outcome = result?;
        let vm = outcome.vm.ok_or_else(|| {
            Error::internal_error(
                "metadata import returned no destination VM",
            )
        })?;
        info!(opctx.log, "metadata transferred";
            "vm" => %spec.vm.reference, "dest_vm" => %vm);
        Ok(vm)
    }

    async fn stamp_hints(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
        records: &[MirrorRecord],
        vif_map: &BTreeMap<VifRef, NetworkRef>,
    ) {
        for record in records {
            if let Err(e) = self
                .datastore()
                .vdi_add_other_config(
                    &record.local_vdi,
                    KEY_VDI_MAP,
                    &record.remote_vdi.to_string(),
                )
                .await
            {
                warn!(opctx.log, "failed to stamp VDI hint";
                    "vdi" => %record.local_vdi, "error" => %e);
            }
        }
        for (vif, network) in vif_map {
            if let Err(e) = self
                .datastore()
                .vif_add_other_config(vif, KEY_VIF_MAP, &network.to_string())
                .await
            {
                warn!(opctx.log, "failed to stamp VIF hint";
                    "vif" => %vif, "error" => %e);
            }
        }
        for vgpu_ref in &spec.vm.vgpus {
            let group = match spec.vgpu_map.get(vgpu_ref) {
                Some(group) => *group,
                None => match self.datastore().vgpu(vgpu_ref).await {
                    Ok(vgpu) => vgpu.gpu_group,
                    Err(e) => {
                        warn!(opctx.log, "failed to stamp vGPU hint";
                            "vgpu" => %vgpu_ref, "error" => %e);
                        continue;
                    }
                },
            };
            if let Err(e) = self
                .datastore()
                .vgpu_add_other_config(
                    vgpu_ref,
                    KEY_VGPU_MAP,
                    &group.to_string(),
                )
                .await
            {
                warn!(opctx.log, "failed to stamp vGPU hint";
                    "vgpu" => %vgpu_ref, "error" => %e);
            }
        }
    }

    async fn remove_hints(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
        records: &[MirrorRecord],
        vif_map: &BTreeMap<VifRef, NetworkRef>,
    ) {
        for record in records {
            if let Err(e) = self
                .datastore()
                .vdi_remove_other_config(&record.local_vdi, KEY_VDI_MAP)
                .await
            {
                warn!(opctx.log, "failed to remove VDI hint";
                    "vdi" => %record.local_vdi, "error" => %e);
            }
        }
        for vif in vif_map.keys() {
            if let Err(e) = self
                .datastore()
                .vif_remove_other_config(vif, KEY_VIF_MAP)
                .await
            {
                warn!(opctx.log, "failed to remove VIF hint";
                    "vif" => %vif, "error" => %e);
            }
        }
        for vgpu_ref in &spec.vm.vgpus {
            if let Err(e) = self
                .datastore()
                .vgpu_remove_other_config(vgpu_ref, KEY_VGPU_MAP)
                .await
            {
                warn!(opctx.log, "failed to remove vGPU hint";
                    "vgpu" => %vgpu_ref, "error" => %e);
            }
        }
    }
}
