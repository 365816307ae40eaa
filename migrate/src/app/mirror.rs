// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Planning and driving of per-VDI disk transfers.
//!
//! Leaf disks of a live VM are mirrored (kept in sync while the guest
//! keeps running); snapshots and suspend images are copied once.
//! Transfers start sequentially in ascending (size, snapshot-time)
//! order so small, old disks land first and can serve as parent bases
//! for later incremental transfers; the storage agent is free to run
//! the actual data movement concurrently.

use super::{maps, Engine, MigrationSpec};
use crate::context::OpContext;
use crate::db::model::{VbdKind, VbdMode, VdiRecord};
use crate::storage::{
    Datapath, MirrorId, StorageError, StorageTaskId, StorageTaskResult,
};
use apiary_common::api::{Error, PowerState, SrRef, VdiRef, VmRef};
use sha2::{Digest, Sha256};
use slog::{debug, info, warn};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A VDI's `other_config` key that lets an operator force one-shot copy
/// for a disk that would otherwise be live-mirrored.
const KEY_MIRROR_ALLOWED: &str = "mirror";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum VdiClass {
    Leaf { mirror: bool },
    Snapshot,
    Suspend,
}

/// One planned disk transfer.
pub(crate) struct VdiTransfer {
    pub vdi: VdiRecord,
    pub class: VdiClass,
    pub dest_sr: SrRef,
    /// Base name the datapath handle is derived from.
    pub dp_base: String,
}

pub(crate) struct Plan {
    pub transfers: Vec<VdiTransfer>,
    pub total_size: u64,
}

/// The outcome of one completed transfer, consumed by the memory
/// migration driver and the finalizer, and torn down on rollback.
#[derive(Clone, Debug)]
pub struct MirrorRecord {
    pub mirrored: bool,
    /// Set for the shared-SR short circuit: the "remote" VDI is the
    /// very same image and must survive rollback.
    pub pre_existing: bool,
    pub datapath: Option<Datapath>,
    pub mirror_id: Option<MirrorId>,
    pub local_sr: SrRef,
    pub local_vdi: VdiRef,
    pub local_location: String,
    pub remote_sr: SrRef,
    pub remote_vdi: VdiRef,
    pub remote_location: String,
    pub local_xenops_locator: String,
    pub remote_xenops_locator: String,
}

/// Running total used to fold per-task progress into the cluster task.
pub(crate) struct ProgressAggregator {
    total: u64,
    done: u64,
}

impl ProgressAggregator {
    pub fn new(total: u64) -> ProgressAggregator {
        ProgressAggregator { total, done: 0 }
    }

    /// Overall fraction with `frac` of a `size`-byte transfer complete.
    pub fn scaled(&self, size: u64, frac: f64) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.done as f64 + frac * size as f64) / self.total as f64
    }

    pub fn complete(&mut self, size: u64) {
        self.done += size;
    }
}

/// Synthetic domain-slice identifier routing storage-agent calls for a
/// guest that may not exist on the destination yet.  Deterministic so
/// both ends derive the same identity.
pub(crate) fn domain_slice(prefix: &str, vm: &VmRef, vdi: &VdiRef) -> String {
    let mut hasher = Sha256::new();
    hasher.update(vm.0.as_bytes());
    hasher.update(vdi.0.as_bytes());
    let digest = hasher.finalize();
    let hex: String =
        digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("{}{}", prefix, hex)
}

fn transfer_order(t: &VdiTransfer) -> (u64, chrono::DateTime<chrono::Utc>) {
    (t.vdi.virtual_size, t.vdi.snapshot_time)
}

impl Engine {
    /// Classifies every disk that has to move and fixes the transfer
    /// order.  Also applies the CD-eject precondition, which must land
    /// before any mirror starts.
    pub(crate) async fn plan_transfers(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
    ) -> Result<Plan, Error> {
        let dest_pool = spec.destc.pool().await?;
        let dest_host = spec.destc.host(&spec.dest.host).await?;

        let mut transfers = Vec::new();
        let mut seen: BTreeSet<VdiRef> = BTreeSet::new();

        // Leaf disks of the VM itself.
        for vbd in self.vm_disk_vbds(&spec.vm).await? {
            let Some(vdi_ref) = vbd.vdi else { continue };
            if !seen.insert(vdi_ref) {
                continue;
            }
            let vdi = self.datastore().vdi(&vdi_ref).await?;
            let mirror = spec.vm.power_state.has_domain()
                && vbd.mode == VbdMode::Rw
                && vdi.other_config.get(KEY_MIRROR_ALLOWED).map(String::as_str)
                    != Some("false");
            let dest_sr = *spec
                .vdi_map
                .get(&vdi_ref)
                .ok_or(Error::VdiNotInMap { vdi: vdi_ref })?;
            // A disk staying on its own SR within the cluster has
            // nothing to transfer.
            if spec.intra_cluster() && dest_sr == vdi.sr {
                continue;
            }
            transfers.push(VdiTransfer {
                dp_base: format!("vbd/{}/{}", spec.vm.uuid, vbd.device),
                vdi,
                class: VdiClass::Leaf { mirror },
                dest_sr,
            });
        }

        // Snapshot disks, and suspend images of the VM or any suspended
        // snapshot.
        let mut suspend_vdis: Vec<VdiRef> = Vec::new();
        if let Some(vdi) = spec.vm.suspend_vdi {
            if spec.vm.power_state == PowerState::Suspended {
                suspend_vdis.push(vdi);
            }
        }
        for snap_ref in &spec.vm.snapshots {
            let snap = self.datastore().vm(snap_ref).await?;
            for vbd in self.vm_disk_vbds(&snap).await? {
                let Some(vdi_ref) = vbd.vdi else { continue };
                if !seen.insert(vdi_ref) {
                    continue;
                }
                let vdi = self.datastore().vdi(&vdi_ref).await?;
                let dest_sr = maps::infer_vdi_sr(
                    &dest_pool,
                    &dest_host,
                    &vdi,
                    false,
                    &spec.vdi_map,
                )?;
                if spec.intra_cluster() && dest_sr == vdi.sr {
                    continue;
                }
                transfers.push(VdiTransfer {
                    dp_base: format!("vdi/{}", vdi.uuid),
                    vdi,
                    class: VdiClass::Snapshot,
                    dest_sr,
                });
            }
            if let Some(vdi) = snap.suspend_vdi {
                if snap.power_state == PowerState::Suspended {
                    suspend_vdis.push(vdi);
                }
            }
        }

        for vdi_ref in suspend_vdis {
            if !seen.insert(vdi_ref) {
                continue;
            }
            let vdi = self.datastore().vdi(&vdi_ref).await?;
            // The suspend image must be readable from where we run.
            let pbds = self.datastore().pbds_for_sr(&vdi.sr).await?;
            let reachable = pbds.iter().any(|p| {
                p.host == spec.source_host.reference && p.currently_attached
            });
            if !reachable {
                return Err(Error::SuspendImageNotAccessible {
                    vdi: vdi_ref,
                });
            }
            // Within a cluster a suspend image on storage the
            // destination can already reach needs no transfer at all.
            if spec.intra_cluster()
                && pbds.iter().any(|p| p.host == spec.dest.host)
            {
                debug!(opctx.log, "suspend VDI already reachable; skipping";
                    "vdi" => %vdi_ref);
                continue;
            }
            let dest_sr = maps::infer_vdi_sr(
                &dest_pool,
                &dest_host,
                &vdi,
                true,
                &spec.vdi_map,
            )?;
            transfers.push(VdiTransfer {
                dp_base: format!("vdi/{}", vdi.uuid),
                vdi,
                class: VdiClass::Suspend,
                dest_sr,
            });
        }

        self.eject_cds(opctx, spec).await?;

        transfers.sort_by_key(transfer_order);
        let total_size = transfers.iter().map(|t| t.vdi.virtual_size).sum();
        Ok(Plan { transfers, total_size })
    }

    /// Ejects CDs that would otherwise pin their SR across the move.
    /// Only live, non-snapshot VMs have drives the guest could be
    /// holding open; suspended VMs keep their media.
    async fn eject_cds(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
    ) -> Result<(), Error> {
        if spec.vm.is_a_snapshot
            || spec.vm.power_state != PowerState::Running
        {
            return Ok(());
        }
        for vbd_ref in &spec.vm.vbds {
            let vbd = self.datastore().vbd(vbd_ref).await?;
            if vbd.kind != VbdKind::Cd || vbd.empty {
                continue;
            }
            let Some(vdi_ref) = vbd.vdi else { continue };
            let vdi = self.datastore().vdi(&vdi_ref).await?;
            match spec.vdi_map.get(&vdi_ref) {
                Some(&target) if target != vdi.sr => {
                    info!(opctx.log, "ejecting CD before migration";
                        "vbd" => %vbd.reference, "vdi" => %vdi_ref);
                    self.datastore().vbd_eject(&vbd.reference).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Runs every planned transfer, sequentially, and then replicates
    /// snapshot-chain metadata.  Completed transfers accumulate in
    /// `records` as they finish so that the caller can tear them down
    /// if a later one fails.
    pub(crate) async fn run_transfers(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
        plan: &Plan,
        records: &mut Vec<MirrorRecord>,
    ) -> Result<(), Error> {
        let mut progress = ProgressAggregator::new(plan.total_size);
        for transfer in &plan.transfers {
            opctx.check_cancelled(self.datastore()).await?;
            let record = self
                .transfer_one(opctx, spec, transfer, &mut progress)
                .await?;
            records.push(record);
        }
        self.replicate_snapshot_chains(opctx, spec, plan, records).await?;
        Ok(())
    }

    async fn transfer_one(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
        transfer: &VdiTransfer,
        progress: &mut ProgressAggregator,
    ) -> Result<MirrorRecord, Error> {
        let vdi = &transfer.vdi;
        let source_sr_uuid = self.datastore().sr(&vdi.sr).await?.uuid;
        let dest_sr_uuid = spec.destc.sr(&transfer.dest_sr).await?.uuid;

        self.ensure_dest_sr_plugged(spec, &transfer.dest_sr).await?;

        if self.tuning().shared_sr_mode && source_sr_uuid == dest_sr_uuid {
            // Both ends see the same storage; nothing to move as long
            // as the image is already visible over there.
            return match spec.destc.vdi_by_uuid(&vdi.uuid).await? {
                Some(remote) => {
                    let remote_record = spec.destc.vdi(&remote).await?;
                    Ok(MirrorRecord {
                        mirrored: false,
                        pre_existing: true,
                        datapath: None,
                        mirror_id: None,
                        local_sr: vdi.sr,
                        local_vdi: vdi.reference,
                        local_location: vdi.location.clone(),
                        remote_sr: transfer.dest_sr,
                        remote_vdi: remote,
                        remote_location: remote_record.location.clone(),
                        local_xenops_locator: format!(
                            "{}/{}",
                            source_sr_uuid, vdi.location
                        ),
                        remote_xenops_locator: format!(
                            "{}/{}",
                            dest_sr_uuid, remote_record.location
                        ),
                    })
                }
                None => Err(Error::VdiLocationMissing {
                    sr: transfer.dest_sr,
                    location: vdi.location.clone(),
                }),
            };
        }

        let mirror = matches!(transfer.class, VdiClass::Leaf { mirror: true });
        let prefix = if mirror { "mirror" } else { "copy" };
        let dp = Datapath(format!("{}_{}", prefix, transfer.dp_base));
        let mirror_id = mirror
            .then(|| MirrorId::derive(&source_sr_uuid, &vdi.location));

        info!(opctx.log, "starting disk transfer";
            "vdi" => %vdi.reference,
            "class" => ?transfer.class,
            "dest_sr" => %transfer.dest_sr,
            "datapath" => %dp,
        );

        let result = self
            .drive_transfer(
                opctx,
                spec,
                transfer,
                mirror,
                &dp,
                mirror_id.as_ref(),
                &source_sr_uuid,
                &dest_sr_uuid,
                progress,
            )
            .await;
        if result.is_err() {
            self.abort_transfer(opctx, spec, transfer, &dp, mirror_id.as_ref())
                .await;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_transfer(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
        transfer: &VdiTransfer,
        mirror: bool,
        dp: &Datapath,
        mirror_id: Option<&MirrorId>,
        source_sr_uuid: &Uuid,
        dest_sr_uuid: &Uuid,
        progress: &mut ProgressAggregator,
    ) -> Result<MirrorRecord, Error> {
        let dbg = opctx.dbg();
        let vdi = &transfer.vdi;
        let sm_url = spec.dest.sm_url.to_string();
        let verify_dest = spec.intra_cluster();
        let mirror_vm =
            domain_slice("MIR", &spec.vm.reference, &vdi.reference);
        let copy_vm = domain_slice("CP", &spec.vm.reference, &vdi.reference);

        let task = if mirror {
            // Always attach read-write, whatever the VBD says: if the
            // guest stops and restarts mid-migration the datapath must
            // not wedge against its own read-only attachment.
            self.storage()
                .vdi_attach(&dbg, dp, source_sr_uuid, &vdi.location, true)
                .await?;
            self.storage()
                .vdi_activate(&dbg, dp, source_sr_uuid, &vdi.location)
                .await?;
            let id = mirror_id.expect("mirror transfers carry a mirror id");
            self.register_mirror(id.clone());
            self.storage()
                .mirror_start(
                    &dbg,
                    source_sr_uuid,
                    &vdi.location,
                    dp,
                    &mirror_vm,
                    &copy_vm,
                    &sm_url,
                    dest_sr_uuid,
                    verify_dest,
                )
                .await?
        } else {
            self.storage()
                .data_copy(
                    &dbg,
                    source_sr_uuid,
                    &vdi.location,
                    &copy_vm,
                    &sm_url,
                    dest_sr_uuid,
                    verify_dest,
                )
                .await?
        };

        let result = self
            .wait_storage_task(opctx, &task, progress, vdi.virtual_size)
            .await?;

        let remote_location = if mirror {
            let id = mirror_id.expect("mirror transfers carry a mirror id");
            self.storage().mirror_stat(&dbg, id).await?.dest_vdi
        } else {
            match result {
                StorageTaskResult::Vdi { location } => location,
                other => {
                    return Err(Error::internal_error(&format!(
                        "copy task returned unexpected result {:?}",
                        other
                    )));
                }
            }
        };

        // Make the new image visible to the destination plane, then pin
        // down its reference.
        spec.destc.sr_scan(&transfer.dest_sr).await?;
        let found = spec
            .destc
            .vdis_in_sr_by_location(&transfer.dest_sr, &remote_location)
            .await?;
        let remote_vdi = match found.as_slice() {
            [] => {
                return Err(Error::VdiLocationMissing {
                    sr: transfer.dest_sr,
                    location: remote_location,
                });
            }
            [one] => *one,
            _ => {
                return Err(Error::LocationNotUnique {
                    sr: transfer.dest_sr,
                    location: remote_location,
                });
            }
        };

        debug!(opctx.log, "disk transfer complete";
            "vdi" => %vdi.reference, "remote_vdi" => %remote_vdi);

        Ok(MirrorRecord {
            mirrored: mirror,
            pre_existing: false,
            datapath: mirror.then(|| dp.clone()),
            mirror_id: mirror_id.cloned(),
            local_sr: vdi.sr,
            local_vdi: vdi.reference,
            local_location: vdi.location.clone(),
            remote_sr: transfer.dest_sr,
            remote_vdi,
            remote_location: remote_location.clone(),
            local_xenops_locator: format!(
                "{}/{}",
                source_sr_uuid, vdi.location
            ),
            remote_xenops_locator: format!(
                "{}/{}",
                dest_sr_uuid, remote_location
            ),
        })
    }

    /// Best-effort cleanup for a transfer that died partway: stop the
    /// mirror, release the datapath, and destroy whatever landed on the
    /// destination.  Failures here are logged and swallowed — the
    /// original error is what the caller reports.
    async fn abort_transfer(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
        transfer: &VdiTransfer,
        dp: &Datapath,
        mirror_id: Option<&MirrorId>,
    ) {
        let dbg = opctx.dbg();
        let mut remote_location = None;
        if let Some(id) = mirror_id {
            match self.storage().mirror_stat(&dbg, id).await {
                Ok(stat) => remote_location = Some(stat.dest_vdi),
                Err(e) => {
                    debug!(opctx.log, "no mirror state to clean up";
                        "mirror" => %id, "error" => %e);
                }
            }
            if let Err(e) = self.storage().mirror_stop(&dbg, id).await {
                warn!(opctx.log, "failed to stop mirror during cleanup";
                    "mirror" => %id, "error" => %e);
            }
            self.unregister_mirror(id);
            if let Err(e) =
                self.storage().dp_destroy(&dbg, dp, false).await
            {
                warn!(opctx.log, "failed to destroy datapath during cleanup";
                    "datapath" => %dp, "error" => %e);
            }
        }
        if let Some(location) = remote_location {
            if let Err(e) = self
                .destroy_remote_location(spec, &transfer.dest_sr, &location)
                .await
            {
                warn!(opctx.log, "failed to destroy remote VDI during cleanup";
                    "location" => location, "error" => %e);
            }
        }
    }

    async fn destroy_remote_location(
        &self,
        spec: &MigrationSpec,
        sr: &SrRef,
        location: &str,
    ) -> Result<(), Error> {
        spec.destc.sr_scan(sr).await?;
        for vdi in
            spec.destc.vdis_in_sr_by_location(sr, location).await?
        {
            spec.destc.vdi_destroy(&vdi).await?;
        }
        Ok(())
    }

    /// Tears down transfer state on rollback: mirrors stopped,
    /// datapaths released, destination VDIs destroyed.  Everything is
    /// best-effort; the triggering error stays authoritative.
    pub(crate) async fn teardown_transfers(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
        records: &[MirrorRecord],
    ) {
        let dbg = opctx.dbg();
        for record in records {
            if record.pre_existing {
                continue;
            }
            if let Some(id) = &record.mirror_id {
                if let Err(e) = self.storage().mirror_stop(&dbg, id).await {
                    warn!(opctx.log, "rollback: failed to stop mirror";
                        "mirror" => %id, "error" => %e);
                }
                self.unregister_mirror(id);
            }
            if let Some(dp) = &record.datapath {
                if let Err(e) =
                    self.storage().dp_destroy(&dbg, dp, false).await
                {
                    warn!(opctx.log, "rollback: failed to destroy datapath";
                        "datapath" => %dp, "error" => %e);
                }
            }
            if let Err(e) = spec.destc.vdi_destroy(&record.remote_vdi).await
            {
                warn!(opctx.log, "rollback: failed to destroy remote VDI";
                    "vdi" => %record.remote_vdi, "error" => %e);
            }
        }
    }

    /// Waits for a storage-agent task, folding its progress into the
    /// cluster task scaled by this VDI's share of the total bytes.
    async fn wait_storage_task(
        &self,
        opctx: &OpContext,
        task: &StorageTaskId,
        progress: &mut ProgressAggregator,
        size: u64,
    ) -> Result<StorageTaskResult, Error> {
        let dbg = opctx.dbg();
        loop {
            let status = self.storage().task_stat(&dbg, task).await?;
            match status.result {
                None => {
                    let overall = progress.scaled(size, status.progress);
                    if let Err(e) = self
                        .datastore()
                        .task_set_progress(&opctx.task, overall)
                        .await
                    {
                        warn!(opctx.log, "failed to update task progress";
                            "error" => %e);
                    }
                    tokio::time::sleep(self.tuning().task_poll_interval())
                        .await;
                }
                Some(done) => {
                    if let Err(e) =
                        self.storage().task_destroy(&dbg, task).await
                    {
                        warn!(opctx.log, "failed to destroy storage task";
                            "task" => %task, "error" => %e);
                    }
                    let result = done?;
                    progress.complete(size);
                    let overall = progress.scaled(0, 0.0);
                    if let Err(e) = self
                        .datastore()
                        .task_set_progress(&opctx.task, overall)
                        .await
                    {
                        warn!(opctx.log, "failed to update task progress";
                            "error" => %e);
                    }
                    return Ok(result);
                }
            }
        }
    }

    /// Plugs the destination SR's PBDs on the receiving host and the
    /// destination coordinator, where detached and the host is enabled.
    async fn ensure_dest_sr_plugged(
        &self,
        spec: &MigrationSpec,
        sr: &SrRef,
    ) -> Result<(), Error> {
        let dest_pool = spec.destc.pool().await?;
        let pbds = spec.destc.pbds_for_sr(sr).await?;
        let mut targets = vec![spec.dest.host];
        if dest_pool.coordinator != spec.dest.host {
            targets.push(dest_pool.coordinator);
        }
        for target in targets {
            let host = spec.destc.host(&target).await?;
            if let Some(pbd) = pbds.iter().find(|p| p.host == target) {
                if !pbd.currently_attached && host.enabled {
                    spec.destc.pbd_plug(&pbd.reference).await?;
                }
            }
        }
        Ok(())
    }

    /// After all transfers, tells the destination storage how the
    /// copied snapshots chain off each copied leaf.  A destination
    /// whose backend predates the operation is tolerated.
    async fn replicate_snapshot_chains(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
        plan: &Plan,
        records: &[MirrorRecord],
    ) -> Result<(), Error> {
        let dbg = opctx.dbg();
        let sm_url = spec.dest.sm_url.to_string();
        for (leaf, leaf_record) in
            plan.transfers.iter().zip(records.iter())
        {
            if !matches!(leaf.class, VdiClass::Leaf { .. }) {
                continue;
            }
            let pairs: Vec<(String, String)> = plan
                .transfers
                .iter()
                .zip(records.iter())
                .filter(|(t, _)| {
                    t.class == VdiClass::Snapshot
                        && t.vdi.snapshot_of == Some(leaf.vdi.reference)
                })
                .map(|(t, r)| {
                    (t.vdi.location.clone(), r.remote_location.clone())
                })
                .collect();
            if pairs.is_empty() {
                continue;
            }
            let source_sr_uuid =
                self.datastore().sr(&leaf.vdi.sr).await?.uuid;
            let dest_sr_uuid =
                spec.destc.sr(&leaf_record.remote_sr).await?.uuid;
            let outcome = self
                .storage()
                .update_snapshot_info_src(
                    &dbg,
                    &source_sr_uuid,
                    &leaf.vdi.location,
                    &sm_url,
                    &dest_sr_uuid,
                    &leaf_record.remote_location,
                    &pairs,
                    spec.intra_cluster(),
                )
                .await;
            match outcome {
                Ok(()) => {}
                Err(StorageError::Unimplemented { operation }) => {
                    warn!(opctx.log,
                        "destination does not support snapshot chain \
                         replication; continuing";
                        "leaf" => %leaf.vdi.reference,
                        "operation" => operation,
                    );
                }
                Err(StorageError::Backend { code, .. })
                    if code == "Unknown_error" =>
                {
                    warn!(opctx.log,
                        "destination does not support snapshot chain \
                         replication; continuing";
                        "leaf" => %leaf.vdi.reference,
                        "code" => code,
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::model::OnBoot;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn vdi(size: u64, ts: i64) -> VdiRecord {
        VdiRecord {
            reference: VdiRef::generate(),
            uuid: Uuid::new_v4(),
            sr: SrRef::generate(),
            location: format!("loc-{}", size),
            virtual_size: size,
            on_boot: OnBoot::Persist,
            cbt_enabled: false,
            sm_config: BTreeMap::new(),
            snapshot_of: None,
            snapshot_time: Utc.timestamp_opt(ts, 0).unwrap(),
            other_config: BTreeMap::new(),
        }
    }

    fn transfer(size: u64, ts: i64) -> VdiTransfer {
        VdiTransfer {
            vdi: vdi(size, ts),
            class: VdiClass::Snapshot,
            dest_sr: SrRef::generate(),
            dp_base: "vdi/x".to_owned(),
        }
    }

    #[test]
    fn transfers_order_by_size_then_snapshot_time() {
        let mut transfers =
            vec![transfer(10, 5), transfer(4, 9), transfer(10, 1)];
        transfers.sort_by_key(transfer_order);
        let sizes: Vec<u64> =
            transfers.iter().map(|t| t.vdi.virtual_size).collect();
        assert_eq!(sizes, vec![4, 10, 10]);
        // Equal sizes tie-break on snapshot time, oldest first.
        assert!(
            transfers[1].vdi.snapshot_time < transfers[2].vdi.snapshot_time
        );
    }

    #[test]
    fn progress_scales_by_share_of_total_bytes() {
        let mut progress = ProgressAggregator::new(100);
        assert_eq!(progress.scaled(40, 0.5), 0.2);
        progress.complete(40);
        assert_eq!(progress.scaled(60, 0.0), 0.4);
        progress.complete(60);
        assert_eq!(progress.scaled(0, 0.0), 1.0);
        // Degenerate plan with nothing to move reads as done.
        assert_eq!(ProgressAggregator::new(0).scaled(0, 0.0), 1.0);
    }

    #[test]
    fn domain_slices_are_deterministic_and_distinct() {
        let vm = VmRef::generate();
        let vdi = VdiRef::generate();
        let a = domain_slice("MIR", &vm, &vdi);
        let b = domain_slice("MIR", &vm, &vdi);
        assert_eq!(a, b);
        assert!(a.starts_with("MIR"));
        let c = domain_slice("CP", &vm, &vdi);
        assert!(c.starts_with("CP"));
        assert_ne!(a[3..], c[2..]);
    }
}
