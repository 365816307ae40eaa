// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Feasibility checking.
//!
//! Every precondition is evaluated here, before any state mutates
//! anywhere, and each failure carries the specific error code clients
//! match on.  Checking is pure: running it twice against unchanged state
//! yields the same verdict, which is what makes the public
//! `assert_can_migrate` a meaningful dry run.

use super::{maps, Engine, MigrationSpec, FEATURE_STORAGE_MOTION};
use crate::context::OpContext;
use crate::db::model::SrFeature;
use apiary_common::api::{Error, PowerState, VdiRef};
use apiary_common::backoff;
use slog::debug;
use std::collections::BTreeSet;

/// True when every featureset bit the VM booted with is also present on
/// the candidate host.
pub(crate) fn cpu_features_subset(vm: &[u64], host: &[u64]) -> bool {
    vm.iter().enumerate().all(|(i, word)| {
        word & !host.get(i).copied().unwrap_or(0) == 0
    })
}

impl Engine {
    /// Asserts that the migration described by `spec` can proceed.
    pub(crate) async fn check_feasibility(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
    ) -> Result<(), Error> {
        let pool = self.datastore().pool().await?;
        if !pool.licensed_features.contains(FEATURE_STORAGE_MOTION) {
            return Err(Error::LicenseRestriction {
                feature: FEATURE_STORAGE_MOTION.to_owned(),
            });
        }

        if spec.vm.has_legacy_hardware {
            return Err(Error::not_allowed(format!(
                "VM {} has legacy hardware that cannot be migrated",
                spec.vm.uuid
            )));
        }

        // A copy that never leaves the cluster is just a clone; the
        // dedicated operations handle that without tying up a mirror.
        if spec.options.copy && spec.intra_cluster() {
            return Err(Error::not_allowed(
                "copying within a cluster is not supported; \
                 use VM.copy or VM.clone",
            ));
        }

        if !spec.intra_cluster() {
            self.ping_destination(spec).await?;
        }

        // Every attached disk must have an explicit destination.
        let vbds = self.vm_disk_vbds(&spec.vm).await?;
        let mut vdis: BTreeSet<VdiRef> = BTreeSet::new();
        for vbd in &vbds {
            if let Some(vdi) = vbd.vdi {
                if !spec.vdi_map.contains_key(&vdi) {
                    return Err(Error::VdiNotInMap { vdi });
                }
                vdis.insert(vdi);
            }
        }
        vdis.extend(spec.vdi_map.keys().copied());

        for vdi_ref in &vdis {
            let vdi = self.datastore().vdi(vdi_ref).await?;
            if vdi.cbt_enabled {
                return Err(Error::VdiCbtEnabled { vdi: vdi.reference });
            }
            if vdi.on_boot == crate::db::model::OnBoot::Reset {
                return Err(Error::VdiOnBootModeIncompatibleWithOperation {
                    vdi: vdi.reference,
                });
            }
            let Some(&dest_sr) = spec.vdi_map.get(vdi_ref) else {
                continue;
            };
            // VDIs staying on their current SR are exempt from the
            // remapping checks.
            if dest_sr == vdi.sr && spec.intra_cluster() {
                continue;
            }
            if vdi.is_encrypted() {
                return Err(Error::VdiIsEncrypted { vdi: vdi.reference });
            }
            let source_sr = self.datastore().sr(&vdi.sr).await?;
            if !source_sr.features.contains(&SrFeature::VdiSnapshot)
                || !source_sr.features.contains(&SrFeature::VdiMirror)
            {
                return Err(Error::SrDoesNotSupportMigration {
                    sr: source_sr.reference,
                });
            }
            let dest_sr_record = spec.destc.sr(&dest_sr).await?;
            if !dest_sr_record.features.contains(&SrFeature::VdiSnapshot)
                || !dest_sr_record.features.contains(&SrFeature::VdiMirrorIn)
            {
                return Err(Error::SrDoesNotSupportMigration { sr: dest_sr });
            }
        }

        let dest_host = spec.destc.host(&spec.dest.host).await?;

        if spec.intra_cluster() {
            // Within a cluster the destination may be newer than the
            // source, never older.
            if dest_host.platform_version < spec.source_host.platform_version
            {
                return Err(Error::VmHostIncompatibleVersionMigrate {
                    host: spec.dest.host,
                    vm: spec.vm.reference,
                });
            }
            // All VIFs stay on their current networks within a cluster.
            if !spec.vif_map.is_empty() {
                return Err(Error::not_allowed(
                    "VIF mappings are not allowed within a cluster",
                ));
            }
            if !spec.options.force
                && !cpu_features_subset(
                    &spec.vm.last_boot_cpu_flags,
                    &dest_host.cpu_features,
                )
            {
                return Err(Error::VmIncompatibleWithThisHost {
                    vm: spec.vm.reference,
                    host: dest_host.reference,
                    reason: "the VM's CPU featureset is not a subset of \
                             the host's"
                        .to_owned(),
                });
            }
        } else {
            // Across clusters the two sides compare platform versions
            // with no common upgrade coordinator, so the ordering must
            // be identical rather than merely non-decreasing.
            if dest_host.platform_version != spec.source_host.platform_version
            {
                return Err(Error::VmHostIncompatibleVersionMigrate {
                    host: spec.dest.host,
                    vm: spec.vm.reference,
                });
            }
            if !dest_host.enabled {
                return Err(Error::HostDisabled { host: dest_host.reference });
            }
            if dest_host.cpu_count < spec.vm.vcpus {
                return Err(Error::VmIncompatibleWithThisHost {
                    vm: spec.vm.reference,
                    host: dest_host.reference,
                    reason: "not enough physical CPUs".to_owned(),
                });
            }
            if !dest_host
                .virtual_hardware_platform_versions
                .contains(&spec.vm.hardware_platform_version)
            {
                return Err(Error::VmIncompatibleWithThisHost {
                    vm: spec.vm.reference,
                    host: dest_host.reference,
                    reason: format!(
                        "hardware platform version {} is not supported",
                        spec.vm.hardware_platform_version
                    ),
                });
            }
            if spec.options.copy
                && !spec.options.force
                && spec.vm.power_state != PowerState::Halted
            {
                return Err(Error::VmBadPowerState {
                    vm: spec.vm.reference,
                    expected: PowerState::Halted,
                    actual: spec.vm.power_state,
                });
            }
            // Every VIF must resolve, by explicit entry or MAC match.
            let vifs = self.vm_vifs(&spec.vm).await?;
            maps::complete_vif_map(&vifs, &spec.vif_map)?;

            let outcome = self.metadata_dry_run(opctx, spec).await?;
            if !outcome.conflicts.is_empty() {
                return Err(Error::not_allowed(format!(
                    "metadata import would conflict: {}",
                    outcome.conflicts.join("; ")
                )));
            }
        }

        debug!(opctx.log, "feasibility check passed";
            "vm" => %spec.vm.reference,
            "intra_cluster" => spec.intra_cluster(),
        );
        Ok(())
    }

    /// Sender-side feasibility: everything above, plus proof that each
    /// vGPU has somewhere compatible to land.
    pub(crate) async fn check_feasibility_sender(
        &self,
        opctx: &OpContext,
        spec: &MigrationSpec,
    ) -> Result<(), Error> {
        self.check_feasibility(opctx, spec).await?;
        for vgpu_ref in &spec.vm.vgpus {
            let vgpu = self.datastore().vgpu(vgpu_ref).await?;
            let group = spec
                .vgpu_map
                .get(vgpu_ref)
                .copied()
                .unwrap_or(vgpu.gpu_group);
            let group = spec.destc.gpu_group(&group).await?;
            if !group.supported_vgpu_types.contains(&vgpu.vgpu_type) {
                return Err(Error::VmIncompatibleWithThisHost {
                    vm: spec.vm.reference,
                    host: spec.dest.host,
                    reason: format!(
                        "no destination pGPU supports vGPU type {}",
                        vgpu.vgpu_type
                    ),
                });
            }
        }
        Ok(())
    }

    /// Confirms the destination management plane answers, retrying
    /// briefly to ride out transient network blips.
    async fn ping_destination(
        &self,
        spec: &MigrationSpec,
    ) -> Result<(), Error> {
        let destc = &spec.destc;
        backoff::retry(backoff::retry_policy_remote_ping(), || async {
            destc.pool().await.map_err(backoff::BackoffError::transient)
        })
        .await
        .map_err(|_| Error::CannotContactHost {
            url: spec.dest.master_url.to_string(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn featureset_subset() {
        assert!(cpu_features_subset(&[0b1010], &[0b1110]));
        assert!(!cpu_features_subset(&[0b1011], &[0b1110]));
        // A missing host word only passes if the VM word is empty.
        assert!(cpu_features_subset(&[0b1010, 0], &[0b1010]));
        assert!(!cpu_features_subset(&[0b1010, 1], &[0b1010]));
        assert!(cpu_features_subset(&[], &[]));
    }
}
