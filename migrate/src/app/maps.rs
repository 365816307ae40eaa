// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Completion of partial device maps.
//!
//! Callers rarely spell out a full VDI→SR, VIF→network, and vGPU→PCI
//! mapping; this module fills the gaps with the documented defaults and
//! inference rules.  Everything here is pure over records already read
//! from a datastore.

use crate::db::model::{
    HostRecord, PgpuRecord, PoolRecord, VdiRecord, VgpuRecord, VifRecord,
};
use apiary_common::api::{Error, NetworkRef, SrRef, VdiRef, VifRef, VmRef};
use std::collections::BTreeMap;

/// Map-key prefix for the SR-IOV virtual function of a vGPU device.
pub const VGPU_VF_PREFIX: &str = "vf:";

/// Completes a VIF→network map.
///
/// Explicit entries win.  An unmapped VIF inherits the network of a
/// mapped VIF with the same MAC address (the caller has already told us
/// where that interface belongs); otherwise resolution fails.
pub fn complete_vif_map(
    vifs: &[VifRecord],
    explicit: &BTreeMap<VifRef, NetworkRef>,
) -> Result<BTreeMap<VifRef, NetworkRef>, Error> {
    let mut complete = BTreeMap::new();
    for vif in vifs {
        if let Some(network) = explicit.get(&vif.reference) {
            complete.insert(vif.reference, *network);
            continue;
        }
        let inherited = vifs.iter().find_map(|other| {
            if other.reference != vif.reference && other.mac == vif.mac {
                explicit.get(&other.reference).copied()
            } else {
                None
            }
        });
        match inherited {
            Some(network) => {
                complete.insert(vif.reference, network);
            }
            None => return Err(Error::VifNotInMap { vif: vif.reference }),
        }
    }
    Ok(complete)
}

/// Infers the destination SR for a snapshot or suspend VDI absent from
/// the caller-supplied map.
///
/// In order: an explicit entry; the mapping of the VDI this one is a
/// snapshot of; for suspend images, the destination's dedicated
/// suspend-image SRs (pool first, then host); finally the destination
/// pool's default SR.
pub fn infer_vdi_sr(
    dest_pool: &PoolRecord,
    dest_host: &HostRecord,
    vdi: &VdiRecord,
    is_suspend: bool,
    explicit: &BTreeMap<VdiRef, SrRef>,
) -> Result<SrRef, Error> {
    if let Some(sr) = explicit.get(&vdi.reference) {
        return Ok(*sr);
    }
    if let Some(parent) = &vdi.snapshot_of {
        if let Some(sr) = explicit.get(parent) {
            return Ok(*sr);
        }
    }
    if is_suspend {
        if let Some(sr) = dest_pool.suspend_image_sr {
            return Ok(sr);
        }
        if let Some(sr) = dest_host.suspend_image_sr {
            return Ok(sr);
        }
    }
    dest_pool
        .default_sr
        .ok_or(Error::VdiNotInMap { vdi: vdi.reference })
}

/// Marker for a vGPU whose physical placement could not be resolved.
/// The usual cause is the guest changing power state mid-migration and
/// losing its scheduled pGPU.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VgpuMappingError;

/// Derives the vGPU device → PCI address map from scheduled placements.
///
/// Each vGPU contributes its scheduled pGPU's physical-function address
/// under the device name, plus a `vf:`-prefixed entry when the vGPU has
/// a dedicated SR-IOV virtual function.  Any unresolvable vGPU aborts
/// the whole map.
pub fn vgpu_pci_pairs(
    vgpus: &[(VgpuRecord, Option<PgpuRecord>)],
) -> Result<BTreeMap<String, String>, VgpuMappingError> {
    let mut map = BTreeMap::new();
    for (vgpu, pgpu) in vgpus {
        let pgpu = pgpu.as_ref().ok_or(VgpuMappingError)?;
        map.insert(vgpu.device.clone(), pgpu.pci_address.clone());
        if let Some(vf) = &vgpu.pci_address {
            map.insert(
                format!("{}{}", VGPU_VF_PREFIX, vgpu.device),
                vf.clone(),
            );
        }
    }
    Ok(map)
}

/// The cluster-visible rendering of [`VgpuMappingError`].
pub fn vgpu_mapping_failed(
    vm: VmRef,
    source: &str,
    destination: &str,
) -> Error {
    Error::VmMigrateFailed {
        vm,
        source_host: source.to_owned(),
        destination: destination.to_owned(),
        message: "changed power state during migration".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_common::api::{GpuGroupRef, HostRef, PgpuRef, VgpuRef};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn vif(mac: &str) -> VifRecord {
        VifRecord {
            reference: VifRef::generate(),
            vm: VmRef::generate(),
            device: "0".to_owned(),
            mac: mac.to_owned(),
            network: NetworkRef::generate(),
            other_config: BTreeMap::new(),
        }
    }

    #[test]
    fn vif_inherits_network_by_mac() {
        let a = vif("aa:bb:cc:00:00:01");
        let b = vif("aa:bb:cc:00:00:01");
        let target = NetworkRef::generate();
        let explicit = BTreeMap::from([(a.reference, target)]);
        let complete =
            complete_vif_map(&[a.clone(), b.clone()], &explicit).unwrap();
        assert_eq!(complete[&a.reference], target);
        assert_eq!(complete[&b.reference], target);
    }

    #[test]
    fn unmapped_vif_with_unique_mac_fails() {
        let a = vif("aa:bb:cc:00:00:01");
        let b = vif("aa:bb:cc:00:00:02");
        let explicit = BTreeMap::from([(a.reference, NetworkRef::generate())]);
        let err = complete_vif_map(&[a, b.clone()], &explicit).unwrap_err();
        assert_eq!(err, Error::VifNotInMap { vif: b.reference });
    }

    fn pool(
        suspend: Option<SrRef>,
        default: Option<SrRef>,
    ) -> PoolRecord {
        PoolRecord {
            coordinator: HostRef::generate(),
            default_sr: default,
            suspend_image_sr: suspend,
            ha_enabled: false,
            migration_compression: false,
            tls_verification_enabled: false,
            licensed_features: BTreeSet::new(),
        }
    }

    fn host(suspend: Option<SrRef>) -> HostRecord {
        HostRecord {
            reference: HostRef::generate(),
            uuid: Uuid::new_v4(),
            name_label: "host".to_owned(),
            enabled: true,
            address: "10.0.0.1".to_owned(),
            platform_version: Default::default(),
            cpu_count: 8,
            cpu_features: vec![],
            virtual_hardware_platform_versions: vec![0],
            suspend_image_sr: suspend,
        }
    }

    fn vdi() -> VdiRecord {
        VdiRecord {
            reference: VdiRef::generate(),
            uuid: Uuid::new_v4(),
            sr: SrRef::generate(),
            location: "loc".to_owned(),
            virtual_size: 1,
            on_boot: crate::db::model::OnBoot::Persist,
            cbt_enabled: false,
            sm_config: BTreeMap::new(),
            snapshot_of: None,
            snapshot_time: Utc::now(),
            other_config: BTreeMap::new(),
        }
    }

    #[test]
    fn suspend_sr_fallback_chain() {
        let sr_pool = SrRef::generate();
        let sr_host = SrRef::generate();
        let sr_def = SrRef::generate();
        let image = vdi();
        let none = BTreeMap::new();

        // Pool suspend SR wins.
        let sr = infer_vdi_sr(
            &pool(Some(sr_pool), Some(sr_def)),
            &host(Some(sr_host)),
            &image,
            true,
            &none,
        )
        .unwrap();
        assert_eq!(sr, sr_pool);

        // Then the host's.
        let sr = infer_vdi_sr(
            &pool(None, Some(sr_def)),
            &host(Some(sr_host)),
            &image,
            true,
            &none,
        )
        .unwrap();
        assert_eq!(sr, sr_host);

        // Then the pool default.
        let sr = infer_vdi_sr(
            &pool(None, Some(sr_def)),
            &host(None),
            &image,
            true,
            &none,
        )
        .unwrap();
        assert_eq!(sr, sr_def);

        // Nothing left: the VDI is unmappable.
        let err =
            infer_vdi_sr(&pool(None, None), &host(None), &image, true, &none)
                .unwrap_err();
        assert_eq!(err, Error::VdiNotInMap { vdi: image.reference });
    }

    #[test]
    fn snapshot_inherits_parent_mapping() {
        let parent = vdi();
        let mut snap = vdi();
        snap.snapshot_of = Some(parent.reference);
        let target = SrRef::generate();
        let explicit = BTreeMap::from([(parent.reference, target)]);
        let sr = infer_vdi_sr(
            &pool(None, None),
            &host(None),
            &snap,
            false,
            &explicit,
        )
        .unwrap();
        assert_eq!(sr, target);
    }

    #[test]
    fn vgpu_map_includes_vf_entries_and_fails_closed() {
        let group = GpuGroupRef::generate();
        let pgpu = PgpuRecord {
            reference: PgpuRef::generate(),
            host: HostRef::generate(),
            gpu_group: group,
            pci_address: "0000:3b:00.0".to_owned(),
        };
        let vgpu = VgpuRecord {
            reference: VgpuRef::generate(),
            vm: VmRef::generate(),
            device: "0".to_owned(),
            gpu_group: group,
            vgpu_type: "t4-2q".to_owned(),
            scheduled_to_be_resident_on: Some(pgpu.reference),
            pci_address: Some("0000:3b:00.4".to_owned()),
            other_config: BTreeMap::new(),
        };
        let map =
            vgpu_pci_pairs(&[(vgpu.clone(), Some(pgpu.clone()))]).unwrap();
        assert_eq!(map["0"], "0000:3b:00.0");
        assert_eq!(map["vf:0"], "0000:3b:00.4");

        // A vGPU that lost its pGPU aborts the whole mapping.
        assert_eq!(
            vgpu_pci_pairs(&[(vgpu, None)]),
            Err(VgpuMappingError)
        );
    }
}
