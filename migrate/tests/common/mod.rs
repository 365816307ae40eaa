// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared scenario plumbing for migration engine tests: builds
//! simulated clusters, VMs, and destination descriptors.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use apiary_common::api::{
    HostRef, NetworkRef, PbdRef, PlatformVersion, PowerState, SrRef,
    VbdRef, VdiRef, VifRef, VmRef,
};
use apiary_migrate::app::dest;
use apiary_migrate::db::model::{
    HostRecord, NetworkRecord, OnBoot, PbdRecord, PoolRecord, SrFeature,
    SrRecord, VbdKind, VbdMode, VbdRecord, VdiRecord, VifRecord, VmRecord,
};
use apiary_migrate::sim::{SimDatastore, SimWorld};
use chrono::{TimeZone, Utc};
use slog::{o, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// One populated simulated cluster: two enabled hosts sharing two
/// storage-motion-capable SRs, and one guest network.
pub struct TestCluster {
    pub ds: Arc<SimDatastore>,
    pub coordinator: HostRef,
    pub host2: HostRef,
    pub sr1: SrRef,
    pub sr2: SrRef,
    pub network: NetworkRef,
    pub coordinator_address: String,
    pub host2_address: String,
}

pub async fn populate_cluster(
    ds: &Arc<SimDatastore>,
    subnet: u8,
    platform_version: PlatformVersion,
) -> TestCluster {
    let coordinator = HostRef::generate();
    let host2 = HostRef::generate();
    let sr1 = SrRef::generate();
    let sr2 = SrRef::generate();
    let network = NetworkRef::generate();
    let coordinator_address = format!("10.{}.0.1", subnet);
    let host2_address = format!("10.{}.0.2", subnet);

    ds.set_pool(PoolRecord {
        coordinator,
        default_sr: Some(sr1),
        suspend_image_sr: None,
        ha_enabled: false,
        migration_compression: false,
        tls_verification_enabled: false,
        licensed_features: BTreeSet::from(["storage_motion".to_owned()]),
    })
    .await;

    for (host, address) in [
        (coordinator, coordinator_address.clone()),
        (host2, host2_address.clone()),
    ] {
        ds.insert_host(HostRecord {
            reference: host,
            uuid: Uuid::new_v4(),
            name_label: format!("host-{}", address),
            enabled: true,
            address,
            platform_version: platform_version.clone(),
            cpu_count: 32,
            cpu_features: vec![u64::MAX, u64::MAX],
            virtual_hardware_platform_versions: vec![0, 1, 2],
            suspend_image_sr: None,
        })
        .await;
    }

    let features = BTreeSet::from([
        SrFeature::VdiSnapshot,
        SrFeature::VdiMirror,
        SrFeature::VdiMirrorIn,
    ]);
    for sr in [sr1, sr2] {
        ds.insert_sr(SrRecord {
            reference: sr,
            uuid: Uuid::new_v4(),
            name_label: format!("sr-{}", sr.0),
            sr_type: "lvm".to_owned(),
            shared: false,
            features: features.clone(),
        })
        .await;
        for host in [coordinator, host2] {
            ds.insert_pbd(PbdRecord {
                reference: PbdRef::generate(),
                host,
                sr,
                currently_attached: true,
            })
            .await;
        }
    }

    ds.insert_network(NetworkRecord {
        reference: network,
        name_label: "guest-net".to_owned(),
        bridge: "xenbr0".to_owned(),
    })
    .await;

    TestCluster {
        ds: ds.clone(),
        coordinator,
        host2,
        sr1,
        sr2,
        network,
        coordinator_address,
        host2_address,
    }
}

pub struct VmFixture {
    pub vm: VmRef,
    pub vdis: Vec<VdiRef>,
    pub vbds: Vec<VbdRef>,
}

/// Creates a VM resident on `host` with `disks` data disks in `sr`.
pub async fn make_vm(
    cluster: &TestCluster,
    host: HostRef,
    sr: SrRef,
    power_state: PowerState,
    disks: usize,
) -> VmFixture {
    let vm = VmRef::generate();
    let mut vdis = Vec::new();
    let mut vbds = Vec::new();
    for i in 0..disks {
        let vdi = VdiRef::generate();
        cluster
            .ds
            .insert_vdi(VdiRecord {
                reference: vdi,
                uuid: Uuid::new_v4(),
                sr,
                location: format!("disk-{}-{}", vm.0, i),
                virtual_size: (8 + i as u64) << 30,
                on_boot: OnBoot::Persist,
                cbt_enabled: false,
                sm_config: BTreeMap::new(),
                snapshot_of: None,
                snapshot_time: Utc.timestamp_opt(1_000_000 + i as i64, 0)
                    .unwrap(),
                other_config: BTreeMap::new(),
            })
            .await;
        let vbd = VbdRef::generate();
        cluster
            .ds
            .insert_vbd(VbdRecord {
                reference: vbd,
                vm,
                vdi: Some(vdi),
                device: format!("xvd{}", (b'a' + i as u8) as char),
                mode: VbdMode::Rw,
                kind: VbdKind::Disk,
                empty: false,
                currently_attached: power_state.has_domain(),
            })
            .await;
        vdis.push(vdi);
        vbds.push(vbd);
    }

    cluster
        .ds
        .insert_vm(VmRecord {
            reference: vm,
            uuid: Uuid::new_v4(),
            name_label: "migrating-vm".to_owned(),
            power_state,
            is_a_snapshot: false,
            snapshot_of: None,
            snapshots: Vec::new(),
            resident_on: if power_state == PowerState::Halted {
                None
            } else {
                Some(host)
            },
            vbds: vbds.clone(),
            vifs: Vec::new(),
            vgpus: Vec::new(),
            vtpms: Vec::new(),
            suspend_vdi: None,
            suspend_sr: None,
            ha_always_run: false,
            vcpus: 2,
            last_boot_cpu_flags: vec![0xff, 0x0f],
            hardware_platform_version: 1,
            has_legacy_hardware: false,
            blobs: BTreeMap::new(),
            other_config: BTreeMap::new(),
        })
        .await;

    VmFixture { vm, vdis, vbds }
}

pub async fn add_vif(
    cluster: &TestCluster,
    vm: VmRef,
    device: &str,
    mac: &str,
) -> VifRef {
    let vif = VifRef::generate();
    cluster
        .ds
        .insert_vif(VifRecord {
            reference: vif,
            vm,
            device: device.to_owned(),
            mac: mac.to_owned(),
            network: cluster.network,
            other_config: BTreeMap::new(),
        })
        .await;
    cluster
        .ds
        .update_vm(&vm, |record| record.vifs.push(vif))
        .await
        .unwrap();
    vif
}

/// The handshake blob a destination cluster would hand the caller.
pub fn descriptor(
    dest_host: HostRef,
    master_ip: &str,
    host_ip: &str,
) -> BTreeMap<String, String> {
    [
        (dest::KEY_MASTER, format!("http://{}/jsonrpc", master_ip)),
        (dest::KEY_XENOPS, format!("http://{}/services/xenops", host_ip)),
        (dest::KEY_SM, format!("http://{}/services/SM", host_ip)),
        (dest::KEY_HOST, dest_host.to_string()),
        (dest::KEY_SESSION, "OpaqueRef:test-session".to_owned()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v))
    .collect()
}

/// A source world plus a populated cross-cluster destination, wired.
pub struct CrossWorld {
    pub world: SimWorld,
    pub src: TestCluster,
    pub dst: TestCluster,
    pub dest_map: BTreeMap<String, String>,
}

pub async fn cross_world() -> CrossWorld {
    let version = PlatformVersion(vec![3, 2, 1]);
    cross_world_with_versions(version.clone(), version).await
}

/// Like [`cross_world`], with distinct platform versions on the two
/// clusters' hosts.
pub async fn cross_world_with_versions(
    src_version: PlatformVersion,
    dst_version: PlatformVersion,
) -> CrossWorld {
    let world = SimWorld::new(test_logger());
    let src = populate_cluster(&world.datastore, 0, src_version).await;
    let dst_ds = Arc::new(SimDatastore::new());
    let dst = populate_cluster(&dst_ds, 1, dst_version).await;
    let xenops_url =
        format!("http://{}/services/xenops", dst.host2_address);
    world
        .wire_remote_destination(dst_ds.clone(), dst.host2, &xenops_url)
        .await;
    let dest_map = descriptor(
        dst.host2,
        &dst.coordinator_address,
        &dst.host2_address,
    );
    CrossWorld { world, src, dst, dest_map }
}

/// A source world whose second host is wired as an intra-cluster
/// destination.
pub struct IntraWorld {
    pub world: SimWorld,
    pub src: TestCluster,
    pub dest_map: BTreeMap<String, String>,
}

pub async fn intra_world() -> IntraWorld {
    let world = SimWorld::new(test_logger());
    let src = populate_cluster(
        &world.datastore,
        0,
        PlatformVersion(vec![3, 2, 1]),
    )
    .await;
    world.wire_local_destination(src.host2).await;
    let dest_map = descriptor(
        src.host2,
        &src.coordinator_address,
        &src.host2_address,
    );
    IntraWorld { world, src, dest_map }
}

pub fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
