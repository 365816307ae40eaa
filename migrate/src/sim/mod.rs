// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated collaborators for the migration engine.
//!
//! Everything the engine talks to — cluster database, storage agent,
//! hypervisor-control agent, destination management planes — has an
//! in-memory stand-in here.  [`SimWorld`] bundles one simulated source
//! cluster with an engine wired to it; tests add destination clusters
//! and script agent behavior, the development server
//! ([`development`]) builds a small demo topology.

pub mod cluster;
pub mod datastore;
pub mod storage;
pub mod vmm;

pub use cluster::{SimCluster, SimResolver};
pub use datastore::SimDatastore;
pub use storage::SimStorageAgent;
pub use vmm::SimVmmAgent;

use crate::app::Engine;
use crate::config::Tuning;
use crate::context::OpContext;
use crate::db::model::{
    HostRecord, PbdRecord, PoolRecord, SrFeature, SrRecord, VbdKind,
    VbdMode, VbdRecord, VdiRecord, VmRecord,
};
use crate::db::Datastore;
use apiary_common::api::{
    Error, HostRef, PbdRef, PlatformVersion, PowerState, SrRef, VbdRef,
    VdiRef, VmRef,
};
use chrono::Utc;
use slog::{o, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

/// One simulated source cluster with an engine attached.
pub struct SimWorld {
    pub log: Logger,
    pub datastore: Arc<SimDatastore>,
    pub storage: Arc<SimStorageAgent>,
    pub vmm: Arc<SimVmmAgent>,
    pub resolver: Arc<SimResolver>,
    pub engine: Arc<Engine>,
}

impl SimWorld {
    /// A world tuned for tests: storage tasks are polled every
    /// millisecond.
    pub fn new(log: Logger) -> SimWorld {
        let tuning = Tuning { task_poll_interval_ms: 1, ..Tuning::default() };
        SimWorld::with_tuning(log, tuning)
    }

    pub fn with_tuning(log: Logger, tuning: Tuning) -> SimWorld {
        let datastore = Arc::new(SimDatastore::new());
        let storage = SimStorageAgent::new(datastore.clone());
        let vmm = SimVmmAgent::new(datastore.clone());
        let resolver = SimResolver::new();
        let engine = Arc::new(Engine::new(
            log.new(o!("component" => "migration-engine")),
            datastore.clone(),
            storage.clone(),
            vmm.clone(),
            resolver.clone(),
            tuning,
        ));
        SimWorld { log, datastore, storage, vmm, resolver, engine }
    }

    /// Wires an intra-cluster destination: the plane fronts the source
    /// cluster's own datastore.
    pub async fn wire_local_destination(
        &self,
        host: HostRef,
    ) -> Arc<SimCluster> {
        let plane = SimCluster::new(
            self.datastore.clone(),
            self.datastore.clone(),
            self.storage.clone(),
        );
        self.resolver.register(host, plane.clone()).await;
        plane
    }

    /// Wires a cross-cluster destination fronting `remote`, reachable
    /// through `xenops_url` for the memory stream.
    pub async fn wire_remote_destination(
        &self,
        remote: Arc<SimDatastore>,
        host: HostRef,
        xenops_url: &str,
    ) -> Arc<SimCluster> {
        let plane = SimCluster::new(
            remote.clone(),
            self.datastore.clone(),
            self.storage.clone(),
        );
        self.resolver.register(host, plane.clone()).await;
        self.vmm.register_destination(xenops_url, remote).await;
        plane
    }

    /// A fresh operation context running under a new cluster task.
    pub async fn opctx(&self, label: &str) -> Result<OpContext, Error> {
        let task = self.datastore.task_create(label).await?;
        Ok(OpContext::new(self.log.new(o!("task" => task.to_string())), task))
    }
}

/// A small demo topology for the development server: one pool, two
/// hosts, a storage-motion-capable SR on each, and one running VM.
pub async fn development(log: Logger) -> SimWorld {
    let world = SimWorld::with_tuning(log, Tuning::default());
    let ds = &world.datastore;

    let host_a = HostRef::generate();
    let host_b = HostRef::generate();
    let sr_a = SrRef::generate();
    let sr_b = SrRef::generate();

    ds.set_pool(PoolRecord {
        coordinator: host_a,
        default_sr: Some(sr_a),
        suspend_image_sr: None,
        ha_enabled: false,
        migration_compression: false,
        tls_verification_enabled: false,
        licensed_features: BTreeSet::from(["storage_motion".to_owned()]),
    })
    .await;

    for (host, name, address) in
        [(host_a, "dev-a", "10.1.0.1"), (host_b, "dev-b", "10.1.0.2")]
    {
        ds.insert_host(HostRecord {
            reference: host,
            uuid: Uuid::new_v4(),
            name_label: name.to_owned(),
            enabled: true,
            address: address.to_owned(),
            platform_version: PlatformVersion(vec![3, 2, 1]),
            cpu_count: 16,
            cpu_features: vec![u64::MAX],
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
    for (sr, name) in [(sr_a, "local-a"), (sr_b, "local-b")] {
        ds.insert_sr(SrRecord {
            reference: sr,
            uuid: Uuid::new_v4(),
            name_label: name.to_owned(),
            sr_type: "lvm".to_owned(),
            shared: false,
            features: features.clone(),
        })
        .await;
    }
    for (host, sr) in [(host_a, sr_a), (host_b, sr_b)] {
        ds.insert_pbd(PbdRecord {
            reference: PbdRef::generate(),
            host,
            sr,
            currently_attached: true,
        })
        .await;
    }

    let vm = VmRef::generate();
    let vdi = VdiRef::generate();
    let vbd = VbdRef::generate();
    ds.insert_vdi(VdiRecord {
        reference: vdi,
        uuid: Uuid::new_v4(),
        sr: sr_a,
        location: "dev-disk-0".to_owned(),
        virtual_size: 8 << 30,
        on_boot: crate::db::model::OnBoot::Persist,
        cbt_enabled: false,
        sm_config: BTreeMap::new(),
        snapshot_of: None,
        snapshot_time: Utc::now(),
        other_config: BTreeMap::new(),
    })
    .await;
    ds.insert_vbd(VbdRecord {
        reference: vbd,
        vm,
        vdi: Some(vdi),
        device: "xvda".to_owned(),
        mode: VbdMode::Rw,
        kind: VbdKind::Disk,
        empty: false,
        currently_attached: true,
    })
    .await;
    ds.insert_vm(VmRecord {
        reference: vm,
        uuid: Uuid::new_v4(),
        name_label: "dev-vm".to_owned(),
        power_state: PowerState::Running,
        is_a_snapshot: false,
        snapshot_of: None,
        snapshots: Vec::new(),
        resident_on: Some(host_a),
        vbds: vec![vbd],
        vifs: Vec::new(),
        vgpus: Vec::new(),
        vtpms: Vec::new(),
        suspend_vdi: None,
        suspend_sr: None,
        ha_always_run: false,
        vcpus: 2,
        last_boot_cpu_flags: vec![0],
        hardware_platform_version: 0,
        has_legacy_hardware: false,
        blobs: BTreeMap::new(),
        other_config: BTreeMap::new(),
    })
    .await;

    world.wire_local_destination(host_b).await;
    world
}
