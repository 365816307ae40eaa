// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The migration engine.
//!
//! [`Engine`] aggregates the collaborator interfaces (cluster database,
//! storage agent, hypervisor-control agent, destination-cluster
//! resolver) and exposes the cluster-facing migration operations.  Its
//! implementation is split across the modules in this directory, one
//! per phase of the protocol.

pub mod checks;
pub mod dest;
pub mod maps;
pub(crate) mod memory;
pub(crate) mod metadata;
pub mod migrate;
pub mod mirror;
pub mod throttle;

use crate::cluster::{ClusterApi, ClusterResolver};
use crate::config::Tuning;
use crate::db::model::{HostRecord, VbdKind, VbdRecord, VifRecord, VmRecord};
use crate::db::Datastore;
use crate::storage::{MirrorId, StorageAgent};
use crate::vmm::VmmAgent;
use apiary_common::api::options::{
    bool_option, bool_option_or, OPTION_COMPRESS, OPTION_COPY, OPTION_FORCE,
};
use apiary_common::api::{
    Error, GpuGroupRef, NetworkRef, SrRef, VdiRef, VgpuRef, VifRef,
};
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use throttle::MigrationThrottle;

/// License feature required for any storage migration.
pub const FEATURE_STORAGE_MOTION: &str = "storage_motion";

/// Parsed form of the option bag accepted by migration calls.
#[derive(Clone, Debug)]
pub struct MigrateOptions {
    pub live: bool,
    pub force: bool,
    pub copy: bool,
    /// `None` means "not specified": same-host moves then default to
    /// uncompressed, everything else follows pool policy.
    pub compress: Option<bool>,
}

impl MigrateOptions {
    pub fn parse(
        live: bool,
        options: &BTreeMap<String, String>,
    ) -> Result<MigrateOptions, Error> {
        Ok(MigrateOptions {
            live,
            force: bool_option_or(options, OPTION_FORCE, false)?,
            copy: bool_option_or(options, OPTION_COPY, false)?,
            compress: bool_option(options, OPTION_COMPRESS)?,
        })
    }
}

/// Everything resolved up front for one migration: the subject VM, both
/// ends, and the effective device maps.
pub(crate) struct MigrationSpec {
    pub vm: VmRecord,
    pub source_host: HostRecord,
    pub dest: dest::Destination,
    pub destc: Arc<dyn ClusterApi>,
    pub options: MigrateOptions,
    pub vdi_map: BTreeMap<VdiRef, SrRef>,
    pub vif_map: BTreeMap<VifRef, NetworkRef>,
    pub vgpu_map: BTreeMap<VgpuRef, GpuGroupRef>,
}

impl MigrationSpec {
    pub fn intra_cluster(&self) -> bool {
        self.dest.is_intra_cluster()
    }
}

pub struct Engine {
    log: Logger,
    datastore: Arc<dyn Datastore>,
    storage: Arc<dyn StorageAgent>,
    vmm: Arc<dyn VmmAgent>,
    clusters: Arc<dyn ClusterResolver>,
    throttle: MigrationThrottle,
    tuning: Tuning,
    /// Mirrors this node has registered with the storage agent and not
    /// yet released.
    active_mirrors: Mutex<BTreeSet<MirrorId>>,
}

impl Engine {
    pub fn new(
        log: Logger,
        datastore: Arc<dyn Datastore>,
        storage: Arc<dyn StorageAgent>,
        vmm: Arc<dyn VmmAgent>,
        clusters: Arc<dyn ClusterResolver>,
        tuning: Tuning,
    ) -> Engine {
        let throttle = MigrationThrottle::new(tuning.max_storage_migrations);
        Engine {
            log,
            datastore,
            storage,
            vmm,
            clusters,
            throttle,
            tuning,
            active_mirrors: Mutex::new(BTreeSet::new()),
        }
    }

    pub(crate) fn register_mirror(&self, id: MirrorId) {
        self.active_mirrors.lock().unwrap().insert(id);
    }

    pub(crate) fn unregister_mirror(&self, id: &MirrorId) {
        self.active_mirrors.lock().unwrap().remove(id);
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn datastore(&self) -> &dyn Datastore {
        &*self.datastore
    }

    pub(crate) fn storage(&self) -> &dyn StorageAgent {
        &*self.storage
    }

    pub(crate) fn vmm(&self) -> &dyn VmmAgent {
        &*self.vmm
    }

    pub(crate) fn clusters(&self) -> &dyn ClusterResolver {
        &*self.clusters
    }

    pub fn throttle(&self) -> &MigrationThrottle {
        &self.throttle
    }

    pub(crate) fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    /// The VM's non-empty disk VBDs (CD drives excluded).
    pub(crate) async fn vm_disk_vbds(
        &self,
        vm: &VmRecord,
    ) -> Result<Vec<VbdRecord>, Error> {
        let mut out = Vec::new();
        for vbd_ref in &vm.vbds {
            let vbd = self.datastore.vbd(vbd_ref).await?;
            if vbd.kind == VbdKind::Disk && !vbd.empty {
                out.push(vbd);
            }
        }
        Ok(out)
    }

    pub(crate) async fn vm_vifs(
        &self,
        vm: &VmRecord,
    ) -> Result<Vec<VifRecord>, Error> {
        let mut out = Vec::new();
        for vif_ref in &vm.vifs {
            out.push(self.datastore.vif(vif_ref).await?);
        }
        Ok(out)
    }
}
