// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated hypervisor-control agent.
//!
//! Memory migrations succeed instantly unless a test has scripted an
//! outcome; scripted faults are consumed one per attempt, which is how
//! the retry tests arrange "fail, fail, succeed".  Event suppression is
//! a per-VM depth counter tests can observe to prove the envelope was
//! balanced.

use super::datastore::SimDatastore;
use crate::vmm::{GuestState, VmmAgent, VmmError, VmmTaskId};
use apiary_common::api::PowerState;
use async_trait::async_trait;
use futures::lock::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

struct PendingMigrate {
    vm_uuid: Uuid,
    dest_url: String,
    outcome: Option<VmmError>,
}

#[derive(Default)]
struct Inner {
    destinations: BTreeMap<String, Arc<SimDatastore>>,
    outcomes: VecDeque<VmmError>,
    pending: BTreeMap<String, PendingMigrate>,
    suppressed: BTreeMap<Uuid, i64>,
    migrate_calls: u32,
    next_task: u64,
    shutdowns: Vec<Uuid>,
    metadata_deleted: Vec<Uuid>,
    networks_detached: Vec<Uuid>,
}

pub struct SimVmmAgent {
    source: Arc<SimDatastore>,
    inner: Mutex<Inner>,
}

impl SimVmmAgent {
    pub fn new(source: Arc<SimDatastore>) -> Arc<SimVmmAgent> {
        Arc::new(SimVmmAgent {
            source,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Registers the datastore reached through a xenops URL, so a
    /// successful migrate can flip power states on the receiving side.
    pub async fn register_destination(
        &self,
        url: &str,
        datastore: Arc<SimDatastore>,
    ) {
        self.inner
            .lock()
            .await
            .destinations
            .insert(url.to_owned(), datastore);
    }

    /// Scripts the outcome of the next `vm_migrate` attempt.
    pub async fn push_outcome(&self, error: VmmError) {
        self.inner.lock().await.outcomes.push_back(error);
    }

    pub async fn migrate_calls(&self) -> u32 {
        self.inner.lock().await.migrate_calls
    }

    pub async fn suppression_depth(&self, vm_uuid: &Uuid) -> i64 {
        self.inner
            .lock()
            .await
            .suppressed
            .get(vm_uuid)
            .copied()
            .unwrap_or(0)
    }

    pub async fn shutdowns(&self) -> Vec<Uuid> {
        self.inner.lock().await.shutdowns.clone()
    }

    pub async fn metadata_deleted(&self) -> Vec<Uuid> {
        self.inner.lock().await.metadata_deleted.clone()
    }

    pub async fn networks_detached(&self) -> Vec<Uuid> {
        self.inner.lock().await.networks_detached.clone()
    }

    fn to_guest_state(power: PowerState) -> GuestState {
        match power {
            PowerState::Halted => GuestState::Halted,
            PowerState::Paused => GuestState::Paused,
            PowerState::Running => GuestState::Running,
            PowerState::Suspended => GuestState::Suspended,
        }
    }
}

#[async_trait]
impl VmmAgent for SimVmmAgent {
    async fn vm_migrate(
        &self,
        _dbg: &str,
        vm_uuid: &Uuid,
        _vdi_map: &BTreeMap<String, String>,
        _vif_map: &BTreeMap<String, String>,
        _vgpu_map: &BTreeMap<String, String>,
        url: &str,
        _compress: bool,
        _verify_dest: bool,
    ) -> Result<VmmTaskId, VmmError> {
        let mut inner = self.inner.lock().await;
        inner.migrate_calls += 1;
        inner.next_task += 1;
        let id = format!("vmm-task-{}", inner.next_task);
        let outcome = inner.outcomes.pop_front();
        inner.pending.insert(
            id.clone(),
            PendingMigrate {
                vm_uuid: *vm_uuid,
                dest_url: url.to_owned(),
                outcome,
            },
        );
        Ok(VmmTaskId(id))
    }

    async fn task_wait(
        &self,
        _dbg: &str,
        task: &VmmTaskId,
    ) -> Result<(), VmmError> {
        let (pending, dest) = {
            let mut inner = self.inner.lock().await;
            let pending = inner.pending.remove(&task.0).ok_or_else(|| {
                VmmError::Internal {
                    message: format!("unknown task {}", task),
                }
            })?;
            let dest = inner.destinations.get(&pending.dest_url).cloned();
            (pending, dest)
        };
        if let Some(error) = pending.outcome {
            return Err(error);
        }
        // The guest switched over.  Across clusters the source domain
        // winds down and the destination copy starts running; within a
        // cluster the (single) record keeps its power state.
        if let Some(dest) = dest {
            if !Arc::ptr_eq(&dest, &self.source) {
                if let Some(vm) =
                    dest.vm_record_by_uuid(&pending.vm_uuid).await
                {
                    let _ = dest
                        .update_vm(&vm.reference, |record| {
                            record.power_state = PowerState::Running;
                        })
                        .await;
                }
                if let Some(vm) =
                    self.source.vm_record_by_uuid(&pending.vm_uuid).await
                {
                    let _ = self
                        .source
                        .update_vm(&vm.reference, |record| {
                            record.power_state = PowerState::Halted;
                        })
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn vm_stat(
        &self,
        _dbg: &str,
        vm_uuid: &Uuid,
    ) -> Result<GuestState, VmmError> {
        match self.source.vm_record_by_uuid(vm_uuid).await {
            Some(vm) => Ok(Self::to_guest_state(vm.power_state)),
            None => Err(VmmError::DoesNotExist { uuid: *vm_uuid }),
        }
    }

    async fn vm_shutdown(
        &self,
        _dbg: &str,
        vm_uuid: &Uuid,
    ) -> Result<(), VmmError> {
        self.inner.lock().await.shutdowns.push(*vm_uuid);
        if let Some(vm) = self.source.vm_record_by_uuid(vm_uuid).await {
            let _ = self
                .source
                .update_vm(&vm.reference, |record| {
                    record.power_state = PowerState::Halted;
                })
                .await;
        }
        Ok(())
    }

    async fn metadata_delete(
        &self,
        _dbg: &str,
        vm_uuid: &Uuid,
    ) -> Result<(), VmmError> {
        self.inner.lock().await.metadata_deleted.push(*vm_uuid);
        Ok(())
    }

    async fn events_suppress(&self, vm_uuid: &Uuid) -> Result<(), VmmError> {
        *self
            .inner
            .lock()
            .await
            .suppressed
            .entry(*vm_uuid)
            .or_insert(0) += 1;
        Ok(())
    }

    async fn events_resume(&self, vm_uuid: &Uuid) -> Result<(), VmmError> {
        *self
            .inner
            .lock()
            .await
            .suppressed
            .entry(*vm_uuid)
            .or_insert(0) -= 1;
        Ok(())
    }

    async fn network_detach(
        &self,
        _dbg: &str,
        vm_uuid: &Uuid,
    ) -> Result<(), VmmError> {
        self.inner.lock().await.networks_detached.push(*vm_uuid);
        Ok(())
    }
}
