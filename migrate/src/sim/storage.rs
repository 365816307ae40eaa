// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated storage agent.
//!
//! Copy and mirror tasks complete after a configurable number of status
//! polls, producing "volumes" that stay invisible to the destination
//! management plane until an SR scan picks them up — the same
//! write-then-scan split the real storage plane has.  Tests inject
//! failures keyed by source VDI location.

use super::datastore::SimDatastore;
use crate::storage::{
    Datapath, MirrorId, MirrorStat, StorageAgent, StorageError,
    StorageTaskId, StorageTaskResult, StorageTaskStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::lock::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TaskKind {
    Copy,
    Mirror,
}

struct SimTask {
    kind: TaskKind,
    src_sr: Uuid,
    src_location: String,
    dest_sr: Uuid,
    ticks_left: u32,
    ticks_total: u32,
    mirror_key: Option<String>,
    result: Option<Result<StorageTaskResult, StorageError>>,
}

struct SimMirror {
    source_vdi: String,
    dest_vdi: Option<String>,
    failed: bool,
    stopped: bool,
}

/// A volume written by a completed transfer, not yet surfaced by an SR
/// scan.
#[derive(Clone, Debug)]
pub struct SimVolume {
    pub sr_uuid: Uuid,
    pub location: String,
    pub uuid: Uuid,
    pub virtual_size: u64,
    pub snapshot_time: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    ticks_per_transfer: u32,
    next_id: u64,
    calls: u64,
    tasks: BTreeMap<String, SimTask>,
    mirrors: BTreeMap<String, SimMirror>,
    attached: BTreeSet<String>,
    volumes: Vec<SimVolume>,
    fail_locations: BTreeMap<String, StorageError>,
    snapshot_chain_calls: Vec<(String, usize)>,
    fail_snapshot_chain: Option<StorageError>,
}

pub struct SimStorageAgent {
    source: Arc<SimDatastore>,
    inner: Mutex<Inner>,
}

impl SimStorageAgent {
    pub fn new(source: Arc<SimDatastore>) -> Arc<SimStorageAgent> {
        Arc::new(SimStorageAgent {
            source,
            inner: Mutex::new(Inner {
                ticks_per_transfer: 2,
                ..Default::default()
            }),
        })
    }

    pub async fn set_ticks_per_transfer(&self, ticks: u32) {
        self.inner.lock().await.ticks_per_transfer = ticks.max(1);
    }

    /// Makes the transfer of the VDI at `location` fail with `error`
    /// once its task completes.
    pub async fn fail_transfer_of(&self, location: &str, error: StorageError) {
        self.inner
            .lock()
            .await
            .fail_locations
            .insert(location.to_owned(), error);
    }

    pub async fn fail_snapshot_chain_with(&self, error: StorageError) {
        self.inner.lock().await.fail_snapshot_chain = Some(error);
    }

    /// Total operations issued against the agent.
    pub async fn call_count(&self) -> u64 {
        self.inner.lock().await.calls
    }

    pub async fn attached_datapaths(&self) -> usize {
        self.inner.lock().await.attached.len()
    }

    pub async fn snapshot_chain_calls(&self) -> Vec<(String, usize)> {
        self.inner.lock().await.snapshot_chain_calls.clone()
    }

    /// Drains volumes written into `sr_uuid`; the destination plane's
    /// SR scan turns these into VDI records.
    pub async fn take_volumes(&self, sr_uuid: &Uuid) -> Vec<SimVolume> {
        let mut inner = self.inner.lock().await;
        let (matching, rest): (Vec<SimVolume>, Vec<SimVolume>) = inner
            .volumes
            .drain(..)
            .partition(|v| &v.sr_uuid == sr_uuid);
        inner.volumes = rest;
        matching
    }

    async fn start_task(
        &self,
        kind: TaskKind,
        src_sr: &Uuid,
        src_location: &str,
        dest_sr: &Uuid,
        mirror_key: Option<String>,
    ) -> StorageTaskId {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = format!("storage-task-{}", inner.next_id);
        let ticks = inner.ticks_per_transfer;
        inner.tasks.insert(
            id.clone(),
            SimTask {
                kind,
                src_sr: *src_sr,
                src_location: src_location.to_owned(),
                dest_sr: *dest_sr,
                ticks_left: ticks,
                ticks_total: ticks,
                mirror_key,
                result: None,
            },
        );
        StorageTaskId(id)
    }
}

#[async_trait]
impl StorageAgent for SimStorageAgent {
    async fn vdi_attach(
        &self,
        _dbg: &str,
        dp: &Datapath,
        _sr: &Uuid,
        _vdi: &str,
        _read_write: bool,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        inner.attached.insert(dp.0.clone());
        Ok(())
    }

    async fn vdi_activate(
        &self,
        _dbg: &str,
        dp: &Datapath,
        _sr: &Uuid,
        _vdi: &str,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        if !inner.attached.contains(&dp.0) {
            return Err(StorageError::Internal {
                message: format!("datapath {} not attached", dp),
            });
        }
        Ok(())
    }

    async fn dp_destroy(
        &self,
        _dbg: &str,
        dp: &Datapath,
        _allow_leak: bool,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        inner.attached.remove(&dp.0);
        Ok(())
    }

    async fn data_copy(
        &self,
        _dbg: &str,
        sr: &Uuid,
        vdi: &str,
        _copy_vm: &str,
        _url: &str,
        dest_sr: &Uuid,
        _verify_dest: bool,
    ) -> Result<StorageTaskId, StorageError> {
        self.inner.lock().await.calls += 1;
        Ok(self.start_task(TaskKind::Copy, sr, vdi, dest_sr, None).await)
    }

    async fn mirror_start(
        &self,
        _dbg: &str,
        sr: &Uuid,
        vdi: &str,
        _dp: &Datapath,
        _mirror_vm: &str,
        _copy_vm: &str,
        _url: &str,
        dest_sr: &Uuid,
        _verify_dest: bool,
    ) -> Result<StorageTaskId, StorageError> {
        let key = MirrorId::derive(sr, vdi).0;
        {
            let mut inner = self.inner.lock().await;
            inner.calls += 1;
            inner.mirrors.insert(
                key.clone(),
                SimMirror {
                    source_vdi: vdi.to_owned(),
                    dest_vdi: None,
                    failed: false,
                    stopped: false,
                },
            );
        }
        Ok(self
            .start_task(TaskKind::Mirror, sr, vdi, dest_sr, Some(key))
            .await)
    }

    async fn mirror_stop(
        &self,
        _dbg: &str,
        id: &MirrorId,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        match inner.mirrors.get_mut(&id.0) {
            Some(mirror) => {
                mirror.stopped = true;
                Ok(())
            }
            None => Err(StorageError::DoesNotExist {
                kind: "mirror",
                id: id.0.clone(),
            }),
        }
    }

    async fn mirror_stat(
        &self,
        _dbg: &str,
        id: &MirrorId,
    ) -> Result<MirrorStat, StorageError> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        match inner.mirrors.get(&id.0) {
            Some(mirror) => Ok(MirrorStat {
                source_vdi: mirror.source_vdi.clone(),
                dest_vdi: mirror.dest_vdi.clone().unwrap_or_default(),
                failed: mirror.failed,
            }),
            None => Err(StorageError::DoesNotExist {
                kind: "mirror",
                id: id.0.clone(),
            }),
        }
    }

    async fn update_snapshot_info_src(
        &self,
        _dbg: &str,
        _sr: &Uuid,
        vdi: &str,
        _url: &str,
        _dest_sr: &Uuid,
        _dest_vdi: &str,
        snapshot_pairs: &[(String, String)],
        _verify_dest: bool,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        if let Some(error) = inner.fail_snapshot_chain.clone() {
            return Err(error);
        }
        inner
            .snapshot_chain_calls
            .push((vdi.to_owned(), snapshot_pairs.len()));
        Ok(())
    }

    async fn task_stat(
        &self,
        _dbg: &str,
        task: &StorageTaskId,
    ) -> Result<StorageTaskStatus, StorageError> {
        // Completion materializes the destination volume, which needs
        // the source record's metadata; the nested datastore lock is
        // fine because the datastore never locks the agent back.
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        let Some(state) = inner.tasks.get(&task.0).map(|t| {
            (t.result.is_none(), t.ticks_left, t.src_sr, t.src_location.clone())
        }) else {
            return Err(StorageError::DoesNotExist {
                kind: "task",
                id: task.0.clone(),
            });
        };
        let (running, ticks_left, src_sr, src_location) = state;

        if running && ticks_left > 1 {
            let t = inner.tasks.get_mut(&task.0).unwrap();
            t.ticks_left -= 1;
            let progress =
                1.0 - (t.ticks_left as f64 / t.ticks_total as f64);
            return Ok(StorageTaskStatus { progress, result: None });
        }

        if running {
            // Final tick: the transfer lands now.
            let injected = inner.fail_locations.remove(&src_location);
            let source_meta =
                self.source.vdi_by_sr_location(&src_sr, &src_location).await;
            inner.next_id += 1;
            let seq = inner.next_id;
            let t = inner.tasks.get_mut(&task.0).unwrap();
            t.ticks_left = 0;
            match injected {
                Some(error) => {
                    let key = t.mirror_key.clone();
                    t.result = Some(Err(error));
                    if let Some(key) = key {
                        if let Some(m) = inner.mirrors.get_mut(&key) {
                            m.failed = true;
                        }
                    }
                }
                None => {
                    let location = format!("{}-m{}", src_location, seq);
                    let result = match t.kind {
                        TaskKind::Copy => StorageTaskResult::Vdi {
                            location: location.clone(),
                        },
                        TaskKind::Mirror => StorageTaskResult::Mirror {
                            id: MirrorId(
                                t.mirror_key.clone().unwrap_or_default(),
                            ),
                        },
                    };
                    let dest_sr = t.dest_sr;
                    let key = t.mirror_key.clone();
                    t.result = Some(Ok(result));
                    if let Some(key) = key {
                        if let Some(m) = inner.mirrors.get_mut(&key) {
                            m.dest_vdi = Some(location.clone());
                        }
                    }
                    let (virtual_size, snapshot_time) = source_meta
                        .map(|v| (v.virtual_size, v.snapshot_time))
                        .unwrap_or((0, Utc::now()));
                    inner.volumes.push(SimVolume {
                        sr_uuid: dest_sr,
                        location,
                        uuid: Uuid::new_v4(),
                        virtual_size,
                        snapshot_time,
                    });
                }
            }
        }

        let t = inner.tasks.get(&task.0).unwrap();
        Ok(StorageTaskStatus {
            progress: 1.0,
            result: t.result.clone(),
        })
    }

    async fn task_destroy(
        &self,
        _dbg: &str,
        task: &StorageTaskId,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        inner.tasks.remove(&task.0);
        Ok(())
    }
}
