// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request and response bodies for the migration engine's exposed API.

use apiary_common::api::{
    GpuGroupRef, HostRef, NetworkRef, SrRef, TaskRef, VdiRef, VgpuRef,
    VifRef, VmRef,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of a `migrate-send` or `assert-can-migrate` request.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct MigrateSendBody {
    /// The destination handshake blob, as produced by the destination
    /// cluster: `master`, `xenops`, `SM`, `host`, `session_id`.
    pub dest: BTreeMap<String, String>,
    /// Whether the guest keeps running through the migration.
    #[serde(default)]
    pub live: bool,
    /// Destination SR for each moved VDI.
    #[serde(default)]
    pub vdi_map: BTreeMap<VdiRef, SrRef>,
    /// Destination network for each VIF (cross-cluster only).
    #[serde(default)]
    pub vif_map: BTreeMap<VifRef, NetworkRef>,
    /// Destination GPU group for each vGPU.
    #[serde(default)]
    pub vgpu_map: BTreeMap<VgpuRef, GpuGroupRef>,
    /// Free-form options: `compress`, `copy`, `force`, ...
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct MigrateSendResponse {
    /// The migrated VM at its destination.
    pub vm: VmRef,
    /// The cluster task the migration ran under.
    pub task: TaskRef,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct PoolMigrateBody {
    pub host: HostRef,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct PoolMigrateCompleteBody {
    pub host: HostRef,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct VdiPoolMigrateBody {
    /// SR the disk should move to.
    pub sr: SrRef,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct VdiPoolMigrateResponse {
    /// The disk's new identity after the move.
    pub vdi: VdiRef,
    pub task: TaskRef,
}
