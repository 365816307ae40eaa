// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Record types read from and written to the cluster database.
//!
//! The migration engine identifies every object by an opaque typed
//! reference and resolves it through [`crate::db::Datastore`] on each
//! use; records are point-in-time copies, never live views.  Object
//! graphs (VM ↔ VBD ↔ VDI ↔ SR) are expressed purely through references
//! so no record owns another.

use apiary_common::api::{
    GpuGroupRef, HostRef, MessageRef, NetworkRef, PbdRef, PgpuRef, PifRef,
    PlatformVersion, PowerState, SrRef, TaskRef, VbdRef, VdiRef, VgpuRef,
    VifRef, VmRef, VtpmRef,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq)]
pub struct VmRecord {
    pub reference: VmRef,
    pub uuid: Uuid,
    pub name_label: String,
    pub power_state: PowerState,
    pub is_a_snapshot: bool,
    pub snapshot_of: Option<VmRef>,
    pub snapshots: Vec<VmRef>,
    pub resident_on: Option<HostRef>,
    pub vbds: Vec<VbdRef>,
    pub vifs: Vec<VifRef>,
    pub vgpus: Vec<VgpuRef>,
    pub vtpms: Vec<VtpmRef>,
    pub suspend_vdi: Option<VdiRef>,
    pub suspend_sr: Option<SrRef>,
    pub ha_always_run: bool,
    pub vcpus: u32,
    /// CPU featureset captured at last boot, one 64-bit word per leaf.
    pub last_boot_cpu_flags: Vec<u64>,
    pub hardware_platform_version: u32,
    /// Set on VMs still carrying device models too old to migrate.
    pub has_legacy_hardware: bool,
    pub blobs: BTreeMap<String, String>,
    pub other_config: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VbdMode {
    Ro,
    Rw,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VbdKind {
    Cd,
    Disk,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VbdRecord {
    pub reference: VbdRef,
    pub vm: VmRef,
    /// `None` exactly when `empty` is set.
    pub vdi: Option<VdiRef>,
    pub device: String,
    pub mode: VbdMode,
    pub kind: VbdKind,
    pub empty: bool,
    pub currently_attached: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OnBoot {
    Persist,
    Reset,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VdiRecord {
    pub reference: VdiRef,
    pub uuid: Uuid,
    pub sr: SrRef,
    /// Backend location of the image within its SR; the key SMAPI uses.
    pub location: String,
    pub virtual_size: u64,
    pub on_boot: OnBoot,
    pub cbt_enabled: bool,
    /// Backend-private configuration.  A `key_hash` entry means the
    /// image is encrypted.
    pub sm_config: BTreeMap<String, String>,
    pub snapshot_of: Option<VdiRef>,
    pub snapshot_time: DateTime<Utc>,
    pub other_config: BTreeMap<String, String>,
}

impl VdiRecord {
    pub fn is_encrypted(&self) -> bool {
        self.sm_config.contains_key("key_hash")
    }
}

/// Capabilities an SR backend may advertise.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum SrFeature {
    VdiSnapshot,
    /// Can act as the source of a live mirror.
    VdiMirror,
    /// Can receive an inbound mirror.
    VdiMirrorIn,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SrRecord {
    pub reference: SrRef,
    pub uuid: Uuid,
    pub name_label: String,
    pub sr_type: String,
    pub shared: bool,
    pub features: BTreeSet<SrFeature>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PbdRecord {
    pub reference: PbdRef,
    pub host: HostRef,
    pub sr: SrRef,
    pub currently_attached: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VifRecord {
    pub reference: VifRef,
    pub vm: VmRef,
    pub device: String,
    pub mac: String,
    pub network: NetworkRef,
    pub other_config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NetworkRecord {
    pub reference: NetworkRef,
    pub name_label: String,
    pub bridge: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PifRecord {
    pub reference: PifRef,
    pub host: HostRef,
    pub network: NetworkRef,
    pub ip: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VgpuRecord {
    pub reference: VgpuRef,
    pub vm: VmRef,
    pub device: String,
    pub gpu_group: GpuGroupRef,
    pub vgpu_type: String,
    /// Where the scheduler has decided this vGPU will run.  Read in
    /// preference to any resident-on field because scheduling happens
    /// before the migrate.
    pub scheduled_to_be_resident_on: Option<PgpuRef>,
    /// PCI address of a dedicated SR-IOV virtual function, when the
    /// vGPU has one.
    pub pci_address: Option<String>,
    pub other_config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PgpuRecord {
    pub reference: PgpuRef,
    pub host: HostRef,
    pub gpu_group: GpuGroupRef,
    /// Physical-function PCI address, e.g. `0000:3b:00.0`.
    pub pci_address: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GpuGroupRecord {
    pub reference: GpuGroupRef,
    pub supported_vgpu_types: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HostRecord {
    pub reference: HostRef,
    pub uuid: Uuid,
    pub name_label: String,
    pub enabled: bool,
    /// Management IP address.
    pub address: String,
    pub platform_version: PlatformVersion,
    pub cpu_count: u32,
    pub cpu_features: Vec<u64>,
    pub virtual_hardware_platform_versions: Vec<u32>,
    pub suspend_image_sr: Option<SrRef>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PoolRecord {
    pub coordinator: HostRef,
    pub default_sr: Option<SrRef>,
    pub suspend_image_sr: Option<SrRef>,
    pub ha_enabled: bool,
    /// Pool-wide default for memory-stream compression.
    pub migration_compression: bool,
    /// When set, control-plane URLs handed out for migration are forced
    /// to TLS.
    pub tls_verification_enabled: bool,
    pub licensed_features: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskRecord {
    pub reference: TaskRef,
    pub label: String,
    pub progress: f64,
    pub cancellable: bool,
    pub cancelling: bool,
    pub other_config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessageRecord {
    pub reference: MessageRef,
    pub name: String,
    pub priority: i32,
    pub body: String,
    pub vm_uuid: Uuid,
}
