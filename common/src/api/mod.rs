// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster-facing API model: object references, power states, and the
//! option-bag grammar used by migration calls.

mod error;
pub mod options;

pub use error::Error;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Generates an opaque, typed reference to one class of cluster object.
///
/// References are cluster-local handles; the UUID inside one is the
/// reference's own identity, not the object's user-visible UUID (records
/// carry that separately).  Holding a reference never implies the object
/// still exists.
macro_rules! typed_ref {
    ($name:ident, $tag:literal) => {
        #[derive(
            Clone,
            Copy,
            Debug,
            Deserialize,
            Eq,
            Hash,
            JsonSchema,
            Ord,
            PartialEq,
            PartialOrd,
            Serialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, ":{}"), self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix(concat!($tag, ":")).unwrap_or(s);
                Ok(Self(s.parse()?))
            }
        }
    };
}

typed_ref!(VmRef, "vm");
typed_ref!(VbdRef, "vbd");
typed_ref!(VdiRef, "vdi");
typed_ref!(SrRef, "sr");
typed_ref!(PbdRef, "pbd");
typed_ref!(VifRef, "vif");
typed_ref!(NetworkRef, "network");
typed_ref!(PifRef, "pif");
typed_ref!(VgpuRef, "vgpu");
typed_ref!(PgpuRef, "pgpu");
typed_ref!(GpuGroupRef, "gpu-group");
typed_ref!(VtpmRef, "vtpm");
typed_ref!(HostRef, "host");
typed_ref!(TaskRef, "task");
typed_ref!(MessageRef, "message");

/// Power state of a VM as recorded in the cluster database.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Halted,
    Paused,
    Running,
    Suspended,
}

impl PowerState {
    /// True when a guest domain exists for this state, i.e. a memory image
    /// must be transferred for the VM to move.
    pub fn has_domain(&self) -> bool {
        matches!(self, PowerState::Running | PowerState::Paused)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::Halted => "Halted",
            PowerState::Paused => "Paused",
            PowerState::Running => "Running",
            PowerState::Suspended => "Suspended",
        };
        f.write_str(s)
    }
}

/// A host's platform version, compared lexicographically component by
/// component.  Within a cluster, hosts may only receive VMs from hosts
/// at the same or an older platform version; across clusters the
/// versions must match exactly.
#[derive(
    Clone,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(transparent)]
pub struct PlatformVersion(pub Vec<u32>);

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> =
            self.0.iter().map(|c| c.to_string()).collect();
        f.write_str(&parts.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_display_round_trips() {
        let r = VdiRef::generate();
        let s = r.to_string();
        assert!(s.starts_with("vdi:"));
        assert_eq!(s.parse::<VdiRef>().unwrap(), r);
        // A bare UUID is also accepted.
        assert_eq!(r.0.to_string().parse::<VdiRef>().unwrap(), r);
    }

    #[test]
    fn platform_version_ordering() {
        let old = PlatformVersion(vec![3, 2, 1]);
        let new = PlatformVersion(vec![3, 2, 2]);
        assert!(old < new);
        assert!(PlatformVersion(vec![3, 2]) < old);
    }
}
