// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the Apiary control plane.
//!
//! Errors generated anywhere in the migration engine are represented by
//! [`Error`] and converted to an HTTP error as one of the last steps in
//! processing a request, so most of the system stays agnostic to the
//! transport.  Each variant has a stable wire code (see [`Error::code`])
//! and positional parameters ([`Error::params`]) so that programmatic
//! clients can match on failures without parsing messages.

use super::HostRef;
use super::PowerState;
use super::SrRef;
use super::TaskRef;
use super::VdiRef;
use super::VifRef;
use super::VmRef;
use dropshot::HttpError;
use serde::Deserialize;
use serde::Serialize;

/// An error that can be generated within the migration engine.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// A reference did not resolve to a live object.
    #[error("invalid handle: {type_name} {reference}")]
    HandleInvalid { type_name: String, reference: String },

    /// The pool's license does not include the named feature.
    #[error("this operation requires the {feature} licensed feature")]
    LicenseRestriction { feature: String },

    /// The per-node cap on concurrent storage migrations was hit.
    #[error("too many storage migrations are active (limit {limit})")]
    TooManyStorageMigrates { limit: u32 },

    /// An SR involved in the migration lacks a required capability.
    #[error("SR {sr} does not support migration")]
    SrDoesNotSupportMigration { sr: SrRef },

    /// Changed-block-tracking must be disabled before a VDI can move.
    #[error("VDI {vdi} has changed block tracking enabled")]
    VdiCbtEnabled { vdi: VdiRef },

    /// Encrypted VDIs cannot be re-homed onto a different SR.
    #[error("VDI {vdi} is encrypted and cannot change SR")]
    VdiIsEncrypted { vdi: VdiRef },

    /// `on_boot=reset` VDIs cannot be migrated.
    #[error("the on-boot mode of VDI {vdi} is incompatible with this operation")]
    VdiOnBootModeIncompatibleWithOperation { vdi: VdiRef },

    /// An attached VDI was missing from the effective VDI map.
    #[error("VDI {vdi} does not appear in the VDI map")]
    VdiNotInMap { vdi: VdiRef },

    /// A VIF could not be resolved to a destination network.
    #[error("VIF {vif} does not appear in the VIF map")]
    VifNotInMap { vif: VifRef },

    /// After a transfer the destination SR had no VDI at the expected
    /// location.
    #[error("no VDI with location {location} found in SR {sr}")]
    VdiLocationMissing { sr: SrRef, location: String },

    /// After a transfer the destination SR had more than one VDI at the
    /// expected location.
    #[error("multiple VDIs with location {location} found in SR {sr}")]
    LocationNotUnique { sr: SrRef, location: String },

    /// A live disk mirror broke during the migration.
    #[error("mirror failed for VDI {vdi}")]
    MirrorFailed { vdi: VdiRef },

    /// A suspend image is on storage the source host cannot reach.
    #[error("suspend image VDI {vdi} is not accessible from the source host")]
    SuspendImageNotAccessible { vdi: VdiRef },

    /// The destination host is administratively disabled.
    #[error("host {host} is disabled")]
    HostDisabled { host: HostRef },

    /// The destination host's platform version cannot receive this VM:
    /// older than the source within a cluster, or not identical to the
    /// source across clusters.
    #[error("VM {vm} cannot migrate to host {host}: incompatible platform version")]
    VmHostIncompatibleVersionMigrate { host: HostRef, vm: VmRef },

    /// The VM is in the wrong power state for the requested operation.
    #[error("VM {vm} is in the wrong power state: expected {expected}, actual {actual}")]
    VmBadPowerState { vm: VmRef, expected: PowerState, actual: PowerState },

    /// Catch-all failure for a migration that could not proceed.
    #[error("migration of VM {vm} from {source_host} to {destination} failed: {message}")]
    VmMigrateFailed {
        vm: VmRef,
        source_host: String,
        destination: String,
        message: String,
    },

    /// The VM cannot run on the destination host.
    #[error("VM {vm} is incompatible with host {host}: {reason}")]
    VmIncompatibleWithThisHost { vm: VmRef, host: HostRef, reason: String },

    /// The storage backend does not implement a required operation.
    #[error("the storage backend does not implement {operation}")]
    UnimplementedInSmBackend { operation: String },

    /// The destination management plane could not be reached.
    #[error("cannot contact host at {url}")]
    CannotContactHost { url: String },

    /// A host has no IP address usable for the migration stream.
    #[error("host {host} has no management IP address")]
    HostHasNoManagementIp { host: HostRef },

    /// The request was well-formed but the operation is not permitted.
    #[error("operation not allowed: {message}")]
    OperationNotAllowed { message: String },

    /// The running task was cancelled at the caller's request.
    #[error("task {task} was cancelled")]
    TaskCancelled { task: TaskRef },

    /// A storage backend error passed through with its own code.
    #[error("storage backend error {code} {params:?}")]
    StorageBackend { code: String, params: Vec<String> },

    /// The specified input field is not valid.
    #[error("invalid value for {label}: {message}")]
    InvalidValue { label: String, message: String },

    /// The system encountered an unhandled operational error.
    #[error("internal error: {internal_message}")]
    InternalError { internal_message: String },
}

impl Error {
    /// The stable wire code for this error.
    ///
    /// Codes are part of the cluster API: clients match on them, so they
    /// must never change for an existing variant.
    pub fn code(&self) -> &str {
        match self {
            Error::HandleInvalid { .. } => "handle_invalid",
            Error::LicenseRestriction { .. } => "license_restriction",
            Error::TooManyStorageMigrates { .. } => {
                "too_many_storage_migrates"
            }
            Error::SrDoesNotSupportMigration { .. } => {
                "sr_does_not_support_migration"
            }
            Error::VdiCbtEnabled { .. } => "vdi_cbt_enabled",
            Error::VdiIsEncrypted { .. } => "vdi_is_encrypted",
            Error::VdiOnBootModeIncompatibleWithOperation { .. } => {
                "vdi_on_boot_mode_incompatible_with_operation"
            }
            Error::VdiNotInMap { .. } => "vdi_not_in_map",
            Error::VifNotInMap { .. } => "vif_not_in_map",
            Error::VdiLocationMissing { .. } => "vdi_location_missing",
            Error::LocationNotUnique { .. } => "location_not_unique",
            Error::MirrorFailed { .. } => "mirror_failed",
            Error::SuspendImageNotAccessible { .. } => {
                "suspend_image_not_accessible"
            }
            Error::HostDisabled { .. } => "host_disabled",
            Error::VmHostIncompatibleVersionMigrate { .. } => {
                "vm_host_incompatible_version_migrate"
            }
            Error::VmBadPowerState { .. } => "vm_bad_power_state",
            Error::VmMigrateFailed { .. } => "vm_migrate_failed",
            Error::VmIncompatibleWithThisHost { .. } => {
                "vm_incompatible_with_this_host"
            }
            Error::UnimplementedInSmBackend { .. } => {
                "unimplemented_in_sm_backend"
            }
            Error::CannotContactHost { .. } => "cannot_contact_host",
            Error::HostHasNoManagementIp { .. } => "host_has_no_management_ip",
            Error::OperationNotAllowed { .. } => "operation_not_allowed",
            Error::TaskCancelled { .. } => "task_cancelled",
            Error::StorageBackend { code, .. } => code,
            Error::InvalidValue { .. } => "invalid_value",
            Error::InternalError { .. } => "internal_error",
        }
    }

    /// Positional parameters, in the order clients historically expect
    /// for each code.
    pub fn params(&self) -> Vec<String> {
        match self {
            Error::HandleInvalid { type_name, reference } => {
                vec![type_name.clone(), reference.clone()]
            }
            Error::LicenseRestriction { feature } => vec![feature.clone()],
            Error::TooManyStorageMigrates { limit } => {
                vec![limit.to_string()]
            }
            Error::SrDoesNotSupportMigration { sr } => vec![sr.to_string()],
            Error::VdiCbtEnabled { vdi }
            | Error::VdiIsEncrypted { vdi }
            | Error::VdiOnBootModeIncompatibleWithOperation { vdi }
            | Error::VdiNotInMap { vdi }
            | Error::MirrorFailed { vdi }
            | Error::SuspendImageNotAccessible { vdi } => {
                vec![vdi.to_string()]
            }
            Error::VifNotInMap { vif } => vec![vif.to_string()],
            Error::VdiLocationMissing { sr, location }
            | Error::LocationNotUnique { sr, location } => {
                vec![sr.to_string(), location.clone()]
            }
            Error::HostDisabled { host } => vec![host.to_string()],
            Error::VmHostIncompatibleVersionMigrate { host, vm } => {
                vec![host.to_string(), vm.to_string()]
            }
            Error::VmBadPowerState { vm, expected, actual } => {
                vec![vm.to_string(), expected.to_string(), actual.to_string()]
            }
            Error::VmMigrateFailed { vm, source_host, destination, message } => {
                vec![
                    vm.to_string(),
                    source_host.clone(),
                    destination.clone(),
                    message.clone(),
                ]
            }
            Error::VmIncompatibleWithThisHost { vm, host, reason } => {
                vec![vm.to_string(), host.to_string(), reason.clone()]
            }
            Error::UnimplementedInSmBackend { operation } => {
                vec![operation.clone()]
            }
            Error::CannotContactHost { url } => vec![url.clone()],
            Error::HostHasNoManagementIp { host } => vec![host.to_string()],
            Error::OperationNotAllowed { message } => vec![message.clone()],
            Error::TaskCancelled { task } => vec![task.to_string()],
            Error::StorageBackend { params, .. } => params.clone(),
            Error::InvalidValue { label, message } => {
                vec![label.clone(), message.clone()]
            }
            Error::InternalError { internal_message } => {
                vec![internal_message.clone()]
            }
        }
    }

    pub fn handle_invalid(
        type_name: &str,
        reference: impl ToString,
    ) -> Error {
        Error::HandleInvalid {
            type_name: type_name.to_owned(),
            reference: reference.to_string(),
        }
    }

    /// Generates an [`Error::InternalError`] with the given message.
    ///
    /// Use this for operational conditions that should not happen and
    /// cannot reasonably be handled at runtime.
    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    pub fn not_allowed(message: impl Into<String>) -> Error {
        Error::OperationNotAllowed { message: message.into() }
    }

    pub fn invalid_value(label: &str, message: impl Into<String>) -> Error {
        Error::InvalidValue {
            label: label.to_owned(),
            message: message.into(),
        }
    }
}

impl From<Error> for HttpError {
    /// Defines how engine errors are ultimately exposed to clients over
    /// HTTP.  The wire code rides in the structured `error_code` field.
    fn from(error: Error) -> HttpError {
        let code = Some(error.code().to_owned());
        let message = error.to_string();
        match &error {
            Error::HandleInvalid { .. } => HttpError::for_client_error(
                code,
                http::StatusCode::NOT_FOUND,
                message,
            ),
            Error::TooManyStorageMigrates { .. }
            | Error::CannotContactHost { .. } => {
                HttpError::for_unavail(code, message)
            }
            Error::InternalError { .. }
            | Error::StorageBackend { .. }
            | Error::VmMigrateFailed { .. }
            | Error::MirrorFailed { .. }
            | Error::UnimplementedInSmBackend { .. } => {
                HttpError::for_internal_error(message)
            }
            _ => HttpError::for_bad_request(code, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let vdi = VdiRef::generate();
        assert_eq!(
            Error::VdiCbtEnabled { vdi }.code(),
            "vdi_cbt_enabled"
        );
        assert_eq!(
            Error::TooManyStorageMigrates { limit: 3 }.code(),
            "too_many_storage_migrates"
        );
        assert_eq!(
            Error::TooManyStorageMigrates { limit: 3 }.params(),
            vec!["3".to_string()]
        );
        // Backend errors pass their own code through untouched.
        let be = Error::StorageBackend {
            code: "SR_BACKEND_FAILURE_46".to_owned(),
            params: vec!["tapdisk".to_owned()],
        };
        assert_eq!(be.code(), "SR_BACKEND_FAILURE_46");
        assert_eq!(be.params(), vec!["tapdisk".to_string()]);
    }

    #[test]
    fn round_trips_through_serde() {
        let e = Error::VmBadPowerState {
            vm: VmRef::generate(),
            expected: PowerState::Halted,
            actual: PowerState::Running,
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: Error = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
    }
}
