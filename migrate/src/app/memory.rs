// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driving the memory-state migration through the hypervisor-control
//! agent.
//!
//! A guest that reboots while its memory is streaming surfaces from the
//! agent as either a non-user `Cancelled` or `Internal_error:
//! End_of_file`.  Both simply mean "start the stream again", so we
//! retry those — and only those — a bounded number of times.  A cancel
//! requested by the caller is the same `Cancelled` fault, distinguished
//! by the cluster task's own cancelling flag, and propagates
//! immediately.

use super::Engine;
use crate::context::OpContext;
use crate::vmm::{VmmError, END_OF_FILE};
use apiary_common::api::Error;
use slog::{info, warn};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Total attempts, including the first.
const MAX_ATTEMPTS: u32 = 3;

/// True for the fault signatures of a guest reboot mid-transfer.
fn guest_rebooted(error: &VmmError) -> bool {
    match error {
        VmmError::Cancelled { .. } => true,
        VmmError::Internal { message } => message == END_OF_FILE,
        _ => false,
    }
}

impl Engine {
    /// Invokes the agent's migrate and waits it out, retrying
    /// reboot-class faults.  On success the agent's cached metadata for
    /// the VM is deleted: the domain now lives elsewhere.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn migrate_memory(
        &self,
        opctx: &OpContext,
        vm_uuid: &Uuid,
        vdi_map: &BTreeMap<String, String>,
        vif_map: &BTreeMap<String, String>,
        vgpu_map: &BTreeMap<String, String>,
        xenops_url: &str,
        compress: bool,
        verify_dest: bool,
    ) -> Result<(), Error> {
        let dbg = opctx.dbg();
        let mut attempt = 1;
        loop {
            let result = async {
                let task = self
                    .vmm()
                    .vm_migrate(
                        &dbg,
                        vm_uuid,
                        vdi_map,
                        vif_map,
                        vgpu_map,
                        xenops_url,
                        compress,
                        verify_dest,
                    )
                    .await?;
                self.vmm().task_wait(&dbg, &task).await
            }
            .await;

            match result {
                Ok(()) => break,
                Err(error) => {
                    // The caller's own cancel arrives as the same agent
                    // fault; check the cluster task to tell them apart.
                    if matches!(error, VmmError::Cancelled { .. }) {
                        let task =
                            self.datastore().task(&opctx.task).await?;
                        if task.cancelling {
                            return Err(Error::TaskCancelled {
                                task: opctx.task,
                            });
                        }
                    }
                    if guest_rebooted(&error) && attempt < MAX_ATTEMPTS {
                        warn!(opctx.log,
                            "guest appears to have rebooted during memory \
                             migration; retrying";
                            "vm_uuid" => %vm_uuid,
                            "attempt" => attempt,
                            "error" => %error,
                        );
                        attempt += 1;
                        continue;
                    }
                    return Err(translate(error, opctx));
                }
            }
        }

        info!(opctx.log, "memory migration complete";
            "vm_uuid" => %vm_uuid, "attempts" => attempt);

        if let Err(e) = self.vmm().metadata_delete(&dbg, vm_uuid).await {
            warn!(opctx.log, "failed to delete cached VM metadata";
                "vm_uuid" => %vm_uuid, "error" => %e);
        }
        Ok(())
    }
}

fn translate(error: VmmError, opctx: &OpContext) -> Error {
    match error {
        // Retries exhausted or cancellation raced with completion:
        // either way the cluster-visible shape is a cancelled task.
        VmmError::Cancelled { .. } => {
            Error::TaskCancelled { task: opctx.task }
        }
        VmmError::Internal { message } => {
            Error::InternalError { internal_message: message }
        }
        VmmError::DoesNotExist { uuid } => {
            Error::handle_invalid("VM", uuid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reboot_signatures() {
        assert!(guest_rebooted(&VmmError::Cancelled {
            task: "t".to_owned()
        }));
        assert!(guest_rebooted(&VmmError::Internal {
            message: END_OF_FILE.to_owned()
        }));
        assert!(!guest_rebooted(&VmmError::Internal {
            message: "Out_of_memory".to_owned()
        }));
    }
}
