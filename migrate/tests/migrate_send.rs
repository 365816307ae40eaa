// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests for `migrate_send` against the simulated world.

mod common;

use apiary_common::api::{Error, PlatformVersion, PowerState, VdiRef};
use apiary_migrate::db::Datastore;
use apiary_migrate::storage::StorageError;
use apiary_migrate::vmm::{VmmError, END_OF_FILE};
use common::*;
use std::collections::BTreeMap;

#[tokio::test]
async fn concurrency_cap_rejects_fourth_migration() {
    let w = intra_world().await;
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Running, 1)
        .await;
    let vdi_map = BTreeMap::from([(vm.vdis[0], w.src.sr2)]);

    let _a = w.world.engine.throttle().enter().unwrap();
    let _b = w.world.engine.throttle().enter().unwrap();
    let _c = w.world.engine.throttle().enter().unwrap();
    assert_eq!(w.world.engine.throttle().active(), 3);

    let opctx = w.world.opctx("migrate").await.unwrap();
    let err = w
        .world
        .engine
        .migrate_send(
            &opctx,
            vm.vm,
            &w.dest_map,
            true,
            vdi_map,
            BTreeMap::new(),
            BTreeMap::new(),
            &BTreeMap::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, Error::TooManyStorageMigrates { limit: 3 });
    assert_eq!(err.params(), vec!["3".to_string()]);
    // The failed admission must not have touched the counter.
    assert_eq!(w.world.engine.throttle().active(), 3);
}

#[tokio::test]
async fn copy_within_cluster_is_rejected_before_any_storage_call() {
    let w = intra_world().await;
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Halted, 1)
        .await;
    let vdi_map = BTreeMap::from([(vm.vdis[0], w.src.sr2)]);

    let opctx = w.world.opctx("migrate").await.unwrap();
    let err = w
        .world
        .engine
        .migrate_send(
            &opctx,
            vm.vm,
            &w.dest_map,
            false,
            vdi_map,
            BTreeMap::new(),
            BTreeMap::new(),
            &options(&[("copy", "true")]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "operation_not_allowed");
    assert!(err.to_string().contains("VM.copy"));
    assert_eq!(w.world.storage.call_count().await, 0);
}

#[tokio::test]
async fn cbt_enabled_vdi_blocks_migration() {
    let w = cross_world().await;
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Running, 1)
        .await;
    let vdi = vm.vdis[0];
    let record = w.src.ds.vdi(&vdi).await.unwrap();
    w.src.ds.insert_vdi({
        let mut r = record;
        r.cbt_enabled = true;
        r
    })
    .await;
    let vdi_map = BTreeMap::from([(vdi, w.dst.sr2)]);

    let opctx = w.world.opctx("assert").await.unwrap();
    let err = w
        .world
        .engine
        .assert_can_migrate(
            &opctx,
            vm.vm,
            &w.dest_map,
            true,
            vdi_map,
            BTreeMap::new(),
            BTreeMap::new(),
            &BTreeMap::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, Error::VdiCbtEnabled { vdi });
}

#[tokio::test]
async fn cross_cluster_migration_rejects_newer_destination_platform_version()
{
    let w = cross_world_with_versions(
        PlatformVersion(vec![3, 2, 1]),
        PlatformVersion(vec![3, 2, 2]),
    )
    .await;
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Running, 1)
        .await;
    let vdi_map = BTreeMap::from([(vm.vdis[0], w.dst.sr2)]);
    let expected = Error::VmHostIncompatibleVersionMigrate {
        host: w.dst.host2,
        vm: vm.vm,
    };

    // Across clusters the platform versions must match exactly, so a
    // strictly newer destination is rejected too.
    let opctx = w.world.opctx("assert").await.unwrap();
    let err = w
        .world
        .engine
        .assert_can_migrate(
            &opctx,
            vm.vm,
            &w.dest_map,
            true,
            vdi_map.clone(),
            BTreeMap::new(),
            BTreeMap::new(),
            &BTreeMap::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, expected);

    let opctx = w.world.opctx("migrate").await.unwrap();
    let err = w
        .world
        .engine
        .migrate_send(
            &opctx,
            vm.vm,
            &w.dest_map,
            true,
            vdi_map,
            BTreeMap::new(),
            BTreeMap::new(),
            &BTreeMap::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, expected);
    assert_eq!(w.world.storage.call_count().await, 0);

    // An older destination is just as mismatched.
    let w = cross_world_with_versions(
        PlatformVersion(vec![3, 2, 1]),
        PlatformVersion(vec![3, 2, 0]),
    )
    .await;
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Running, 1)
        .await;
    let vdi_map = BTreeMap::from([(vm.vdis[0], w.dst.sr2)]);
    let opctx = w.world.opctx("assert").await.unwrap();
    let err = w
        .world
        .engine
        .assert_can_migrate(
            &opctx,
            vm.vm,
            &w.dest_map,
            true,
            vdi_map,
            BTreeMap::new(),
            BTreeMap::new(),
            &BTreeMap::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Error::VmHostIncompatibleVersionMigrate {
            host: w.dst.host2,
            vm: vm.vm,
        }
    );
}

#[tokio::test]
async fn feasibility_check_is_idempotent() {
    let w = cross_world().await;
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Running, 1)
        .await;
    let vdi_map = BTreeMap::from([(vm.vdis[0], w.dst.sr2)]);

    let opctx = w.world.opctx("assert").await.unwrap();
    for _ in 0..2 {
        w.world
            .engine
            .assert_can_migrate(
                &opctx,
                vm.vm,
                &w.dest_map,
                true,
                vdi_map.clone(),
                BTreeMap::new(),
                BTreeMap::new(),
                &BTreeMap::new(),
            )
            .await
            .expect("feasibility verdict should be stable");
    }
    // Checking is pure: nothing was mirrored, nothing was created.
    assert_eq!(w.world.engine.throttle().active(), 0);
}

#[tokio::test]
async fn guest_reboot_faults_are_retried_and_migration_completes() {
    let w = cross_world().await;
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Running, 1)
        .await;
    let src_uuid = w.src.ds.vm(&vm.vm).await.unwrap().uuid;
    let vdi_map = BTreeMap::from([(vm.vdis[0], w.dst.sr2)]);

    w.world
        .vmm
        .push_outcome(VmmError::Cancelled { task: "vmm-task-x".to_owned() })
        .await;
    w.world
        .vmm
        .push_outcome(VmmError::Internal { message: END_OF_FILE.to_owned() })
        .await;

    let opctx = w.world.opctx("migrate").await.unwrap();
    let new_vm = w
        .world
        .engine
        .migrate_send(
            &opctx,
            vm.vm,
            &w.dest_map,
            true,
            vdi_map,
            BTreeMap::new(),
            BTreeMap::new(),
            &BTreeMap::new(),
        )
        .await
        .expect("migration should survive two reboot-class faults");

    // Exactly three agent calls: two failures plus the success.
    assert_eq!(w.world.vmm.migrate_calls().await, 3);

    // The guest now runs on the destination with its storage remapped.
    let dst_vm = w.dst.ds.vm_record_by_uuid(&src_uuid).await.unwrap();
    assert_eq!(dst_vm.reference, new_vm);
    assert_eq!(dst_vm.power_state, PowerState::Running);
    let dst_vbd = w.dst.ds.vbd(&dst_vm.vbds[0]).await.unwrap();
    let dst_vdi = w.dst.ds.vdi(&dst_vbd.vdi.unwrap()).await.unwrap();
    assert_eq!(dst_vdi.sr, w.dst.sr2);

    // The source's record graph is gone, the throttle slot is free,
    // and the event suppression envelope was balanced.
    assert!(w.src.ds.vm_record_by_uuid(&src_uuid).await.is_none());
    assert_eq!(w.world.engine.throttle().active(), 0);
    assert_eq!(w.world.vmm.suppression_depth(&src_uuid).await, 0);
    assert_eq!(w.world.vmm.metadata_deleted().await, vec![src_uuid]);
}

#[tokio::test]
async fn other_agent_faults_abort_without_retry() {
    let w = cross_world().await;
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Running, 1)
        .await;
    let src_uuid = w.src.ds.vm(&vm.vm).await.unwrap().uuid;
    let vdi_map = BTreeMap::from([(vm.vdis[0], w.dst.sr2)]);

    w.world
        .vmm
        .push_outcome(VmmError::Internal {
            message: "Out_of_memory".to_owned(),
        })
        .await;

    let opctx = w.world.opctx("migrate").await.unwrap();
    let err = w
        .world
        .engine
        .migrate_send(
            &opctx,
            vm.vm,
            &w.dest_map,
            true,
            vdi_map,
            BTreeMap::new(),
            BTreeMap::new(),
            &BTreeMap::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "internal_error");
    assert_eq!(w.world.vmm.migrate_calls().await, 1);

    // Rollback destroyed the half-imported destination VM and freed
    // the throttle slot.
    assert!(w.dst.ds.vm_record_by_uuid(&src_uuid).await.is_none());
    assert_eq!(w.world.engine.throttle().active(), 0);
    assert_eq!(w.world.vmm.suppression_depth(&src_uuid).await, 0);
}

#[tokio::test]
async fn suspend_image_falls_back_to_destination_default_sr() {
    let w = cross_world().await;
    let vm = make_vm(
        &w.src,
        w.src.coordinator,
        w.src.sr1,
        PowerState::Suspended,
        1,
    )
    .await;
    let src_uuid = w.src.ds.vm(&vm.vm).await.unwrap().uuid;

    // Give the VM a suspend image that is absent from the VDI map.
    let suspend_vdi = VdiRef::generate();
    w.src
        .ds
        .insert_vdi(apiary_migrate::db::model::VdiRecord {
            reference: suspend_vdi,
            uuid: uuid::Uuid::new_v4(),
            sr: w.src.sr2,
            location: "suspend-image".to_owned(),
            virtual_size: 1 << 30,
            on_boot: apiary_migrate::db::model::OnBoot::Persist,
            cbt_enabled: false,
            sm_config: BTreeMap::new(),
            snapshot_of: None,
            snapshot_time: chrono::Utc::now(),
            other_config: BTreeMap::new(),
        })
        .await;
    w.src
        .ds
        .update_vm(&vm.vm, |record| record.suspend_vdi = Some(suspend_vdi))
        .await
        .unwrap();

    let vdi_map = BTreeMap::from([(vm.vdis[0], w.dst.sr2)]);
    let opctx = w.world.opctx("migrate").await.unwrap();
    w.world
        .engine
        .migrate_send(
            &opctx,
            vm.vm,
            &w.dest_map,
            false,
            vdi_map,
            BTreeMap::new(),
            BTreeMap::new(),
            &BTreeMap::new(),
        )
        .await
        .expect("suspended migration should succeed");

    // Destination pool and host had no suspend-image SR configured, so
    // the image landed on the destination default SR.
    let dst_vm = w.dst.ds.vm_record_by_uuid(&src_uuid).await.unwrap();
    let dst_suspend = w
        .dst
        .ds
        .vdi(&dst_vm.suspend_vdi.expect("suspend VDI should be remapped"))
        .await
        .unwrap();
    assert_eq!(dst_suspend.sr, w.dst.sr1);
}

#[tokio::test]
async fn unmapped_vif_inherits_network_from_same_mac() {
    let w = cross_world().await;
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Running, 1)
        .await;
    let src_uuid = w.src.ds.vm(&vm.vm).await.unwrap().uuid;
    let vif1 = add_vif(&w.src, vm.vm, "0", "aa:bb:cc:00:00:01").await;
    let _vif2 = add_vif(&w.src, vm.vm, "1", "aa:bb:cc:00:00:01").await;

    let vdi_map = BTreeMap::from([(vm.vdis[0], w.dst.sr2)]);
    let vif_map = BTreeMap::from([(vif1, w.dst.network)]);

    let opctx = w.world.opctx("migrate").await.unwrap();
    w.world
        .engine
        .migrate_send(
            &opctx,
            vm.vm,
            &w.dest_map,
            true,
            vdi_map,
            vif_map,
            BTreeMap::new(),
            &BTreeMap::new(),
        )
        .await
        .expect("migration with inferred VIF should succeed");

    let dst_vm = w.dst.ds.vm_record_by_uuid(&src_uuid).await.unwrap();
    assert_eq!(dst_vm.vifs.len(), 2);
    for vif_ref in &dst_vm.vifs {
        let vif = w.dst.ds.vif(vif_ref).await.unwrap();
        assert_eq!(vif.network, w.dst.network);
    }
}

#[tokio::test]
async fn recorded_mirror_failure_wins_over_inflight_error() {
    let w = cross_world().await;
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Running, 1)
        .await;
    let leaf = w.src.ds.vdi(&vm.vdis[0]).await.unwrap();

    w.world
        .storage
        .fail_transfer_of(
            &leaf.location,
            StorageError::Backend {
                code: "SR_BACKEND_FAILURE_46".to_owned(),
                params: vec!["tapdisk".to_owned()],
            },
        )
        .await;

    let opctx = w.world.opctx("migrate").await.unwrap();
    // The storage layer's failure handler records the broken mirror on
    // the task before the error surfaces.
    w.src
        .ds
        .task_add_other_config(
            &opctx.task,
            "mirror_failed",
            &leaf.uuid.to_string(),
        )
        .await
        .unwrap();

    let vdi_map = BTreeMap::from([(vm.vdis[0], w.dst.sr2)]);
    let err = w
        .world
        .engine
        .migrate_send(
            &opctx,
            vm.vm,
            &w.dest_map,
            true,
            vdi_map,
            BTreeMap::new(),
            BTreeMap::new(),
            &BTreeMap::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, Error::MirrorFailed { vdi: leaf.reference });
    assert_eq!(w.world.engine.throttle().active(), 0);
}

#[tokio::test]
async fn copy_leaves_the_source_vm_untouched() {
    let w = cross_world().await;
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Halted, 2)
        .await;
    let src_uuid = w.src.ds.vm(&vm.vm).await.unwrap().uuid;

    let before_vm = w.src.ds.vm(&vm.vm).await.unwrap();
    let mut before_vbds = Vec::new();
    for vbd in &vm.vbds {
        before_vbds.push(w.src.ds.vbd(vbd).await.unwrap());
    }

    let vdi_map = BTreeMap::from([
        (vm.vdis[0], w.dst.sr1),
        (vm.vdis[1], w.dst.sr2),
    ]);
    let opctx = w.world.opctx("migrate").await.unwrap();
    let new_vm = w
        .world
        .engine
        .migrate_send(
            &opctx,
            vm.vm,
            &w.dest_map,
            false,
            vdi_map,
            BTreeMap::new(),
            BTreeMap::new(),
            &options(&[("copy", "true")]),
        )
        .await
        .expect("copy migration should succeed");

    // Round trip: the source graph is byte-identical.
    assert_eq!(w.src.ds.vm(&vm.vm).await.unwrap(), before_vm);
    for (vbd, before) in vm.vbds.iter().zip(before_vbds) {
        assert_eq!(w.src.ds.vbd(vbd).await.unwrap(), before);
    }

    // The destination got a copy under a fresh identity.
    let dst_vm = w.dst.ds.vm(&new_vm).await.unwrap();
    assert_ne!(dst_vm.uuid, src_uuid);
    assert_eq!(dst_vm.vbds.len(), 2);
    assert_eq!(w.world.engine.throttle().active(), 0);
}

#[tokio::test]
async fn intra_cluster_migration_remaps_vbds_in_place() {
    let w = intra_world().await;
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Running, 1)
        .await;
    let src_uuid = w.src.ds.vm(&vm.vm).await.unwrap().uuid;
    let vdi_map = BTreeMap::from([(vm.vdis[0], w.src.sr2)]);

    let opctx = w.world.opctx("migrate").await.unwrap();
    let new_vm = w
        .world
        .engine
        .migrate_send(
            &opctx,
            vm.vm,
            &w.dest_map,
            true,
            vdi_map,
            BTreeMap::new(),
            BTreeMap::new(),
            &BTreeMap::new(),
        )
        .await
        .expect("intra-cluster migration should succeed");

    // Same VM object, new disk, new host.
    assert_eq!(new_vm, vm.vm);
    let after = w.src.ds.vm(&vm.vm).await.unwrap();
    assert_eq!(after.resident_on, Some(w.src.host2));
    let vbd = w.src.ds.vbd(&vm.vbds[0]).await.unwrap();
    let new_vdi = w.src.ds.vdi(&vbd.vdi.unwrap()).await.unwrap();
    assert_eq!(new_vdi.sr, w.src.sr2);
    assert_ne!(new_vdi.reference, vm.vdis[0]);
    assert_eq!(w.world.vmm.suppression_depth(&src_uuid).await, 0);
    assert_eq!(w.world.engine.throttle().active(), 0);
}

#[tokio::test]
async fn cancellation_during_disk_phase_unwinds() {
    let w = cross_world().await;
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Running, 1)
        .await;
    let src_uuid = w.src.ds.vm(&vm.vm).await.unwrap().uuid;
    let vdi_map = BTreeMap::from([(vm.vdis[0], w.dst.sr2)]);

    let opctx = w.world.opctx("migrate").await.unwrap();
    // Cancel before the call: the first cooperative check fires after
    // feasibility, before any transfer starts.
    w.src.ds.task_cancel(&opctx.task).await.unwrap();
    let err = w
        .world
        .engine
        .migrate_send(
            &opctx,
            vm.vm,
            &w.dest_map,
            true,
            vdi_map,
            BTreeMap::new(),
            BTreeMap::new(),
            &BTreeMap::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, Error::TaskCancelled { task: opctx.task });
    assert!(w.dst.ds.vm_record_by_uuid(&src_uuid).await.is_none());
    assert_eq!(w.world.engine.throttle().active(), 0);
}
