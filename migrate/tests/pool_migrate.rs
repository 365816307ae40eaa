// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests for the memory-only and single-disk migration operations.

mod common;

use apiary_common::api::{Error, PowerState};
use apiary_migrate::db::Datastore;
use common::*;
use std::collections::BTreeMap;

#[tokio::test]
async fn pool_migrate_moves_a_running_vm() {
    let w = intra_world().await;
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Running, 1)
        .await;
    let src_uuid = w.src.ds.vm(&vm.vm).await.unwrap().uuid;

    let opctx = w.world.opctx("pool-migrate").await.unwrap();
    w.world
        .engine
        .pool_migrate(&opctx, vm.vm, w.src.host2, &BTreeMap::new())
        .await
        .expect("pool migrate should succeed");

    let after = w.src.ds.vm(&vm.vm).await.unwrap();
    assert_eq!(after.resident_on, Some(w.src.host2));
    // Storage never moves in a pool migrate.
    let vbd = w.src.ds.vbd(&vm.vbds[0]).await.unwrap();
    assert_eq!(vbd.vdi, Some(vm.vdis[0]));
    assert_eq!(w.world.vmm.migrate_calls().await, 1);
    assert_eq!(w.world.vmm.suppression_depth(&src_uuid).await, 0);
}

#[tokio::test]
async fn pool_migrate_rejects_disabled_host_and_bad_power_state() {
    let w = intra_world().await;
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Running, 1)
        .await;

    // Disable the destination host.
    let mut host = w.src.ds.host(&w.src.host2).await.unwrap();
    host.enabled = false;
    w.src.ds.insert_host(host).await;

    let opctx = w.world.opctx("pool-migrate").await.unwrap();
    let err = w
        .world
        .engine
        .pool_migrate(&opctx, vm.vm, w.src.host2, &BTreeMap::new())
        .await
        .unwrap_err();
    assert_eq!(err, Error::HostDisabled { host: w.src.host2 });

    // A halted VM has no memory to migrate.
    let halted =
        make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Halted, 0)
            .await;
    let opctx = w.world.opctx("pool-migrate").await.unwrap();
    let err = w
        .world
        .engine
        .pool_migrate(&opctx, halted.vm, w.src.host2, &BTreeMap::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Error::VmBadPowerState {
            vm: halted.vm,
            expected: PowerState::Running,
            actual: PowerState::Halted,
        }
    );
}

#[tokio::test]
async fn vdi_pool_migrate_moves_one_disk_of_a_running_vm() {
    let w = intra_world().await;
    // The VM keeps running on its own host; the destination of the
    // move is that same host.
    let vm = make_vm(&w.src, w.src.coordinator, w.src.sr1, PowerState::Running, 2)
        .await;
    w.world.wire_local_destination(w.src.coordinator).await;

    let opctx = w.world.opctx("vdi-migrate").await.unwrap();
    let new_vdi = w
        .world
        .engine
        .vdi_pool_migrate(&opctx, vm.vdis[0], w.src.sr2, &BTreeMap::new())
        .await
        .expect("single-disk migration should succeed");

    assert_ne!(new_vdi, vm.vdis[0]);
    let record = w.src.ds.vdi(&new_vdi).await.unwrap();
    assert_eq!(record.sr, w.src.sr2);
    // The drive now points at the new image, and the untouched disk
    // kept its mapping.
    let vbd0 = w.src.ds.vbd(&vm.vbds[0]).await.unwrap();
    assert_eq!(vbd0.vdi, Some(new_vdi));
    let vbd1 = w.src.ds.vbd(&vm.vbds[1]).await.unwrap();
    assert_eq!(vbd1.vdi, Some(vm.vdis[1]));
    assert_eq!(w.world.engine.throttle().active(), 0);
}
