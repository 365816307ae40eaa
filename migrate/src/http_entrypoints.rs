// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP entrypoint functions for the migration engine's exposed API.

use crate::app::Engine;
use crate::context::OpContext;
use crate::params::{
    MigrateSendBody, MigrateSendResponse, PoolMigrateBody,
    PoolMigrateCompleteBody, VdiPoolMigrateBody, VdiPoolMigrateResponse,
};
use apiary_common::api::{Error, VdiRef, VmRef};
use dropshot::{
    endpoint, ApiDescription, HttpError, HttpResponseOk,
    HttpResponseUpdatedNoContent, Path, RequestContext, TypedBody,
};
use schemars::JsonSchema;
use serde::Deserialize;
use slog::o;
use std::sync::Arc;

type MigrateApiDescription = ApiDescription<Arc<Engine>>;

/// Returns a description of the migration engine API.
pub fn api() -> MigrateApiDescription {
    fn register_endpoints(
        api: &mut MigrateApiDescription,
    ) -> Result<(), String> {
        api.register(vm_migrate_send)?;
        api.register(vm_assert_can_migrate)?;
        api.register(vm_pool_migrate)?;
        api.register(vm_pool_migrate_complete)?;
        api.register(vdi_pool_migrate)?;
        Ok(())
    }

    let mut api = MigrateApiDescription::new();
    if let Err(err) = register_endpoints(&mut api) {
        panic!("failed to register entrypoints: {}", err);
    }
    api
}

/// Path parameters for VM requests.
#[derive(Deserialize, JsonSchema)]
struct VmPathParam {
    vm: VmRef,
}

/// Path parameters for VDI requests.
#[derive(Deserialize, JsonSchema)]
struct VdiPathParam {
    vdi: VdiRef,
}

async fn new_opctx(
    rqctx: &RequestContext<Arc<Engine>>,
    label: &str,
) -> Result<OpContext, Error> {
    let engine = rqctx.context();
    let task = engine.datastore().task_create(label).await?;
    let log = rqctx.log.new(o!("task" => task.to_string()));
    Ok(OpContext::new(log, task))
}

/// Migrate a VM (and its storage) to the destination described by the
/// handshake blob in the body.
#[endpoint {
    method = POST,
    path = "/vms/{vm}/migrate-send",
}]
async fn vm_migrate_send(
    rqctx: RequestContext<Arc<Engine>>,
    path_params: Path<VmPathParam>,
    body: TypedBody<MigrateSendBody>,
) -> Result<HttpResponseOk<MigrateSendResponse>, HttpError> {
    let engine = rqctx.context().clone();
    let vm = path_params.into_inner().vm;
    let body = body.into_inner();
    let opctx = new_opctx(&rqctx, "VM.migrate_send").await?;
    let task = opctx.task;
    let new_vm = engine
        .migrate_send(
            &opctx,
            vm,
            &body.dest,
            body.live,
            body.vdi_map,
            body.vif_map,
            body.vgpu_map,
            &body.options,
        )
        .await?;
    Ok(HttpResponseOk(MigrateSendResponse { vm: new_vm, task }))
}

/// Validate a migration request without performing it.
#[endpoint {
    method = POST,
    path = "/vms/{vm}/assert-can-migrate",
}]
async fn vm_assert_can_migrate(
    rqctx: RequestContext<Arc<Engine>>,
    path_params: Path<VmPathParam>,
    body: TypedBody<MigrateSendBody>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let engine = rqctx.context().clone();
    let vm = path_params.into_inner().vm;
    let body = body.into_inner();
    let opctx = new_opctx(&rqctx, "VM.assert_can_migrate").await?;
    engine
        .assert_can_migrate(
            &opctx,
            vm,
            &body.dest,
            body.live,
            body.vdi_map,
            body.vif_map,
            body.vgpu_map,
            &body.options,
        )
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

/// Live-migrate a VM's memory to another host in this cluster; its
/// storage stays put.
#[endpoint {
    method = POST,
    path = "/vms/{vm}/pool-migrate",
}]
async fn vm_pool_migrate(
    rqctx: RequestContext<Arc<Engine>>,
    path_params: Path<VmPathParam>,
    body: TypedBody<PoolMigrateBody>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let engine = rqctx.context().clone();
    let vm = path_params.into_inner().vm;
    let body = body.into_inner();
    let opctx = new_opctx(&rqctx, "VM.pool_migrate").await?;
    engine.pool_migrate(&opctx, vm, body.host, &body.options).await?;
    Ok(HttpResponseUpdatedNoContent())
}

/// Destination-side handler invoked once a migration has landed.
#[endpoint {
    method = POST,
    path = "/vms/{vm}/pool-migrate-complete",
}]
async fn vm_pool_migrate_complete(
    rqctx: RequestContext<Arc<Engine>>,
    path_params: Path<VmPathParam>,
    body: TypedBody<PoolMigrateCompleteBody>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let engine = rqctx.context().clone();
    let vm = path_params.into_inner().vm;
    let body = body.into_inner();
    let opctx = new_opctx(&rqctx, "VM.pool_migrate_complete").await?;
    engine.pool_migrate_complete(&opctx, vm, body.host).await?;
    Ok(HttpResponseUpdatedNoContent())
}

/// Move one disk of a running VM to another SR.
#[endpoint {
    method = POST,
    path = "/vdis/{vdi}/pool-migrate",
}]
async fn vdi_pool_migrate(
    rqctx: RequestContext<Arc<Engine>>,
    path_params: Path<VdiPathParam>,
    body: TypedBody<VdiPoolMigrateBody>,
) -> Result<HttpResponseOk<VdiPoolMigrateResponse>, HttpError> {
    let engine = rqctx.context().clone();
    let vdi = path_params.into_inner().vdi;
    let body = body.into_inner();
    let opctx = new_opctx(&rqctx, "VDI.pool_migrate").await?;
    let task = opctx.task;
    let new_vdi = engine
        .vdi_pool_migrate(&opctx, vdi, body.sr, &body.options)
        .await?;
    Ok(HttpResponseOk(VdiPoolMigrateResponse { vdi: new_vdi, task }))
}
