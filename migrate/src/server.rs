// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library interface to the migration engine's HTTP server.

use crate::app::Engine;
use crate::config::Config;
use slog::{info, Logger};
use std::net::SocketAddr;
use std::sync::Arc;

pub struct Server {
    http_server: dropshot::HttpServer<Arc<Engine>>,
}

impl Server {
    /// Starts serving the migration API from an already-wired engine.
    pub fn start(
        engine: Arc<Engine>,
        config: &Config,
        log: &Logger,
    ) -> Result<Server, String> {
        info!(log, "starting migration engine server");
        let dropshot_log = log.new(slog::o!("component" => "dropshot"));
        let http_server = dropshot::HttpServerStarter::new(
            &config.dropshot,
            crate::http_entrypoints::api(),
            engine,
            &dropshot_log,
        )
        .map_err(|e| format!("initializing server: {}", e))?
        .start();
        Ok(Server { http_server })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.http_server.local_addr()
    }

    /// Waits for the server to exit; only fails on an abnormal
    /// shutdown.
    pub async fn wait_for_finish(self) -> Result<(), String> {
        self.http_server.await
    }
}

/// Runs the development server: the engine wired to the simulated
/// collaborators from [`crate::sim`].  Production deployments embed
/// [`Engine`] directly and wire concrete transports instead.
pub async fn run_server(config: &Config) -> Result<(), String> {
    let log = config
        .log
        .to_logger("apiary-migrated")
        .map_err(|message| format!("initializing logger: {}", message))?;
    let world = crate::sim::development(log.clone()).await;
    let server = Server::start(world.engine.clone(), config, &log)?;
    info!(log, "listening"; "local_addr" => %server.local_addr());
    server.wait_for_finish().await
}
