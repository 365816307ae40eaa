// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run the Apiary migration engine.

use anyhow::{anyhow, Context};
use apiary_migrate::{run_server, Config};
use camino::Utf8PathBuf;
use clap::Parser;

#[derive(Debug, Parser)]
#[clap(
    name = "apiary-migrated",
    about = "Apiary VM migration engine (development server)"
)]
struct Args {
    #[clap(name = "CONFIG_FILE_PATH", action)]
    config_file_path: Utf8PathBuf,
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = Config::from_file(&args.config_file_path)
        .with_context(|| format!("reading {:?}", args.config_file_path))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    rt.block_on(async move {
        run_server(&config).await.map_err(|message| anyhow!(message))
    })
}
