// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
#![allow(
    clippy::doc_markdown,
    reason = "Docs here are not used by rustdoc, they are used by clap for CLI help"
)]

use std::{fs, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use log::{LevelFilter, info, warn};
use serde::Deserialize;
use swupd::{InventoryRecord, SoftwareManager};

/// BMC firmware-update control plane for board CPLDs
///
/// Enumerates the updatable CPLD devices declared by the board inventory
/// manifest, publishes their running firmware versions and serves PLDM
/// firmware update packages into them over I2C.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the board inventory manifest (TOML)
    #[arg(short, long)]
    inventory: PathBuf,

    /// Service name suffix published after enumeration
    #[arg(long, default_value = "CPLDSoftwareManager")]
    service_suffix: String,

    /// Verbosity level, use more for more verbosity
    ///
    /// -v means info, -vv means debug and -vvv and more is trace level. If RUST_LOG environment
    /// variable is set, it overrides this option. For more documentation about it, refer to
    /// env_logger crate.
    #[arg(short, long, action = clap::ArgAction::Count, default_value_t = 0)]
    verbose: u8,
}

#[derive(Deserialize, Debug)]
struct Inventory {
    #[serde(default)]
    device: Vec<InventoryRecord>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::builder()
        .filter_level(match args.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .parse_default_env()
        .init();

    let manifest = fs::read_to_string(&args.inventory)
        .with_context(|| format!("could not read inventory manifest {:?}", args.inventory))?;
    let inventory: Inventory =
        toml::from_str(&manifest).context("could not parse inventory manifest")?;

    // All device update tasks multiplex on one thread; the byte-level bus
    // latency is bounded, so blocking transfers are tolerable.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .enable_io()
        .build()
        .context("could not build the runtime")?;

    runtime.block_on(async {
        let mut manager = SoftwareManager::new(&args.service_suffix);
        manager.init_devices(&inventory.device).await;

        if manager.device_count() == 0 {
            warn!("no usable devices were configured");
        }
        info!(
            "serving {} device(s) as {}",
            manager.device_count(),
            manager.service_name()
        );

        tokio::signal::ctrl_c()
            .await
            .context("could not wait for shutdown")?;
        info!("shutting down, waiting for in-flight updates");
        manager.wait_for_updates().await;
        Ok(())
    })
}
