//! Anneal - Firmware restore orchestrator
//!
//! The restore driver itself lives in this crate as a library; the binary
//! is a thin inspection shell. Device transports, the ticket authority
//! HTTP client, and the filesystem streamer are supplied by integrations
//! through the driver's collaborator traits.

use anneal_core::archive::FirmwareArchive;
use anneal_core::manifest::{BuildManifest, RestoreVariant};
use anneal_daemon::config;
use anneal_daemon::options::{build_restore_options, OptionsInputs};
use anyhow::{Context, Result};
use clap::Parser;
use plist::Value;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "anneal")]
#[command(about = "Firmware restore session driver for mobile devices")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "anneal.toml")]
    config: PathBuf,

    /// Path to the firmware archive
    #[arg(short, long)]
    archive: PathBuf,

    /// Hardware model of the target device (e.g. n71ap)
    #[arg(short, long)]
    model: String,

    /// Select the erase-install variant
    #[arg(long)]
    erase: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Dump the assembled restore options dictionary
    #[arg(long)]
    dump_options: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Anneal v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config(&args.config)?;
    let erase = args.erase || config.restore.erase;

    let archive = FirmwareArchive::open(&args.archive)
        .with_context(|| format!("unable to open firmware archive {}", args.archive.display()))?;
    let manifest_data = archive
        .extract_to_memory("BuildManifest.plist")
        .context("archive has no BuildManifest.plist")?;
    let manifest = BuildManifest::from_bytes(&manifest_data)?;

    if let Some(version) = manifest.product_version() {
        info!(version, "Firmware archive loaded");
    }

    let variant = if erase {
        RestoreVariant::Erase
    } else {
        RestoreVariant::Upgrade
    };
    let identity = manifest
        .identity_for(&args.model, variant)
        .context("no matching build identity")?;
    info!(
        model = %args.model,
        variant = variant.label(),
        device_class = identity.device_class().unwrap_or("?"),
        "Selected build identity"
    );

    for component in ["LLB", "iBoot", "KernelCache", "DeviceTree", "SEP", "BasebandFirmware"] {
        match identity.component_path(component) {
            Ok(path) => info!(component, path = %path, "Component resolved"),
            Err(_) => info!(component, "Component not present in this build"),
        }
    }

    if args.dump_options {
        let session_uuid = uuid::Uuid::new_v4().to_string().to_uppercase();
        let options = build_restore_options(&OptionsInputs {
            identity: &identity,
            preflight_info: None,
            restore_boot_args: config.restore.boot_args.as_deref(),
            erase,
            session_uuid: &session_uuid,
        });
        let mut out = Vec::new();
        Value::Dictionary(options).to_writer_xml(&mut out)?;
        println!("{}", String::from_utf8_lossy(&out));
    }

    Ok(())
}
