// sip-pex - I2C port extender plugin for the SIP irrigation controller
// Serves the settings page and maps SIP station values onto port extender outputs
use anyhow::{Context, Result};
use clap::Parser;
use notify::{Config, Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::{mpsc, Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod httpd;
mod io_devices;
mod manifest;
mod page;
mod pex_config;
mod port_extender;
mod types;

use config::{Args, ServiceConfig};
use httpd::{AppState, PexState, SharedState};
use io_devices::DemoProvider;
use manifest::{Manifest, PEX_MANIFEST};
use pex_config::{PexConfig, LIBRARY_MISSING_MSG, PEX_CONFIG_FILE};
use port_extender::{validate_layout, Coverage, PortExtender};
use types::PexStatus;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// True for events that create or change pex_config.json inside the watched directory
fn touches_pex_config(event: &NotifyEvent) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name().is_some_and(|name| name == PEX_CONFIG_FILE))
}

/// Watch the data directory and reload pex_config.json when another process edits it.
/// Rename-over-save replaces the file, so the watch sits on the directory.
fn spawn_config_watcher(state: SharedState, handle: tokio::runtime::Handle) -> Result<()> {
    let data_dir = state.data_dir.clone();
    let config_path = PexConfig::path_in(&data_dir);

    std::thread::spawn(move || -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = match RecommendedWatcher::new(tx, Config::default()) {
            Ok(w) => w,
            Err(e) => {
                warn!("Config watcher unavailable: {}", e);
                return Ok(());
            }
        };

        if let Err(e) = watcher.watch(&data_dir, RecursiveMode::NonRecursive) {
            warn!("Cannot watch {}: {}", data_dir.display(), e);
            return Ok(());
        }

        loop {
            match rx.recv() {
                Ok(Ok(event)) => {
                    if touches_pex_config(&event) {
                        match handle.block_on(state.reload_from_disk()) {
                            Ok(true) => info!("Reloaded {}", config_path.display()),
                            Ok(false) => {}
                            Err(e) => warn!("Ignoring unreadable {}: {:#}", config_path.display(), e),
                        }
                    }
                }
                Ok(Err(e)) => warn!("Config watcher error: {}", e),
                Err(_) => break,
            }
        }
        Ok(())
    });

    Ok(())
}

fn load_service_config(args: &Args) -> Result<ServiceConfig> {
    let cfg_arg = args.cfg.as_deref();
    let config_path = ServiceConfig::config_path(cfg_arg)?;
    let config_file_exists = config_path.exists();

    let mut service = if config_file_exists {
        ServiceConfig::load_with_path(cfg_arg)
            .with_context(|| format!("Please fix or delete {} to regenerate defaults", config_path.display()))?
    } else {
        let mut default_config = ServiceConfig::default();
        default_config.config_path = Some(config_path.clone());
        default_config
    };

    // Save only on first run or when command-line args changed something
    let args_provided = service.merge_with_args(args);
    if !config_file_exists || args_provided {
        service.save()?;
    }

    info!("Using config file: {}", config_path.display());
    Ok(service)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    // Set global config path immediately (before any config loads)
    ServiceConfig::set_config_path(args.cfg.clone());

    let manifest = Manifest::parse(PEX_MANIFEST).context("Bundled manifest is malformed")?;
    if args.manifest {
        print!("{}", manifest);
        return Ok(());
    }
    if let Some(ref target) = args.install {
        info!("Installing {}", manifest.header("Description").unwrap_or("plugin"));
        let report = manifest.install(&args.source, target)?;
        info!(
            "Installed {} file(s) into {}, skipped {:?}",
            report.installed.len(),
            target.display(),
            report.skipped
        );
        return Ok(());
    }

    let service = load_service_config(&args)?;
    let stations = service.stations();
    if stations.is_empty() {
        warn!("No SIP stations configured, outputs will never be driven");
    }

    let extender = PortExtender::new(io_devices::hardware_provider(), Arc::new(DemoProvider));
    if !extender.bus_library_available() {
        warn!("{}", LIBRARY_MISSING_MSG);
        warn!("I2C support is not compiled in, hardware outputs will NOT be driven (build with --features rpi)");
    }

    let mut pex_config = PexConfig::load_or_create(&service.data_dir)?;

    // Station count changed while we were not running
    if pex_config.num_sip_stations != stations.len() && pex_config.auto_configure {
        if let Err(e) = extender.autoconfigure(&mut pex_config, stations.len()) {
            error!("PEX: autoconfigure failed: {}", e);
            pex_config.warnmsg = e.to_string();
        }
    }
    if pex_config.pex_status.is_enabled()
        && validate_layout(&pex_config.dev_configs, stations.len()) != Ok(Coverage::Complete)
    {
        warn!("PEX: device layout does not match {} stations, needs to be configured", stations.len());
        pex_config.pex_status = PexStatus::Unconfigured;
    }
    pex_config.save_to(&PexConfig::path_in(&service.data_dir))?;

    info!(
        "PEX {} with {} device(s) for {} stations{}",
        pex_config.pex_status,
        pex_config.dev_configs.len(),
        stations.len(),
        if pex_config.demo_mode { " (demo mode)" } else { "" }
    );

    let rt = tokio::runtime::Runtime::new()?;
    let state = AppState::new(
        PexState { config: pex_config, stations, extender },
        service.data_dir.clone(),
        service.clone(),
    );

    spawn_config_watcher(state.clone(), rt.handle().clone())?;

    rt.block_on(async {
        tokio::select! {
            result = httpd::run_http_server(
                state,
                service.httpd_ip.clone(),
                service.httpd_port,
                service.static_dir.clone(),
            ) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                Ok(())
            }
        }
    })
}
