// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for the HIDL service manager daemon.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for the HIDL service manager daemon.

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use log::LevelFilter;

use hwservicemanager::bootstrap::EXIT_FAILURE;
use hwservicemanager::config::{PublisherKind, ReadinessSection, TransportKind};
use hwservicemanager::loopback::{LoopbackKernel, LoopbackTransport};
use hwservicemanager::readiness::{FilePublisher, NullPublisher, SetpropPublisher};
use hwservicemanager::transport::UnavailableTransport;
use hwservicemanager::{
    BootSettings, Bootstrap, Config, DefaultCollaborators, IpcTransport, KernelControl,
    LoopPolicy, Looper, ReadinessPublisher, Terminal,
};

/// Environment variable naming the configuration file.
const CONFIG_ENV: &str = "HWSERVICEMANAGER_CONFIG";
/// Configuration read when neither the flag nor the environment names one.
const DEFAULT_CONFIG_PATH: &str = "/system/etc/hwservicemanager.toml";

/// HIDL service manager command-line arguments.
#[derive(Debug, Parser)]
#[command(author = "Lukas Bower", version, about = "HIDL service manager", long_about = None)]
struct Cli {
    /// Configuration file (falls back to $HWSERVICEMANAGER_CONFIG).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the configured transport.
    #[arg(long, value_enum)]
    transport: Option<TransportKind>,

    /// Override the hwbinder device node.
    #[arg(long, value_name = "PATH")]
    device: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Load and validate the configuration, print it and exit.
    #[arg(long)]
    check_config: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    if let Ok(value) = env::var(CONFIG_ENV) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    let fallback = Path::new(DEFAULT_CONFIG_PATH);
    fallback.is_file().then(|| fallback.to_path_buf())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match config_path(cli) {
        Some(path) => {
            log::debug!("[main] config {}", path.display());
            Config::load(&path)?
        }
        None => Config::default(),
    };
    if let Some(kind) = cli.transport {
        config.transport.kind = kind;
    }
    if let Some(device) = &cli.device {
        config.transport.device = device.clone();
    }
    config.validate()?;
    Ok(config)
}

fn publisher(readiness: &ReadinessSection) -> Box<dyn ReadinessPublisher> {
    match readiness.publisher {
        PublisherKind::Setprop => Box::new(SetpropPublisher::new(&readiness.setprop)),
        PublisherKind::File => Box::new(FilePublisher::new(&readiness.file)),
        PublisherKind::None => Box::new(NullPublisher),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn serve<T, K>(
    settings: BootSettings,
    transport: Rc<T>,
    kernel: K,
    publisher: Box<dyn ReadinessPublisher>,
) -> ExitCode
where
    T: IpcTransport + 'static,
    K: KernelControl,
{
    use hwservicemanager::looper::EpollBackend;

    let mut collaborators = DefaultCollaborators::new();
    let looper = Looper::new(EpollBackend::new());
    let bootstrap = Bootstrap::new(settings, transport, kernel, publisher, looper);
    match bootstrap.run(&mut collaborators, LoopPolicy::Forever) {
        Ok(report) => match report.terminal {
            Terminal::Idle(idle) => idle.hold(),
            Terminal::LoopEnded { iterations } => {
                log::warn!("[main] event loop ended after {iterations} iterations");
                ExitCode::SUCCESS
            }
        },
        Err(err) => {
            log::error!("[main] {err}");
            ExitCode::from(err.exit_status())
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn run(cli: &Cli) -> Result<ExitCode> {
    use hwservicemanager::binder::BinderDevice;

    let config = load_config(cli)?;
    if cli.check_config {
        print!("{}", config.render()?);
        return Ok(ExitCode::SUCCESS);
    }

    let settings = BootSettings::from_config(&config);
    let publisher = publisher(&config.readiness);
    let code = match config.transport.kind {
        TransportKind::Hwbinder => match BinderDevice::open(&config.transport.device) {
            Ok(device) => {
                let device = Rc::new(device);
                serve(settings, Rc::clone(&device), device, publisher)
            }
            Err(err) => {
                log::error!("[main] {err}");
                let transport = Rc::new(UnavailableTransport::new());
                serve(settings, Rc::clone(&transport), transport, publisher)
            }
        },
        TransportKind::Loopback => {
            let (transport, _injector) = LoopbackTransport::new()?;
            log::info!("[main] serving on loopback transport");
            serve(settings, Rc::new(transport), LoopbackKernel::new(), publisher)
        }
    };
    Ok(code)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn run(cli: &Cli) -> Result<ExitCode> {
    let config = load_config(cli)?;
    if cli.check_config {
        print!("{}", config.render()?);
        return Ok(ExitCode::SUCCESS);
    }
    anyhow::bail!("hwservicemanager needs epoll; this platform is unsupported")
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            log::error!("[main] {err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
