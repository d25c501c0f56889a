//! keycap daemon
//!
//! Captures keyboards and remaps keys according to a mapping table. Capture is
//! started and stopped over the control socket, or at startup via `autostart`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use keycap_daemon::hook::grab::EvdevHook;
use keycap_daemon::ipc::{handle_ipc_connection, IpcServer, REQUEST_TIMEOUT};
use keycap_daemon::{CaptureEngine, EngineOptions, Injector, VirtualDevice};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "keycapd")]
#[command(about = "Keyboard capture and remapping daemon")]
#[command(version)]
struct Args {
    /// Path to settings file
    #[arg(short, long)]
    settings: Option<String>,

    /// Mapping file to capture with at startup (overrides `autostart`)
    #[arg(short, long)]
    capture: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings_path: PathBuf = match &args.settings {
        Some(path) => shellexpand::tilde(path).into_owned().into(),
        None => keycap_config::default_settings_path(),
    };
    let settings = keycap_config::load_settings(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;

    // RUST_LOG wins over the settings file
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.global.log_level.as_filter())),
        )
        .init();

    tracing::info!("Loaded settings from {}", settings_path.display());

    let device = VirtualDevice::new(&settings.global.virtual_device_name)
        .context("Failed to create virtual device (is /dev/uinput writable?)")?;
    let injector = Injector::new(device);
    let hook = EvdevHook::new(
        settings.capture.devices.clone(),
        settings.global.virtual_device_name.clone(),
    );
    let mut engine = CaptureEngine::new(
        hook,
        injector,
        EngineOptions {
            delay_unit: settings.global.delay_unit,
        },
    );

    let startup: Option<PathBuf> = args
        .capture
        .map(|path| shellexpand::tilde(&path).into_owned().into())
        .or(settings.capture.autostart.clone());
    if let Some(path) = startup {
        let result = engine.load_file_and_capture(&path).await;
        if result.is_success() {
            tracing::info!("Started capture with {}", path.display());
        } else {
            tracing::warn!("Could not start capture with {}: {}", path.display(), result);
        }
    }

    let server = IpcServer::bind(settings.global.socket_path.clone())?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tracing::info!("keycap daemon running");

    loop {
        tokio::select! {
            stream = server.accept() => match stream {
                Ok(stream) => {
                    let handled = handle_ipc_connection(stream, &mut engine, REQUEST_TIMEOUT).await;
                    if let Err(e) = handled {
                        tracing::warn!("IPC connection failed: {:#}", e);
                    }
                }
                Err(e) => tracing::warn!("{:#}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
                break;
            }
        }
    }

    tracing::info!("Shutting down...");
    engine.shutdown().await;

    Ok(())
}
