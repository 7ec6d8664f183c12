use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod encoder;
mod errors;
mod filter;
mod mjpeg;
mod queue;
mod sink;
mod stream;
mod supervisor;
mod utils;

use config::Config;

#[derive(Parser, Debug)]
#[command(version, about = "Records MJPEG camera streams into rotating video segments")]
struct Args {
    /// Configuration file (TOML, or JSON when the extension is .json)
    #[arg(short, long, default_value = "/etc/mjpeg-recorder/config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let default_filter = if args.debug || config.debug {
        "mjpeg_recorder=debug,info"
    } else {
        "mjpeg_recorder=info,info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    info!(
        "Loaded configuration from {}: {} camera(s), segments of {}",
        args.config.display(),
        config.cameras.len(),
        humantime::format_duration(config.rotation_interval())
    );

    let sink = sink::build_sink(&config.sink)?;
    if let Err(e) = sink.check().await {
        warn!("Segment sink '{}' is not ready: {}", sink.name(), e);
    }

    if args.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let cameras = supervisor::spawn_cameras(Arc::new(config), sink, cancel.clone())?;

    wait_for_shutdown(&cameras).await;
    info!("Shutting down, finishing current segments");
    cancel.cancel();

    for camera in cameras {
        camera.join().await;
    }

    info!("All cameras stopped");
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM. On unix, SIGUSR1 meanwhile closes every camera's current segment.
async fn wait_for_shutdown(cameras: &[supervisor::CameraHandle]) {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::user_defined1()) {
            Ok(mut usr1) => loop {
                tokio::select! {
                    _ = &mut shutdown => return,
                    _ = usr1.recv() => {
                        info!("SIGUSR1 received, closing current segments");
                        for camera in cameras {
                            camera.request_stop();
                        }
                    }
                }
            },
            Err(e) => warn!("Failed to listen for SIGUSR1: {}", e),
        }
    }

    #[cfg(not(unix))]
    let _ = cameras;

    shutdown.await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
