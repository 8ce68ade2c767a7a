#![forbid(unsafe_code)]

use qcon_controller::{start_server, ControllerConfig};
use tracing_subscriber::EnvFilter;

/// `EX_SOFTWARE`: the idle reaper is gone and instances would leak.
const REAPER_DIED_EXIT_CODE: i32 = 70;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControllerConfig::load();

    let default_level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut handle = start_server(config).await?;
    tracing::info!(
        "qcon-controller listening on http://{}",
        handle.local_addr()
    );

    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
        result = handle.reaper_stopped() => {
            match result {
                Ok(()) => tracing::error!("idle reaper exited"),
                Err(err) => tracing::error!("idle reaper died: {err}"),
            }
            handle.controller().shutdown().await;
            std::process::exit(REAPER_DIED_EXIT_CODE);
        }
    }

    tracing::info!("shutdown signal received");
    handle.shutdown().await;
    Ok(())
}
