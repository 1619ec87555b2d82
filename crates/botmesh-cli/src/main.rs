//! `botmesh-proxy` – runs the HTTP to MQTT message proxy.
//!
//! 1. Initialises tracing (see [`telemetry`]).
//! 2. Loads `~/.botmesh/proxy.toml` plus `BOTMESH_*` overrides.
//! 3. Starts the proxy and serves until Ctrl-C or SIGTERM.
//!
//! A startup failure (port in use, unusable default broker) exits with
//! status 1.

mod config;
mod telemetry;

use std::process::ExitCode;

use botmesh_proxy::{MessageProxy, ProxyConfig};
use botmesh_types::ProxyError;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let _guard = telemetry::init_tracing("botmesh-proxy");

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, path = %config::config_path().display(), "configuration rejected");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "message proxy terminated");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: ProxyConfig) -> Result<(), ProxyError> {
    info!(
        listen_port = cfg.listen_port,
        broker = %cfg.broker.identity(),
        "starting message proxy"
    );
    let mut proxy = MessageProxy::new(cfg)?;
    proxy.start().await?;
    proxy.serve_until(shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
}
