//! HTTP API server command.

use super::parsers::parse_listen;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;

use snapvisor::api::state::ApiState;
use snapvisor::config::SnapvisorConfig;
use snapvisor::Result;

/// Start the HTTP API server.
#[derive(Parser, Debug)]
#[command(about = "Start the HTTP API server for snapshot and clone operations")]
#[command(after_long_help = "\
Operations run under the session named by the x-session-id header. Closing a
session's event stream releases every lock the session still holds.

API ENDPOINTS:
  GET    /health                                   Health check
  GET    /api/v1/events                            Event stream (SSE)
  GET    /api/v1/vms                               List VMs
  GET    /api/v1/vms/:id/locks                     Exclusive operations held
  GET    /api/v1/vms/:id/snapshots                 Snapshot tree
  POST   /api/v1/vms/:id/snapshots                 Take snapshot
  DELETE /api/v1/vms/:id/snapshots/:guid           Delete snapshot (?child=true)
  POST   /api/v1/vms/:id/snapshots/:guid/revert    Revert (?skip_resume=true)
  POST   /api/v1/vms/:id/clone                     Clone VM

EXAMPLES:
  snapvisor serve                         Listen on the configured address
  snapvisor serve -l 0.0.0.0:9000         Listen on all interfaces, port 9000")]
pub struct ServeCmd {
    /// Address and port to listen on (default: from config)
    #[arg(short, long, value_name = "ADDR:PORT", value_parser = parse_listen)]
    listen: Option<SocketAddr>,
}

impl ServeCmd {
    /// Run the serve command.
    pub fn run(self, config: SnapvisorConfig) -> Result<()> {
        let addr = match self.listen {
            Some(addr) => addr,
            None => parse_listen(&config.listen).map_err(snapvisor::Error::Config)?,
        };

        // Create the runtime with signal handling enabled
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(snapvisor::Error::Io)?;

        runtime.block_on(async move { run_server(config, addr).await })
    }
}

async fn run_server(config: SnapvisorConfig, addr: SocketAddr) -> Result<()> {
    // Security warning if binding to all interfaces
    if addr.ip().is_unspecified() {
        eprintln!(
            "WARNING: Server is listening on all interfaces ({}).",
            addr.ip()
        );
        eprintln!("         The API has no authentication - any network client can snapshot and clone VMs.");
        eprintln!("         Consider using --listen 127.0.0.1:8090 for local-only access.");
    }

    let state = Arc::new(ApiState::from_config(config)?);
    let vms = state.ctx().catalogue.list().len();

    let app = snapvisor::api::create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(snapvisor::Error::Io)?;

    tracing::info!(address = %addr, vms, "starting HTTP API server");
    println!("snapvisor API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(snapvisor::Error::Io)?;

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "failed to install signal handler");
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

    tracing::info!("shutdown signal received");
    eprintln!("\nShutting down server...");
}
