//! HTTP API server command.

use clap::Args;
use std::net::SocketAddr;
use std::sync::Arc;

use dockvm::api::state::ApiState;
use dockvm::vm::{PortForward, SupervisorOptions};
use dockvm::{DockvmConfig, Error, Result, Supervisor};

use crate::cli::parsers::parse_port;

/// Start the HTTP API server for programmatic control.
#[derive(Args, Debug)]
#[command(about = "Start the HTTP API server for programmatic VM management")]
#[command(after_long_help = "\
The VM lives as long as the server: it is stopped when the server shuts down.

API ENDPOINTS:
  GET    /health                  Health check
  GET    /api/v1/vm               Status (phase, uptime, cpu, memory)
  POST   /api/v1/vm/initialize    Prepare disk and boot media
  POST   /api/v1/vm/start         Start ({\"ram_mb\": 2048, \"cpus\": 2})
  POST   /api/v1/vm/stop          Stop
  POST   /api/v1/vm/restart       Restart with the last resources
  POST   /api/v1/vm/exec          Run a command ({\"command\": \"info status\"})
  GET    /api/v1/vm/logs?lines=N  Last N console lines
  GET    /api/v1/vm/events        Lifecycle events (SSE, ?kind=transition|log)

EXAMPLES:
  dockvm serve                         Listen on 127.0.0.1:8090 (default)
  dockvm serve -l 0.0.0.0:9000         Listen on all interfaces, port 9000")]
pub struct ServeCmd {
    /// Address and port to listen on
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:8090",
        value_name = "ADDR:PORT"
    )]
    listen: String,

    /// Port forward, replaces the configured list (repeatable)
    #[arg(short = 'p', long = "port", value_parser = parse_port, value_name = "[PROTO/]HOST:GUEST")]
    ports: Vec<PortForward>,
}

impl ServeCmd {
    /// Run the serve command.
    pub fn run(self, config: &DockvmConfig) -> Result<()> {
        let addr: SocketAddr = self.listen.parse().map_err(|e| {
            Error::invalid_config(format!("invalid listen address '{}': {}", self.listen, e))
        })?;

        let mut options = SupervisorOptions::from_config(config)?;
        if !self.ports.is_empty() {
            options.port_forwards = self.ports;
        }
        let supervisor = Arc::new(Supervisor::new(options));
        let state = Arc::new(ApiState::new(
            supervisor.clone(),
            config.default_resources(),
            config.timings.command_timeout,
        ));

        let runtime = crate::cli::runtime()?;
        runtime.block_on(run_server(addr, state))?;

        // Runs outside the runtime: stop blocks on signal waits.
        if let Err(e) = supervisor.stop() {
            tracing::warn!(error = %e, "failed to stop vm on shutdown");
        }
        Ok(())
    }
}

async fn run_server(addr: SocketAddr, state: Arc<ApiState>) -> Result<()> {
    // Security warning if binding to all interfaces
    if addr.ip().is_unspecified() {
        eprintln!(
            "WARNING: Server is listening on all interfaces ({}).",
            addr.ip()
        );
        eprintln!("         The API has no authentication - any network client can control the VM.");
        eprintln!("         Consider using --listen 127.0.0.1:8090 for local-only access.");
    }

    let app = dockvm::api::create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(Error::Io)?;

    tracing::info!(address = %addr, "starting HTTP API server");
    println!("dockvm API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            crate::cli::shutdown_signal().await;
            eprintln!("\nShutting down server (stopping VM)...");
        })
        .await
        .map_err(Error::Io)?;

    Ok(())
}
