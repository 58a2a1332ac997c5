use crate::ui;
use anyhow::{Context, Result};
use stagewatch_config::{parse_config_from_file, StagewatchConfig};
use stagewatch_server::Runtime;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;

const ENDPOINTS: &[(&str, &str)] = &[
    ("/metrics", "exposition text"),
    ("/metrics/json", "JSON snapshot"),
    ("/slos", "SLO compliance"),
    ("/traces", "trace continuity report"),
    ("/traces/{id}", "single trace"),
    ("/healthz", "liveness"),
    ("/readyz", "readiness"),
];

pub async fn execute(config_file: Option<PathBuf>, port: Option<u16>) -> Result<()> {
    let mut config = match &config_file {
        Some(path) => parse_config_from_file(path).await?,
        None => {
            info!("No config file given, using defaults");
            StagewatchConfig::default()
        }
    };

    if let Some(port) = port {
        info!(port, "Overriding configured port");
        config.server.port = port;
    }

    let addr = config.server.socket_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let runtime = Runtime::start(config, listener)?;

    ui::print_header("Stagewatch");
    ui::print_field("Listening on", runtime.local_addr());
    for (path, what) in ENDPOINTS {
        println!("    GET {:<14} {}", path, what);
    }
    println!("\nPress Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    runtime.shutdown().await?;
    ui::print_success("Stopped");
    Ok(())
}
