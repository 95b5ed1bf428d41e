use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod api;
mod config;

use config::ServerConfig;

const DEFAULT_LOG_FILTER: &str = "procflow=info,procflow_core=info,tower_http=debug";

#[derive(Parser, Debug)]
#[command(name = "procflow")]
#[command(about = "Procflow - workflow execution engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "PROCFLOW_CONFIG", default_value = "procflow.toml")]
    config: PathBuf,

    /// Host to bind to
    #[arg(long, env = "PROCFLOW_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "PROCFLOW_PORT", default_value = "8080")]
    port: u16,

    /// Emit logs as JSON lines
    #[arg(long, env = "PROCFLOW_JSON_LOGS")]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if json {
        builder.json().with_current_span(false).init();
    } else {
        builder.with_file(true).with_line_number(true).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = ServerConfig::load(&args.config)?;
    tracing::info!(
        "Starting procflow {} (storage: {:?}, definitions: {})",
        env!("CARGO_PKG_VERSION"),
        config.storage.backend,
        config
            .definitions_dir
            .as_ref()
            .map_or_else(|| "none".to_string(), |dir| dir.display().to_string()),
    );

    let addr = format!("{}:{}", args.host, args.port);
    api::serve(&addr, config).await
}
