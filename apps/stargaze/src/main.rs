mod cli;
mod commands;
mod config;
mod session;
mod telemetry;

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use commands::Backend;
use config::AppConfig;
use tracing::debug;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let cfg = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let _log_guard =
        telemetry::init_tracing(cfg.log_filter.as_deref(), cfg.log_path.as_deref().map(Path::new))?;
    debug!(
        backend = ?cfg.backend,
        transport = ?cfg.transport,
        control = ?cfg.control,
        "configuration loaded"
    );

    let backend = Backend::from_config(&cfg)?;
    let outcome = commands::run(cli.command, &cfg, &backend).await;
    if cli.print_metrics {
        print!("{}", scope_session::metrics::gather());
    }
    outcome
}
