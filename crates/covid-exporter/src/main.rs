//! `covid-de-exporter`: serves COVID-DE case counts as Prometheus metrics.
//!
//! # Usage
//!
//! ```text
//! covid-de-exporter --config /etc/covid-exporter/config.yml
//! ```

use std::{future, path::PathBuf};

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use covid_exporter::{Config, MetricsExporter};

#[derive(Debug, Parser)]
#[command(name = "covid-de-exporter", about = "Prometheus exporter for COVID-DE case counts")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short, default_value = "config.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("cannot load config from `{}`", cli.config.display()))?;
    let bind_address = config.listen_address()?;

    tracing::info!(
        %bind_address,
        states = config.metrics.states.len(),
        "Started COVID-DE exporter"
    );
    MetricsExporter::from_config(&config)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(%err, "Failed listening to Ctrl+C signal");
                future::pending::<()>().await;
            }
        })
        .start(bind_address)
        .await
        .with_context(|| format!("cannot serve metrics on {bind_address}"))
}
