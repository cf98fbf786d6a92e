//! Prometheus exporter republishing COVID-19 case counts for Germany.
//!
//! The exporter reads JSON documents from a set of upstream endpoints (one with nationwide totals
//! broken down by category, and one per federal state) and serves the latest values as gauges
//! in the Prometheus text format. Upstream sources are fetched lazily: a scrape refreshes
//! only the measurements whose TTL has elapsed, and serves the remaining ones from memory.
//!
//! # Exported metrics
//!
//! - `covid_de_total{type="..."}`: nationwide totals per category. Only emitted by the scrape
//!   that refreshed totals; cached scrapes emit just the `# TYPE` header.
//! - `covid_de_states{state="..."}`: latest value per configured state.
//! - `covid_exporter_*`: exporter self-metrics (fetch and scrape latencies, fetch outcomes);
//!   opt-in via [`Config::self_metrics`].
//!
//! # Examples
//!
//! ```no_run
//! use covid_exporter::{Config, MetricsExporter};
//! # use std::path::Path;
//!
//! # async fn test_wrapper() -> anyhow::Result<()> {
//! let config = Config::load(Path::new("config.yml"))?;
//! let bind_address = config.listen_address()?;
//! MetricsExporter::from_config(&config)
//!     .with_graceful_shutdown(async {
//!         tokio::signal::ctrl_c().await.ok();
//!     })
//!     .start(bind_address)
//!     .await?;
//! # Ok(())
//! # }
//! ```

// Linter settings.
#![warn(missing_debug_implementations, missing_docs, bare_trait_objects)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::must_use_candidate, clippy::module_name_repetitions)]

pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    config::{Config, ConfigError, MetricsConfig, StateMetricConfig},
    exporter::{MetricsExporter, MetricsServer, METRICS_PATH, TEXT_CONTENT_TYPE},
    fetcher::{Fetch, FetchError, HttpFetcher, MAX_REDIRECTS},
    payload::{Counts, RemoteStatesPayload, RemoteTotalsPayload},
    renderer::Renderer,
    store::{Measurement, MeasurementStore, TOTAL_METRIC},
};

mod clock;
mod config;
mod exporter;
mod fetcher;
mod metrics;
mod payload;
mod policy;
mod renderer;
mod store;
