//! Rendering configured metrics in the Prometheus text exposition format.

use std::{
    borrow::Cow,
    fmt::{self, Write as _},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

use crate::{
    clock::{Clock, SystemClock},
    config::{Config, StateMetricConfig},
    fetcher::{Fetch, HttpFetcher},
    metrics::ExporterMetrics,
    policy::{RefreshPolicy, TotalRefresh},
    store::{Measurement, MeasurementStore},
};


const TOTAL_GAUGE: &str = "covid_de_total";
const STATES_GAUGE: &str = "covid_de_states";

/// Refreshes stale measurements and renders all metrics.
///
/// All scrapes are serialized: the measurement store is locked for the entire refresh-and-render
/// pass, so concurrent scrapes never observe (or produce) partially updated measurements.
pub struct Renderer<F = HttpFetcher> {
    default_ttl: Duration,
    total_url: String,
    states: Vec<StateMetricConfig>,
    export_self_metrics: bool,
    store: Mutex<MeasurementStore>,
    fetcher: F,
    clock: Arc<dyn Clock>,
    metrics: ExporterMetrics,
}

impl<F> fmt::Debug for Renderer<F> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Renderer")
            .field("default_ttl", &self.default_ttl)
            .field("total_url", &self.total_url)
            .field("states", &self.states)
            .field("export_self_metrics", &self.export_self_metrics)
            .finish_non_exhaustive()
    }
}

impl Renderer {
    /// Creates a renderer fetching upstream sources over HTTP with the configured timeout.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config, HttpFetcher::new(config.fetch_timeout))
    }
}

impl<F: Fetch> Renderer<F> {
    /// Creates a renderer with the specified fetcher. All measurements start at zero
    /// and are stale, so the first scrape fetches every source.
    pub fn new(config: &Config, fetcher: F) -> Self {
        let states = config.metrics.states.clone();
        let store = MeasurementStore::new(states.iter().map(|state| state.name.as_str()));
        Self {
            default_ttl: config.default_ttl,
            total_url: config.metrics.total.clone(),
            states,
            export_self_metrics: config.self_metrics,
            store: Mutex::new(store),
            fetcher,
            clock: Arc::new(SystemClock),
            metrics: ExporterMetrics::new(),
        }
    }

    /// Replaces the clock used to check TTLs.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Returns the fetcher used by this renderer.
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Number of configured state metrics.
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Returns the current measurement for `name` without refreshing it.
    pub async fn measurement(&self, name: &str) -> Option<Measurement> {
        self.store.lock().await.get(name).cloned()
    }

    /// Refreshes stale measurements and renders all metrics.
    pub async fn render(&self) -> String {
        let started_at = Instant::now();
        let mut buffer = String::with_capacity(128 + 64 * self.states.len());
        {
            let mut store = self.store.lock().await;
            let policy = RefreshPolicy::new(&self.fetcher, &self.metrics, self.clock.now());

            let total = policy
                .refresh_total(&mut store, &self.total_url, self.default_ttl)
                .await;
            Self::write_totals(&mut buffer, &total).unwrap();
            // ^ `unwrap()` is safe; writing to a string never fails.

            writeln!(buffer, "# TYPE {STATES_GAUGE} gauge").unwrap();
            for state in &self.states {
                policy
                    .refresh_state(&mut store, state, self.default_ttl)
                    .await;
                let value = store.get(&state.name).map_or("0", |m| m.value.as_str());
                Self::write_state(&mut buffer, &state.name, value).unwrap();
            }
        }

        let latency = started_at.elapsed();
        self.metrics.observe_scrape(latency);
        tracing::debug!(
            latency_sec = latency.as_secs_f64(),
            scraped_size = buffer.len(),
            "Rendered {} state metrics in {latency:?}",
            self.states.len()
        );

        if self.export_self_metrics {
            if let Err(err) = self.metrics.encode(&mut buffer) {
                tracing::warn!(%err, "Failed encoding exporter metrics");
            }
        }
        buffer
    }

    fn write_totals(buffer: &mut String, total: &TotalRefresh) -> fmt::Result {
        writeln!(buffer, "# TYPE {TOTAL_GAUGE} gauge")?;
        // Per-category lines are only emitted right after a successful fetch, never from cache.
        if let TotalRefresh::Refreshed(payload) = total {
            for (category, count) in &payload.current_totals {
                let category = escape_label_value(category);
                writeln!(buffer, "{TOTAL_GAUGE}{{type=\"{category}\"}} {count}")?;
            }
            writeln!(buffer)?;
        }
        Ok(())
    }

    fn write_state(buffer: &mut String, name: &str, value: &str) -> fmt::Result {
        let name = escape_label_value(name);
        writeln!(buffer, "{STATES_GAUGE}{{state=\"{name}\"}} {value}")
    }
}

/// Escapes `\`, `"` and line feeds as required for label values by the text exposition format.
fn escape_label_value(value: &str) -> Cow<'_, str> {
    if !value.contains(['\\', '"', '\n']) {
        return Cow::Borrowed(value);
    }

    let mut escaped = String::with_capacity(value.len() + 2);
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str(r"\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str(r"\n"),
            _ => escaped.push(ch),
        }
    }
    Cow::Owned(escaped)
}
