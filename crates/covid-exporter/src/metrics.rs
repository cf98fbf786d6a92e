//! Internal metrics for the exporter itself.

use std::{
    borrow::Cow,
    fmt::{self, Write as _},
    time::Duration,
};

use prometheus_client::{
    encoding::{text, EncodeLabelSet, EncodeLabelValue, LabelValueEncoder},
    metrics::{
        counter::Counter,
        family::Family,
        histogram::{exponential_buckets, Histogram},
    },
    registry::{Registry, Unit},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum FetchOutcome {
    Success,
    Error,
}

impl FetchOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl EncodeLabelValue for FetchOutcome {
    fn encode(&self, encoder: &mut LabelValueEncoder<'_>) -> fmt::Result {
        encoder.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub(crate) struct SourceLabels {
    source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub(crate) struct FetchLabels {
    source: String,
    outcome: FetchOutcome,
}

fn latency_histogram() -> Histogram {
    // 5ms .. ~20s
    Histogram::new(exponential_buckets(0.005, 2.0, 13))
}

/// Metrics describing upstream fetches and scrapes. Each exporter owns its own registry,
/// so that metrics of independent exporters (e.g., in tests) don't mix.
#[derive(Debug)]
pub(crate) struct ExporterMetrics {
    registry: Registry,
    fetch_latency: Family<SourceLabels, Histogram, fn() -> Histogram>,
    fetches: Family<FetchLabels, Counter>,
    scrape_latency: Histogram,
}

impl ExporterMetrics {
    pub fn new() -> Self {
        let fetch_latency: Family<SourceLabels, Histogram, fn() -> Histogram> =
            Family::new_with_constructor(latency_histogram);
        let fetches = Family::<FetchLabels, Counter>::default();
        let scrape_latency = latency_histogram();

        let mut registry = Registry::with_prefix("covid_exporter");
        registry.register_with_unit(
            "fetch_latency",
            "Latency of fetching a document from an upstream source.",
            Unit::Seconds,
            fetch_latency.clone(),
        );
        registry.register(
            "fetches",
            "Number of upstream fetches grouped by the outcome.",
            fetches.clone(),
        );
        registry.register_with_unit(
            "scrape_latency",
            "Latency of refreshing and rendering all metrics for a single scrape.",
            Unit::Seconds,
            scrape_latency.clone(),
        );

        Self {
            registry,
            fetch_latency,
            fetches,
            scrape_latency,
        }
    }

    pub fn observe_fetch(&self, source: &str, latency: Duration, outcome: FetchOutcome) {
        let labels = SourceLabels {
            source: source.to_owned(),
        };
        self.fetch_latency
            .get_or_create(&labels)
            .observe(latency.as_secs_f64());
        let labels = FetchLabels {
            source: labels.source,
            outcome,
        };
        self.fetches.get_or_create(&labels).inc();
    }

    pub fn observe_scrape(&self, latency: Duration) {
        self.scrape_latency.observe(latency.as_secs_f64());
    }

    /// Encodes all metrics in the Prometheus text format and appends them to `buffer`.
    pub fn encode(&self, buffer: &mut String) -> fmt::Result {
        let mut open_metrics = String::with_capacity(1_024);
        text::encode(&mut open_metrics, &self.registry)?;
        translate_to_prometheus(&open_metrics, buffer)
    }
}

/// Translates the OpenMetrics text format produced by `prometheus-client` into the Prometheus one.
///
/// This transform:
///
/// - Strips the `_total` suffix from counter values (it's mandatory in OpenMetrics, but Prometheus
///   doesn't expect it).
/// - Removes the `# EOF` terminator, which the Prometheus format doesn't define.
fn translate_to_prometheus(open_metrics: &str, buffer: &mut String) -> fmt::Result {
    let mut last_counter = None::<&str>;
    for line in open_metrics.lines() {
        if line == "# EOF" {
            continue;
        }

        let mut transformed_line = Cow::Borrowed(line);
        if let Some(type_def) = line.strip_prefix("# TYPE ") {
            let (name, ty) = type_def
                .trim()
                .split_once(|ch: char| ch.is_ascii_whitespace())
                .ok_or(fmt::Error)?;
            last_counter = (ty == "counter").then_some(name);
        } else if !line.starts_with('#') {
            let name_end_pos = line
                .find(|ch: char| ch == '{' || ch.is_ascii_whitespace())
                .ok_or(fmt::Error)?;
            let (name, rest) = line.split_at(name_end_pos);
            if let (Some(counter), Some(truncated_name)) =
                (last_counter, name.strip_suffix("_total"))
            {
                if truncated_name == counter {
                    transformed_line = Cow::Owned(format!("{truncated_name}{rest}"));
                }
            }
        }
        writeln!(buffer, "{transformed_line}")?;
    }
    Ok(())
}
