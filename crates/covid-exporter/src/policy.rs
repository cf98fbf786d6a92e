//! TTL-gated refresh of cached measurements.
//!
//! Totals and states follow different rules on failure: a failed totals fetch leaves
//! the measurement untouched (so it's retried on the next scrape), while a failed state fetch
//! keeps the previous value but still advances the timestamp (so it's only retried after the TTL
//! elapses again).

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hyper::body::Bytes;

use crate::{
    config::StateMetricConfig,
    fetcher::{Fetch, FetchError},
    metrics::{ExporterMetrics, FetchOutcome},
    payload::{RemoteStatesPayload, RemoteTotalsPayload},
    store::{Measurement, MeasurementStore, TOTAL_METRIC},
};

/// Category of the totals payload cached as the value of the total measurement.
const CASES_CATEGORY: &str = "cases";

/// Checks whether a measurement refreshed at `executed` is stale at `now`. Times are compared
/// with whole-second granularity, so a measurement with 5s TTL is refreshed 6s after
/// the previous refresh.
pub(crate) fn is_due(executed: SystemTime, ttl: Duration, now: SystemTime) -> bool {
    let Some(expires_at) = executed.checked_add(ttl) else {
        return false;
    };
    unix_secs(now) > unix_secs(expires_at)
}

fn unix_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX),
        Err(err) => -i64::try_from(err.duration().as_secs()).unwrap_or(i64::MAX),
    }
}

/// Outcome of refreshing the total metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TotalRefresh {
    /// TTL hasn't elapsed; nothing was fetched.
    NotDue,
    /// Totals were fetched; the payload must be rendered right away.
    Refreshed(RemoteTotalsPayload),
    /// Fetch failed; the measurement is unchanged.
    Failed,
}

/// Outcome of refreshing a state metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateRefresh {
    NotDue,
    Refreshed,
    /// Fetch or decoding failed; the previous value was kept with an advanced timestamp.
    FellBack,
}

/// Refresh policy bound to a single scrape.
#[derive(Debug)]
pub(crate) struct RefreshPolicy<'a, F> {
    fetcher: &'a F,
    metrics: &'a ExporterMetrics,
    now: SystemTime,
}

impl<'a, F: Fetch> RefreshPolicy<'a, F> {
    pub fn new(fetcher: &'a F, metrics: &'a ExporterMetrics, now: SystemTime) -> Self {
        Self {
            fetcher,
            metrics,
            now,
        }
    }

    async fn fetch(&self, metric: &str, url: &str) -> Result<Bytes, FetchError> {
        let started_at = Instant::now();
        let result = self.fetcher.fetch(url).await;
        let latency = started_at.elapsed();

        let outcome = match &result {
            Ok(body) => {
                tracing::debug!(
                    metric,
                    url,
                    latency_sec = latency.as_secs_f64(),
                    "Fetched {}B in {latency:?}",
                    body.len()
                );
                FetchOutcome::Success
            }
            Err(err) => {
                tracing::warn!(%err, metric, url, "Error getting value");
                FetchOutcome::Error
            }
        };
        self.metrics.observe_fetch(metric, latency, outcome);
        result
    }

    /// Refreshes the total measurement if its TTL has elapsed.
    pub async fn refresh_total(
        &self,
        store: &mut MeasurementStore,
        url: &str,
        ttl: Duration,
    ) -> TotalRefresh {
        let executed = store
            .get(TOTAL_METRIC)
            .map_or(UNIX_EPOCH, |measurement| measurement.executed);
        if !is_due(executed, ttl, self.now) {
            return TotalRefresh::NotDue;
        }

        let Ok(raw) = self.fetch(TOTAL_METRIC, url).await else {
            return TotalRefresh::Failed;
        };
        let payload = RemoteTotalsPayload::decode(&raw);
        let cases = payload.get(CASES_CATEGORY).unwrap_or(0);
        store.set(TOTAL_METRIC, cases.to_string(), self.now);
        TotalRefresh::Refreshed(payload)
    }

    /// Refreshes the measurement for `state` if its TTL has elapsed.
    pub async fn refresh_state(
        &self,
        store: &mut MeasurementStore,
        state: &StateMetricConfig,
        default_ttl: Duration,
    ) -> StateRefresh {
        let name = state.name.as_str();
        let previous = store
            .get(name)
            .cloned()
            .unwrap_or_else(Measurement::initial);
        if !is_due(previous.executed, state.effective_ttl(default_ttl), self.now) {
            return StateRefresh::NotDue;
        }

        tracing::info!(metric = name, "Recalculating {name}");
        let value = match self.fetch(name, &state.data).await {
            Ok(raw) => latest_value(name, &RemoteStatesPayload::decode(&raw)),
            Err(_) => None,
        };

        let (value, outcome) = match value {
            Some(value) => (value.to_string(), StateRefresh::Refreshed),
            None => (previous.value, StateRefresh::FellBack),
        };
        store.set(name, value, self.now);
        outcome
    }
}

/// Extracts the value of the last key (in document order) of the last snapshot. An empty
/// last snapshot yields 0; `None` is only returned if there are no snapshots at all.
fn latest_value(metric: &str, payload: &RemoteStatesPayload) -> Option<u64> {
    let Some(snapshot) = payload.last_snapshot() else {
        tracing::debug!(metric, "State source returned no snapshots; keeping previous value");
        return None;
    };
    if snapshot.len() > 1 {
        let keys: Vec<_> = snapshot.iter().map(|(key, _)| key.as_str()).collect();
        tracing::warn!(
            metric,
            ?keys,
            "Last snapshot has multiple keys; using the last one in document order"
        );
    }

    match snapshot.last() {
        Some(&(_, value)) => Some(value),
        None => {
            tracing::debug!(metric, "Last snapshot is empty; resetting value to 0");
            Some(0)
        }
    }
}
