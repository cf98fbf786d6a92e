//! In-memory store of the last observed metric values.

use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

/// Name of the measurement backing the `covid_de_total` gauge.
pub const TOTAL_METRIC: &str = "total";

/// Last observed value of a metric together with the time it was refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurement {
    /// String-encoded numeric value, rendered verbatim.
    pub value: String,
    /// Time of the last refresh attempt that updated this measurement.
    pub executed: SystemTime,
}

impl Measurement {
    /// Zero measurement refreshed at the Unix epoch, so that it is stale for any TTL.
    pub fn initial() -> Self {
        Self {
            value: "0".to_owned(),
            executed: UNIX_EPOCH,
        }
    }
}

/// Mapping from metric name to its [`Measurement`].
///
/// The store is seeded once with all configured names and never shrinks.
#[derive(Debug, Default)]
pub struct MeasurementStore {
    measurements: HashMap<String, Measurement>,
}

impl MeasurementStore {
    /// Creates a store with an [initial](Measurement::initial()) measurement for each of
    /// `state_names` and for [`TOTAL_METRIC`].
    pub fn new<'a>(state_names: impl IntoIterator<Item = &'a str>) -> Self {
        let measurements = state_names
            .into_iter()
            .chain([TOTAL_METRIC])
            .map(|name| (name.to_owned(), Measurement::initial()))
            .collect();
        Self { measurements }
    }

    /// Returns the measurement for `name`, or `None` if the name was never configured.
    pub fn get(&self, name: &str) -> Option<&Measurement> {
        self.measurements.get(name)
    }

    /// Replaces the measurement for `name`. The stored timestamp never moves backwards:
    /// if `executed` precedes the current one, the current timestamp is kept.
    pub fn set(&mut self, name: &str, value: String, executed: SystemTime) {
        if let Some(measurement) = self.measurements.get_mut(name) {
            measurement.value = value;
            measurement.executed = measurement.executed.max(executed);
        } else {
            self.measurements
                .insert(name.to_owned(), Measurement { value, executed });
        }
    }

    /// Number of stored measurements.
    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    /// Checks whether the store is empty. Never true for a store created with [`Self::new()`].
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn store_is_seeded_with_zero_values() {
        let store = MeasurementStore::new(["berlin", "hamburg"]);
        assert_eq!(store.len(), 3);
        for name in ["berlin", "hamburg", TOTAL_METRIC] {
            assert_eq!(store.get(name), Some(&Measurement::initial()));
        }
        assert_eq!(store.get("bremen"), None);
    }

    #[test]
    fn setting_measurement() {
        let mut store = MeasurementStore::new(["berlin"]);
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        store.set("berlin", "42".to_owned(), now);

        let measurement = store.get("berlin").unwrap();
        assert_eq!(measurement.value, "42");
        assert_eq!(measurement.executed, now);
    }

    #[test]
    fn timestamp_never_decreases() {
        let mut store = MeasurementStore::new(["berlin"]);
        let later = UNIX_EPOCH + Duration::from_secs(1_000);
        store.set("berlin", "1".to_owned(), later);
        store.set("berlin", "2".to_owned(), later - Duration::from_secs(10));

        let measurement = store.get("berlin").unwrap();
        assert_eq!(measurement.value, "2");
        assert_eq!(measurement.executed, later);
    }
}
