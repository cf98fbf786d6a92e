//! Best-effort decoding of upstream JSON documents.
//!
//! Decoding never fails: malformed documents decode into empty payloads, and entries that don't
//! hold an unsigned integer are skipped. Object keys are matched exactly first and then
//! case-insensitively, so `{"data": [...]}` is accepted in place of `{"Data": [...]}`.
//! Entries keep the order in which they appear in the document.

use serde_json::{Map, Value};

/// Category counts in document order.
pub type Counts = Vec<(String, u64)>;

/// Payload of the totals source: `{"current_totals": {<category>: <uint>, ...}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteTotalsPayload {
    /// Count per category.
    pub current_totals: Counts,
}

impl RemoteTotalsPayload {
    const TOTALS_FIELD: &'static str = "current_totals";

    /// Decodes the payload from raw JSON.
    pub fn decode(raw: &[u8]) -> Self {
        let Some(document) = parse_object(raw) else {
            return Self::default();
        };
        let current_totals = field(&document, Self::TOTALS_FIELD)
            .map(counts)
            .unwrap_or_default();
        Self { current_totals }
    }

    /// Returns the count for `category`, if present.
    pub fn get(&self, category: &str) -> Option<u64> {
        self.current_totals
            .iter()
            .find_map(|(name, count)| (name == category).then_some(*count))
    }
}

/// Payload of a per-state source: `{"Data": [{<key>: <uint>, ...}, ...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStatesPayload {
    /// Snapshots in document order. A snapshot that isn't an object is kept as an empty one.
    pub data: Vec<Counts>,
}

impl RemoteStatesPayload {
    const DATA_FIELD: &'static str = "Data";

    /// Decodes the payload from raw JSON.
    pub fn decode(raw: &[u8]) -> Self {
        let Some(document) = parse_object(raw) else {
            return Self::default();
        };
        let data = field(&document, Self::DATA_FIELD)
            .and_then(Value::as_array)
            .map(|snapshots| snapshots.iter().map(counts).collect())
            .unwrap_or_default();
        Self { data }
    }

    /// Returns the last snapshot in the sequence.
    pub fn last_snapshot(&self) -> Option<&[(String, u64)]> {
        self.data.last().map(Vec::as_slice)
    }
}

fn parse_object(raw: &[u8]) -> Option<Map<String, Value>> {
    match serde_json::from_slice(raw) {
        Ok(Value::Object(document)) => Some(document),
        Ok(other) => {
            tracing::debug!(?other, "Upstream document is not a JSON object");
            None
        }
        Err(err) => {
            tracing::debug!(%err, "Upstream document is not valid JSON");
            None
        }
    }
}

fn field<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    object.get(name).or_else(|| {
        object
            .iter()
            .find_map(|(key, value)| key.eq_ignore_ascii_case(name).then_some(value))
    })
}

fn counts(value: &Value) -> Counts {
    let Some(object) = value.as_object() else {
        return Counts::new();
    };
    object
        .iter()
        .filter_map(|(key, value)| Some((key.clone(), value.as_u64()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoding_totals() {
        let raw = br#"{"current_totals": {"cases": 100, "deaths": 5, "recovered": 80}}"#;
        let payload = RemoteTotalsPayload::decode(raw);
        assert_eq!(
            payload.current_totals,
            [
                ("cases".to_owned(), 100),
                ("deaths".to_owned(), 5),
                ("recovered".to_owned(), 80),
            ]
        );
        assert_eq!(payload.get("cases"), Some(100));
        assert_eq!(payload.get("tests"), None);
    }

    #[test]
    fn totals_skip_non_integer_entries() {
        let raw =
            br#"{"current_totals": {"cases": "many", "deaths": -1, "tests": 3, "ratio": 0.5}}"#;
        let payload = RemoteTotalsPayload::decode(raw);
        assert_eq!(payload.current_totals, [("tests".to_owned(), 3)]);
    }

    #[test]
    fn malformed_totals_decode_to_empty_payload() {
        let malformed: [&[u8]; 5] = [
            b"not json",
            b"[1, 2, 3]",
            br#"{"current_totals": [1, 2]}"#,
            br#"{"other": {}}"#,
            b"",
        ];
        for raw in malformed {
            assert_eq!(RemoteTotalsPayload::decode(raw), RemoteTotalsPayload::default());
        }
    }

    #[test]
    fn decoding_states() {
        let raw = br#"{"Data": [{"a": 1}, {"a": 7}]}"#;
        let payload = RemoteStatesPayload::decode(raw);
        assert_eq!(payload.data.len(), 2);
        assert_eq!(payload.last_snapshot(), Some(&[("a".to_owned(), 7)][..]));
    }

    #[test]
    fn state_field_names_are_case_insensitive() {
        let payload = RemoteStatesPayload::decode(br#"{"data": [{"berlin": 12}]}"#);
        assert_eq!(payload.last_snapshot(), Some(&[("berlin".to_owned(), 12)][..]));

        let payload = RemoteTotalsPayload::decode(br#"{"Current_Totals": {"cases": 1}}"#);
        assert_eq!(payload.get("cases"), Some(1));
    }

    #[test]
    fn snapshots_keep_document_order() {
        let payload = RemoteStatesPayload::decode(br#"{"Data": [{"z": 1, "b": 2, "m": 3}]}"#);
        let snapshot = payload.last_snapshot().unwrap();
        let keys: Vec<_> = snapshot.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, ["z", "b", "m"]);
    }

    #[test]
    fn non_object_snapshot_is_kept_empty() {
        let payload = RemoteStatesPayload::decode(br#"{"Data": [{"a": 1}, "oops"]}"#);
        assert_eq!(payload.data.len(), 2);
        assert_eq!(payload.last_snapshot(), Some(&[][..]));
    }

    #[test]
    fn malformed_states_decode_to_empty_payload() {
        let payload = RemoteStatesPayload::decode(b"{\"Data\": [");
        assert_eq!(payload.last_snapshot(), None);
        let payload = RemoteStatesPayload::decode(br#"{"Data": []}"#);
        assert_eq!(payload.last_snapshot(), None);
    }
}
