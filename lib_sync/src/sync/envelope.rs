//! # Stream Event Envelope
//!
//! Every message on the push channel is a JSON envelope with a `type`
//! discriminant. Heartbeats keep the transport alive and never touch state;
//! snapshots replace the materialized list wholesale so a client that missed
//! deltas while disconnected resynchronizes; updates append one item in
//! arrival order. Anything malformed is dropped with a diagnostic, never
//! fatal to the connection.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Typed event envelope carried by the push stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnvelope {
    Heartbeat,
    Snapshot { data: Value },
    Update { data: Value },
}

/// Wire shape of one event payload. Heartbeats may or may not carry a
/// `data` field; snapshots and updates must.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Transforms a whole snapshot payload into the materialized list.
pub type SnapshotMapper<T> = Arc<dyn Fn(&Value) -> Vec<T> + Send + Sync>;

/// Transforms one incremental item; returning `None` vetoes it.
pub type ItemMapper<T> = Arc<dyn Fn(&Value) -> Option<T> + Send + Sync>;

/// Parses one raw event payload into an envelope. Malformed messages are
/// logged and dropped.
pub fn parse_envelope(raw: &str) -> Option<StreamEnvelope> {
    let envelope: RawEnvelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("Dropping malformed stream message: {}", e);
            return None;
        }
    };

    match (envelope.kind.as_str(), envelope.data) {
        ("heartbeat", _) => Some(StreamEnvelope::Heartbeat),
        ("snapshot", Some(data)) => Some(StreamEnvelope::Snapshot { data }),
        ("update", Some(data)) => Some(StreamEnvelope::Update { data }),
        ("snapshot" | "update", None) => {
            log::warn!("Dropping '{}' message without a data field", envelope.kind);
            None
        }
        (other, _) => {
            log::warn!("Dropping stream message with unknown type '{}'", other);
            None
        }
    }
}

/// Applies one envelope to the materialized list. Returns `true` when the
/// list changed, so callers can skip notifying watchers on heartbeats and
/// vetoed items.
pub fn apply_envelope<T>(
    items: &mut Vec<T>,
    envelope: StreamEnvelope,
    map_snapshot: Option<&SnapshotMapper<T>>,
    map_item: Option<&ItemMapper<T>>,
) -> bool
where
    T: DeserializeOwned,
{
    match envelope {
        StreamEnvelope::Heartbeat => false,
        StreamEnvelope::Snapshot { data } => {
            let replacement = match map_snapshot {
                Some(mapper) => mapper(&data),
                None => match data {
                    // Without a mapper the payload must already be a sequence.
                    Value::Array(elements) => elements
                        .into_iter()
                        .filter_map(|element| match serde_json::from_value(element) {
                            Ok(item) => Some(item),
                            Err(e) => {
                                log::warn!("Dropping undecodable snapshot element: {}", e);
                                None
                            }
                        })
                        .collect(),
                    other => {
                        log::warn!(
                            "Dropping snapshot whose payload is not a sequence (got {})",
                            json_kind(&other)
                        );
                        return false;
                    }
                },
            };
            *items = replacement;
            true
        }
        StreamEnvelope::Update { data } => {
            let mapped = match map_item {
                Some(mapper) => mapper(&data),
                None => match serde_json::from_value(data) {
                    Ok(item) => Some(item),
                    Err(e) => {
                        log::warn!("Dropping undecodable update item: {}", e);
                        None
                    }
                },
            };
            match mapped {
                Some(item) => {
                    items.push(item);
                    true
                }
                None => false,
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(raw: &str) -> StreamEnvelope {
        parse_envelope(raw).expect("envelope should parse")
    }

    #[test]
    fn envelope_discriminants_parse() {
        assert_eq!(parse(r#"{"type":"heartbeat"}"#), StreamEnvelope::Heartbeat);
        // Heartbeats may carry a payload; it is irrelevant either way.
        assert_eq!(
            parse(r#"{"type":"heartbeat","data":{"ts":1}}"#),
            StreamEnvelope::Heartbeat
        );
        assert_eq!(
            parse(r#"{"type":"snapshot","data":[1,2]}"#),
            StreamEnvelope::Snapshot { data: json!([1, 2]) }
        );
        assert_eq!(
            parse(r#"{"type":"update","data":"x"}"#),
            StreamEnvelope::Update { data: json!("x") }
        );
        assert!(parse_envelope("not json at all").is_none());
        assert!(parse_envelope(r#"{"type":"unknown","data":1}"#).is_none());
        assert!(parse_envelope(r#"{"type":"update"}"#).is_none());
    }

    #[test]
    fn updates_append_in_arrival_order_and_heartbeats_change_nothing() {
        let mut items: Vec<String> = Vec::new();
        assert!(!apply_envelope(&mut items, StreamEnvelope::Heartbeat, None, None));
        assert!(apply_envelope(
            &mut items,
            StreamEnvelope::Update { data: json!("a") },
            None,
            None
        ));
        assert!(!apply_envelope(&mut items, StreamEnvelope::Heartbeat, None, None));
        assert!(apply_envelope(
            &mut items,
            StreamEnvelope::Update { data: json!("b") },
            None,
            None
        ));
        assert_eq!(items, ["a", "b"]);
    }

    #[test]
    fn snapshot_replaces_wholesale_regardless_of_prior_updates() {
        let mut items: Vec<String> = vec!["stale".into(), "older".into()];
        assert!(apply_envelope(
            &mut items,
            StreamEnvelope::Snapshot { data: json!(["fresh", "state"]) },
            None,
            None
        ));
        assert_eq!(items, ["fresh", "state"]);
    }

    #[test]
    fn item_mapper_can_veto() {
        let mut items: Vec<String> = Vec::new();
        let mapper: ItemMapper<String> = Arc::new(|value| {
            value
                .get("line")
                .and_then(Value::as_str)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
        });
        assert!(apply_envelope(
            &mut items,
            StreamEnvelope::Update { data: json!({"line": "kept"}) },
            None,
            Some(&mapper)
        ));
        assert!(!apply_envelope(
            &mut items,
            StreamEnvelope::Update { data: json!({"line": ""}) },
            None,
            Some(&mapper)
        ));
        assert_eq!(items, ["kept"]);
    }

    #[test]
    fn snapshot_mapper_transforms_the_payload() {
        let mut items: Vec<u64> = vec![7];
        let mapper: SnapshotMapper<u64> = Arc::new(|value| {
            value
                .get("entries")
                .and_then(Value::as_array)
                .map(|entries| entries.iter().filter_map(Value::as_u64).collect())
                .unwrap_or_default()
        });
        assert!(apply_envelope(
            &mut items,
            StreamEnvelope::Snapshot { data: json!({"entries": [1, 2, 3]}) },
            Some(&mapper),
            None
        ));
        assert_eq!(items, [1, 2, 3]);
    }

    #[test]
    fn unmapped_non_sequence_snapshot_is_dropped_and_state_kept() {
        let mut items: Vec<String> = vec!["kept".into()];
        assert!(!apply_envelope(
            &mut items,
            StreamEnvelope::Snapshot { data: json!({"oops": true}) },
            None,
            None
        ));
        assert_eq!(items, ["kept"]);
    }

    #[test]
    fn undecodable_update_is_dropped_without_poisoning_the_list() {
        let mut items: Vec<u64> = vec![1];
        assert!(!apply_envelope(
            &mut items,
            StreamEnvelope::Update { data: json!("not a number") },
            None,
            None
        ));
        assert_eq!(items, [1]);
    }
}
