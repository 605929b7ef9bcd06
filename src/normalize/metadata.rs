//! Upstream metadata normalization.
//!
//! Greenhouse metadata arrives as `[{name, value, value_type}]` with values
//! of wildly different shapes. Normalization keeps an ordered list for
//! display plus a name-to-value map for lookups, with a closed set of value
//! shapes downstream code can rely on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::feeds::RawMetadataEntry;

/// The closed polymorphic sum metadata values normalize into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Text(String),
    Number(f64),
    List(Vec<String>),
    Currency { unit: String, amount: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub name: String,
    pub value: MetadataValue,
}

/// Normalized metadata: insertion-ordered entries plus a lookup map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub entries: Vec<MetadataEntry>,
    pub map: BTreeMap<String, MetadataValue>,
}

impl JobMetadata {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Normalize raw upstream metadata entries.
///
/// Strings are trimmed, empty values dropped, currency objects keep their
/// `{unit, amount}` shape, and on duplicate names the first entry wins.
pub fn normalize_metadata(raw: &[RawMetadataEntry]) -> JobMetadata {
    let mut metadata = JobMetadata::default();

    for entry in raw {
        let name = entry.name.trim();
        if name.is_empty() || metadata.map.contains_key(name) {
            continue;
        }
        let Some(value) = normalize_value(&entry.value) else {
            continue;
        };
        metadata.map.insert(name.to_string(), value.clone());
        metadata.entries.push(MetadataEntry {
            name: name.to_string(),
            value,
        });
    }

    metadata
}

fn normalize_value(value: &Value) -> Option<MetadataValue> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(MetadataValue::Text(trimmed.to_string()))
            }
        }
        Value::Number(n) => n.as_f64().map(MetadataValue::Number),
        Value::Array(items) => {
            let list: Vec<String> = items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if list.is_empty() {
                None
            } else {
                Some(MetadataValue::List(list))
            }
        }
        Value::Object(obj) => {
            let unit = obj.get("unit").and_then(Value::as_str)?;
            let amount = obj.get("amount").and_then(value_as_f64)?;
            Some(MetadataValue::Currency {
                unit: unit.trim().to_string(),
                amount,
            })
        }
        Value::Bool(b) => Some(MetadataValue::Text(b.to_string())),
        Value::Null => None,
    }
}

// Currency amounts show up both as numbers and as numeric strings.
fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(name: &str, value: Value) -> RawMetadataEntry {
        RawMetadataEntry {
            name: name.to_string(),
            value,
            value_type: None,
        }
    }

    #[test]
    fn test_strings_trimmed() {
        let metadata = normalize_metadata(&[raw("Team", json!("  Core  "))]);
        assert_eq!(
            metadata.map.get("Team"),
            Some(&MetadataValue::Text("Core".to_string()))
        );
    }

    #[test]
    fn test_empty_entries_dropped() {
        let metadata = normalize_metadata(&[
            raw("Empty", json!("   ")),
            raw("Null", Value::Null),
            raw("Kept", json!("yes")),
        ]);
        assert_eq!(metadata.entries.len(), 1);
        assert_eq!(metadata.entries[0].name, "Kept");
    }

    #[test]
    fn test_first_wins_on_duplicate_names() {
        let metadata = normalize_metadata(&[raw("Team", json!("Core")), raw("Team", json!("Infra"))]);
        assert_eq!(
            metadata.map.get("Team"),
            Some(&MetadataValue::Text("Core".to_string()))
        );
        assert_eq!(metadata.entries.len(), 1);
    }

    #[test]
    fn test_currency_shape_preserved() {
        let metadata = normalize_metadata(&[raw(
            "Salary",
            json!({"unit": "USD", "amount": 185000}),
        )]);
        assert_eq!(
            metadata.map.get("Salary"),
            Some(&MetadataValue::Currency {
                unit: "USD".to_string(),
                amount: 185000.0
            })
        );
    }

    #[test]
    fn test_currency_amount_as_string() {
        let metadata =
            normalize_metadata(&[raw("Salary", json!({"unit": "USD", "amount": "90000"}))]);
        assert!(matches!(
            metadata.map.get("Salary"),
            Some(MetadataValue::Currency { amount, .. }) if *amount == 90000.0
        ));
    }

    #[test]
    fn test_list_values() {
        let metadata = normalize_metadata(&[raw("Offices", json!(["NYC", " SF ", ""]))]);
        assert_eq!(
            metadata.map.get("Offices"),
            Some(&MetadataValue::List(vec![
                "NYC".to_string(),
                "SF".to_string()
            ]))
        );
    }

    #[test]
    fn test_entries_keep_insertion_order() {
        let metadata = normalize_metadata(&[
            raw("Zeta", json!("1")),
            raw("Alpha", json!("2")),
        ]);
        let names: Vec<&str> = metadata.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Zeta", "Alpha"]);
    }

    #[test]
    fn test_roundtrips_through_json() {
        let metadata = normalize_metadata(&[
            raw("Team", json!("Core")),
            raw("Salary", json!({"unit": "USD", "amount": 100.5})),
        ]);
        let encoded = serde_json::to_string(&metadata).unwrap();
        let decoded: JobMetadata = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, metadata);
    }
}
