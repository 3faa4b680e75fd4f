use serde::{Deserialize, Serialize};

use super::Labels;

/// Immutable key/value pair, ordered by key then value.
///
/// Label and annotation maps travel as `Vec<KeyValue>` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// A key appeared more than once while collapsing pairs into a map.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("duplicate key: {0}")]
pub struct DuplicateKey(pub String);

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Linearize a map, sorted.
    pub fn from_map(map: &Labels) -> Vec<KeyValue> {
        map.iter().map(|(k, v)| KeyValue::new(k, v)).collect()
    }

    /// Collapse pairs back into a map. Fails on a repeated key rather than
    /// silently keeping one of the values.
    pub fn to_map<'a, I>(pairs: I) -> Result<Labels, DuplicateKey>
    where
        I: IntoIterator<Item = &'a KeyValue>,
    {
        let mut map = Labels::new();
        for kv in pairs {
            if map.insert(kv.key.clone(), kv.value.clone()).is_some() {
                return Err(DuplicateKey(kv.key.clone()));
            }
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_key_then_value() {
        let mut pairs = vec![
            KeyValue::new("b", "1"),
            KeyValue::new("a", "2"),
            KeyValue::new("a", "1"),
        ];
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                KeyValue::new("a", "1"),
                KeyValue::new("a", "2"),
                KeyValue::new("b", "1"),
            ]
        );
    }

    #[test]
    fn test_map_round_trip() {
        let mut labels = Labels::new();
        labels.insert("app".to_string(), "orders".to_string());
        labels.insert("tier".to_string(), "backend".to_string());

        let pairs = KeyValue::from_map(&labels);
        assert_eq!(KeyValue::to_map(&pairs).unwrap(), labels);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let pairs = vec![KeyValue::new("app", "a"), KeyValue::new("app", "b")];
        assert_eq!(KeyValue::to_map(&pairs), Err(DuplicateKey("app".to_string())));
    }
}
