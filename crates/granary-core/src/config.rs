// SPDX-License-Identifier: MIT OR Apache-2.0
//! Recursive config value model.
//!
//! A [`ConfigValue`] is the parameter record of a job: scalars, sequences,
//! and string-keyed mappings. Mapping keys beginning with `__` are treated as
//! private metadata and excluded from job identity (see [`crate::key`]).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A recursively-typed config value.
///
/// Serializes transparently as plain JSON, which is also how configs are
/// persisted, so stored configs stay browsable from the REST view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Boolean leaf.
    Bool(bool),
    /// Integer leaf.
    Int(i64),
    /// Float leaf.
    Float(f64),
    /// String leaf.
    Str(String),
    /// Ordered sequence; position is significant.
    List(Vec<ConfigValue>),
    /// String-keyed mapping; emitted in ascending key order.
    Map(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    /// Look up a key in a mapping. Returns `None` for non-mappings.
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        match self {
            ConfigValue::Map(m) => m.get(key),
            _ => None,
        }
    }

    /// The integer payload, if this is an integer leaf.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The float payload; integer leaves coerce losslessly.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(v) => Some(*v),
            ConfigValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// The boolean payload, if this is a boolean leaf.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The string payload, if this is a string leaf.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(v) => Some(v),
            _ => None,
        }
    }

    /// The sequence payload, if this is a list.
    pub fn as_list(&self) -> Option<&[ConfigValue]> {
        match self {
            ConfigValue::List(v) => Some(v),
            _ => None,
        }
    }

    /// The mapping payload, if this is a map.
    pub fn as_map(&self) -> Option<&BTreeMap<String, ConfigValue>> {
        match self {
            ConfigValue::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Convert a JSON document into a config value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] for `null` and for numbers that
    /// fit neither `i64` nor `f64`.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        ConfigValue::try_from(value)
    }
}

impl TryFrom<serde_json::Value> for ConfigValue {
    type Error = ConfigError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;
        Ok(match value {
            Value::Null => {
                return Err(ConfigError::invalid("'null', type: unit"));
            }
            Value::Bool(b) => ConfigValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ConfigValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    ConfigValue::Float(f)
                } else {
                    return Err(ConfigError::invalid(format!("'{n}', type: number")));
                }
            }
            Value::String(s) => ConfigValue::Str(s),
            Value::Array(items) => ConfigValue::List(
                items
                    .into_iter()
                    .map(ConfigValue::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(entries) => {
                let mut map = BTreeMap::new();
                for (k, v) in entries {
                    map.insert(k, ConfigValue::try_from(v)?);
                }
                ConfigValue::Map(map)
            }
        })
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<i32> for ConfigValue {
    fn from(v: i32) -> Self {
        ConfigValue::Int(i64::from(v))
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Str(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::Str(v)
    }
}

impl<T: Into<ConfigValue>> From<Vec<T>> for ConfigValue {
    fn from(items: Vec<T>) -> Self {
        ConfigValue::List(items.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<String>, V: Into<ConfigValue>> FromIterator<(K, V)> for ConfigValue {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        ConfigValue::Map(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_scalars() {
        assert_eq!(
            ConfigValue::from_json(json!(10)).unwrap(),
            ConfigValue::Int(10)
        );
        assert_eq!(
            ConfigValue::from_json(json!(2.5)).unwrap(),
            ConfigValue::Float(2.5)
        );
        assert_eq!(
            ConfigValue::from_json(json!("x")).unwrap(),
            ConfigValue::Str("x".into())
        );
        assert_eq!(
            ConfigValue::from_json(json!(true)).unwrap(),
            ConfigValue::Bool(true)
        );
    }

    #[test]
    fn from_json_rejects_null() {
        assert!(ConfigValue::from_json(json!(null)).is_err());
        assert!(ConfigValue::from_json(json!({ "a": null })).is_err());
        assert!(ConfigValue::from_json(json!([1, null])).is_err());
    }

    #[test]
    fn json_round_trip() {
        let config: ConfigValue = [("a", ConfigValue::from(10)), ("b", ConfigValue::from(2.5))]
            .into_iter()
            .collect();
        let text = serde_json::to_string(&config).unwrap();
        let back: ConfigValue = serde_json::from_str(&text).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn map_lookup() {
        let config: ConfigValue = [("a", 10i64), ("b", 20)].into_iter().collect();
        assert_eq!(config.get("a").and_then(ConfigValue::as_int), Some(10));
        assert_eq!(config.get("missing"), None);
        assert_eq!(ConfigValue::Int(1).get("a"), None);
    }
}
