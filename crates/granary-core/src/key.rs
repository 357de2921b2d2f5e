// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical key derivation.
//!
//! A job's identity is the SHA-224 hex digest of the canonical textual
//! encoding of `(builder_name, config)`. The encoding sorts mapping keys
//! lexicographically, skips keys beginning with `__`, keeps sequence order,
//! and renders every scalar in its lossless literal form, so the digest is
//! stable across platforms and across semantically-equal configs.

use crate::config::ConfigValue;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};
use std::fmt;
use std::fmt::Write as _;

/// Length of a key in hex characters (SHA-224 digest).
pub const KEY_LEN: usize = 56;

/// A 56-character hex content hash identifying one job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    /// Wrap an already-derived digest string (e.g. read back from the store).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Key(hex.into())
    }

    /// The hex digest as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate that a builder name is a plain identifier.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidName`] for empty names or names containing
/// anything other than ASCII alphanumerics and underscores (no leading digit).
pub fn validate_builder_name(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidName {
            name: name.to_string(),
        })
    }
}

/// Render the canonical textual encoding of a config value.
///
/// Exposed for tests and diagnostics; [`canonical_key`] is the digest over
/// this stream prefixed by `builder_name + "!"`.
pub fn canonical_config(value: &ConfigValue) -> String {
    let mut out = String::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &ConfigValue, out: &mut String) {
    match value {
        ConfigValue::Int(v) => {
            let _ = write!(out, "{v}");
        }
        ConfigValue::Float(v) => {
            // Floats must never collide with integers: `3.0` encodes with a
            // fractional part even though Display drops it.
            let s = format!("{v}");
            out.push_str(&s);
            if !s.contains(['.', 'e', 'E']) && v.is_finite() {
                out.push_str(".0");
            }
        }
        ConfigValue::Bool(v) => {
            out.push_str(if *v { "true" } else { "false" });
        }
        ConfigValue::Str(v) => {
            let _ = write!(out, "{v:?}");
        }
        ConfigValue::List(items) => {
            out.push('[');
            for item in items {
                encode_into(item, out);
                out.push(',');
            }
            out.push(']');
        }
        ConfigValue::Map(entries) => {
            out.push('{');
            for (key, item) in entries {
                if key.starts_with("__") {
                    continue;
                }
                let _ = write!(out, "{key:?}");
                out.push(':');
                encode_into(item, out);
                out.push(',');
            }
            out.push('}');
        }
    }
}

/// Derive the content-hash key of `(builder_name, config)`.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidName`] when the builder name is not a valid
/// identifier.
pub fn canonical_key(builder_name: &str, config: &ConfigValue) -> Result<Key, ConfigError> {
    validate_builder_name(builder_name)?;
    let mut stream = String::with_capacity(64);
    stream.push_str(builder_name);
    stream.push('!');
    encode_into(config, &mut stream);
    let digest = Sha224::digest(stream.as_bytes());
    let mut hex = String::with_capacity(KEY_LEN);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(Key(hex))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(value: ConfigValue) -> String {
        canonical_config(&value)
    }

    #[test]
    fn different_builders_different_keys() {
        let c = ConfigValue::from(10);
        assert_ne!(
            canonical_key("abc", &c).unwrap(),
            canonical_key("ab", &c).unwrap()
        );
        assert_ne!(
            canonical_key("abc", &ConfigValue::from(10)).unwrap(),
            canonical_key("abc", &ConfigValue::from(11)).unwrap()
        );
    }

    #[test]
    fn encoding_basics() {
        assert_eq!(key(ConfigValue::from(10)), "10");
        assert_eq!(key(ConfigValue::from("Hello!")), "\"Hello!\"");
        assert_eq!(key(ConfigValue::from(3.14)), "3.14");
        assert_eq!(
            key(vec![
                ConfigValue::from(true),
                ConfigValue::from(false),
                ConfigValue::from(2),
            ]
            .into()),
            "[true,false,2,]"
        );
    }

    #[test]
    fn floats_never_collide_with_ints() {
        assert_eq!(key(ConfigValue::from(3.0)), "3.0");
        assert_ne!(key(ConfigValue::from(3.0)), key(ConfigValue::from(3)));
    }

    #[test]
    fn map_order_is_irrelevant() {
        let a: ConfigValue = [("x", 10i64), ("y", 20)].into_iter().collect();
        let b: ConfigValue = [("y", 20i64), ("x", 10)].into_iter().collect();
        assert_eq!(key(a), key(b));

        let c: ConfigValue = [("x", 10i64), ("y", 20)].into_iter().collect();
        let d: ConfigValue = [("y", 10i64), ("x", 20)].into_iter().collect();
        assert_ne!(key(c), key(d));
    }

    #[test]
    fn list_order_is_significant() {
        let a: ConfigValue = vec![10i64, 20].into();
        let b: ConfigValue = vec![20i64, 10].into();
        assert_ne!(key(a), key(b));
    }

    #[test]
    fn private_keys_are_skipped() {
        let base: ConfigValue = [("x", 10i64)].into_iter().collect();
        let tagged: ConfigValue = [("x", 10i64.into()), ("__note", ConfigValue::from("hi"))]
            .into_iter()
            .collect();
        let other: ConfigValue = [("x", 10i64.into()), ("__other", ConfigValue::from(30))]
            .into_iter()
            .collect();
        let k = canonical_key("z", &base).unwrap();
        assert_eq!(canonical_key("z", &tagged).unwrap(), k);
        assert_eq!(canonical_key("z", &other).unwrap(), k);
    }

    #[test]
    fn key_has_expected_shape() {
        let k = canonical_key("abc", &ConfigValue::from(1)).unwrap();
        assert_eq!(k.as_str().len(), KEY_LEN);
        assert!(k.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn invalid_builder_names() {
        assert!(validate_builder_name("ok_name").is_ok());
        assert!(validate_builder_name("_x1").is_ok());
        assert!(validate_builder_name("").is_err());
        assert!(validate_builder_name("1abc").is_err());
        assert!(validate_builder_name("a-b").is_err());
        assert!(canonical_key("a b", &ConfigValue::from(1)).is_err());
    }
}
