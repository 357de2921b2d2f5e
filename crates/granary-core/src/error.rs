// SPDX-License-Identifier: MIT OR Apache-2.0
//! Errors raised while building or canonicalizing configs.

/// Errors produced by the config model.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A config contained an unsupported item (e.g. `null`, an out-of-range
    /// number) or was otherwise not canonicalizable.
    #[error("invalid item in config: {reason}")]
    InvalidConfig {
        /// Human-readable detail.
        reason: String,
    },

    /// A builder name is not a valid identifier.
    #[error("'{name}' is not a valid builder name (needs a valid identifier)")]
    InvalidName {
        /// The rejected name.
        name: String,
    },
}

impl ConfigError {
    /// Shorthand constructor for [`ConfigError::InvalidConfig`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}
