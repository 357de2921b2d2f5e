// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! granary-core
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Recursive config value model.
pub mod config;
/// Config-model errors.
pub mod error;
/// Job lifecycle types: states, setup, metadata, mime tags.
pub mod job;
/// Canonical key derivation (SHA-224 of builder + config).
pub mod key;

pub use config::ConfigValue;
pub use error::ConfigError;
pub use job::{
    ACTIVE_STATES, JobId, JobMetadata, JobSetup, JobState, MIME_BYTES, MIME_PNG, MIME_TAR,
    MIME_TEXT, MIME_VALUE, short_repr,
};
pub use key::{Key, canonical_config, canonical_key, validate_builder_name};
