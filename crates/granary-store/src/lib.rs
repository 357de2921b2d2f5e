// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! granary-store
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Store errors.
pub mod error;
/// Archive / drop / free / upgrade maintenance operations.
mod maintenance;
/// Schema definition.
mod schema;
/// The store handle and core transactional operations.
mod store;
/// Read-side summary queries for the CLI and browser view.
mod summary;
/// Row and summary types.
pub mod types;

pub use error::StoreError;
pub use store::Store;
pub use types::{
    BlobSummary, BuilderSummary, ErrorSummary, JobSummary, KeyUpdate, PlanJob, RunStats,
    RunningJob, RunningStatus, StatusCounts, StoredJob,
};
