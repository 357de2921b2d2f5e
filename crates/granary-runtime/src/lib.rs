// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! granary-runtime
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Builders and the in-process registry.
pub mod builder;
/// The full-phase job context: inputs, attachments, working directory.
pub mod context;
/// Error taxonomy of the runtime.
pub mod error;
/// Dispatch loop.
mod executor;
/// User-facing job handles.
pub mod job;
/// Plan construction.
mod plan;
/// Runner abstraction and the local pool runner.
pub mod runner;
/// The public runtime.
pub mod runtime;
/// Worker protocol (claim, verify deps, compute, commit).
mod worker;

pub use builder::{Builder, BuilderRegistry, DepContext, PackedValue};
pub use context::JobContext;
pub use error::GranaryError;
pub use job::{Job, JobRef};
pub use runner::{JobFailure, JobOutcome, LocalRunner, Runner, WorkerJob};
pub use runtime::Runtime;

/// Crate-wide result alias.
pub type Result<T, E = GranaryError> = std::result::Result<T, E>;
