// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! granary-cli
#![deny(unsafe_code)]
#![warn(missing_docs)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use granary_core::ConfigValue;
use granary_runtime::{JobRef, Runtime};
use granary_server::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Command-line interface of the `granary` binary.
#[derive(Parser, Debug)]
#[command(name = "granary", version, about = "Persistent, dependency-aware computation cache")]
pub struct Cli {
    /// Store URL (path to the SQLite file).
    #[arg(short = 'd', long = "db", env = "GRANARY_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands of the CLI.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the browser view over the store.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value_t = 8550)]
        port: u16,
        /// Host to bind.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Plan and compute jobs of a builder.
    ///
    /// The config is JSON; an array computes one job per element.
    Compute {
        /// Builder name.
        builder: String,
        /// Config as JSON (object, scalar, or array of configs).
        config: String,
        /// Keep independent branches running when a job fails.
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Drop jobs and their downstream closure.
    Drop {
        /// Builder name.
        builder: String,
        /// Config as JSON (object, scalar, or array of configs).
        config: String,
        /// Extend the closure to the jobs' inputs.
        #[arg(long)]
        drop_inputs: bool,
    },

    /// Archive jobs and their downstream closure.
    Archive {
        /// Builder name.
        builder: String,
        /// Config as JSON (object, scalar, or array of configs).
        config: String,
        /// Extend the closure to the jobs' inputs.
        #[arg(long)]
        archive_inputs: bool,
    },

    /// Discard the stored values of finished jobs, keeping metadata.
    Free {
        /// Builder name.
        builder: String,
        /// Config as JSON (object, scalar, or array of configs).
        config: String,
    },

    /// Drop every job of a builder.
    DropBuilder {
        /// Builder name.
        name: String,
        /// Extend the closure to the jobs' inputs.
        #[arg(long)]
        drop_inputs: bool,
    },
}

/// Expand a JSON config argument into job references.
///
/// A top-level array yields one job per element; anything else is a single
/// job config.
pub fn parse_job_configs(builder: &str, config: &str) -> Result<Vec<JobRef>> {
    let value: serde_json::Value =
        serde_json::from_str(config).context("config is not valid JSON")?;
    let configs = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    configs
        .into_iter()
        .map(|item| {
            let config = ConfigValue::from_json(item)?;
            Ok(JobRef::new(builder, config)?)
        })
        .collect()
}

/// Run a parsed command against a runtime.
pub async fn run(runtime: &Runtime, command: Commands) -> Result<()> {
    match command {
        Commands::Serve { port, host } => {
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .context("invalid host/port")?;
            let state = AppState::new(runtime.store().clone(), runtime.builder_names());
            granary_server::serve(state, addr).await?;
        }
        Commands::Compute {
            builder,
            config,
            continue_on_error,
        } => {
            let jobs = parse_job_configs(&builder, &config)?;
            let results = runtime.compute_many(&jobs, continue_on_error).await?;
            for job in &results {
                let rendered = match job.value::<serde_json::Value>() {
                    Ok(value) => value.to_string(),
                    Err(_) => format!("<{}>", job.state()),
                };
                println!("{:<56}   {}", job.key(), rendered);
            }
        }
        Commands::Drop {
            builder,
            config,
            drop_inputs,
        } => {
            let jobs = parse_job_configs(&builder, &config)?;
            runtime.drop_many(&jobs, drop_inputs)?;
        }
        Commands::Archive {
            builder,
            config,
            archive_inputs,
        } => {
            let jobs = parse_job_configs(&builder, &config)?;
            runtime.archive_many(&jobs, archive_inputs)?;
        }
        Commands::Free { builder, config } => {
            let jobs = parse_job_configs(&builder, &config)?;
            runtime.free_many(&jobs)?;
        }
        Commands::DropBuilder { name, drop_inputs } => {
            runtime.drop_builder(&name, drop_inputs)?;
        }
    }
    Ok(())
}

/// Parse the process arguments and run them against a caller-provided
/// runtime (its builders stay registered; `--db` is ignored with a warning).
pub async fn run_cli(runtime: &Runtime) -> Result<()> {
    let cli = Cli::parse();
    if cli.db.is_some() {
        eprintln!("warning: --db ignored (runtime already provided)");
    }
    run(runtime, cli.command).await
}

/// Open a runtime for a parsed CLI invocation (binary entry path).
pub fn open_runtime(cli: &Cli) -> Result<Runtime> {
    let Some(db) = &cli.db else {
        bail!("no store given (use --db or the GRANARY_DB environment variable)");
    };
    Ok(Runtime::open(db)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_config_yields_one_job() {
        let jobs = parse_job_configs("add", r#"{"a": 1, "b": 2}"#).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].builder_name(), "add");
    }

    #[test]
    fn array_config_expands() {
        let jobs = parse_job_configs("add", "[1, 2, 3]").unwrap();
        assert_eq!(jobs.len(), 3);
        assert_ne!(jobs[0].key(), jobs[1].key());
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(parse_job_configs("add", "{nope").is_err());
        assert!(parse_job_configs("add", "null").is_err());
    }

    #[test]
    fn cli_parses_compute() {
        let cli = Cli::try_parse_from([
            "granary",
            "-d",
            "store.db",
            "compute",
            "add",
            r#"{"a": 1}"#,
            "--continue-on-error",
        ])
        .unwrap();
        assert_eq!(cli.db.as_deref(), Some(std::path::Path::new("store.db")));
        match cli.command {
            Commands::Compute {
                builder,
                continue_on_error,
                ..
            } => {
                assert_eq!(builder, "add");
                assert!(continue_on_error);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
