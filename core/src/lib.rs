//! Root of the `firstfail-core` library.
//!
//! Regression bisection for an OS-image release pipeline: keeps a per-test-case
//! pass/fail lineage, materializes the intermediate CI builds between a known
//! good and a known bad package, and walks them to find the first failing
//! build together with the issue (or PR list) that introduced it.

// Library code logs through `tracing`; only the CLI writes to the terminal.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod bisect;
pub mod config;
pub mod error;
pub mod exec;
pub mod flake;
pub mod fs_util;
pub mod manifest;
pub mod pipeline;
pub mod pkg;
pub mod record;
pub mod registry;
pub mod retry;
pub mod steps;
pub mod tags;
pub mod tester;

pub use error::{FirstFailError, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Ceiling for a single flash, boot or test-suite cycle.
pub const DEFAULT_DEADLINE: std::time::Duration = std::time::Duration::from_secs(6 * 60 * 60);
