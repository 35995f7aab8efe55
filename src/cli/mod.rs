//! Command-line interface for mrva-commander.
//!
//! Provides the `standalone`, `server` and `agent` process shapes.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
