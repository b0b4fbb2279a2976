//! Command-line interface for taskbeat.
//!
//! Provides the worker and beat roles plus producer and monitoring commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, OutputFormat};
