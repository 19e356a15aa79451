//! CLI module for the provisioning pilot.
//!
//! This module provides the command-line interface operators use to plan,
//! deploy and inspect projects.

mod commands;
mod output;

pub use commands::{Cli, Commands, DEFAULT_HISTORY_LIMIT, LeaseCommands, OutputFormat};
pub use output::OutputFormatter;
