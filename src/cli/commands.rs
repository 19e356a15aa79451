//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Number of runs shown by `history` when no limit is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Provision Pilot - reconcile cloud projects to their declared state.
#[derive(Parser, Debug)]
#[command(name = "provision-pilot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "PILOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration file.
    Validate,

    /// Show the plan for a commit without applying it.
    Plan {
        /// Project identifier.
        project: String,

        /// Repository ref that was pushed (refs/heads/main, refs/tags/v1, main).
        #[arg(long = "ref")]
        repository_ref: String,

        /// Commit SHA to deploy.
        #[arg(long)]
        commit: String,
    },

    /// Reconcile a project to the given commit.
    Deploy {
        /// Project identifier.
        project: String,

        /// Repository ref that was pushed (refs/heads/main, refs/tags/v1, main).
        #[arg(long = "ref")]
        repository_ref: String,

        /// Commit SHA to deploy.
        #[arg(long)]
        commit: String,
    },

    /// Show the applied records of a project.
    Status {
        /// Project identifier.
        project: String,
    },

    /// Compare applied records with live provider state.
    Drift {
        /// Project identifier.
        project: String,
    },

    /// Show recent reconciliation runs.
    History {
        /// Project identifier.
        project: String,

        /// Maximum number of runs to show.
        #[arg(short, long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },

    /// Inspect or release project leases.
    Lease {
        /// Lease subcommand.
        #[command(subcommand)]
        command: LeaseCommands,
    },
}

/// Lease management subcommands.
#[derive(Subcommand, Debug)]
pub enum LeaseCommands {
    /// Show the current lease of a project.
    Show {
        /// Project identifier.
        project: String,
    },

    /// Force-release the lease of a project.
    Release {
        /// Project identifier.
        project: String,
    },
}

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_deploy() {
        let cli = Cli::try_parse_from([
            "provision-pilot",
            "--output",
            "json",
            "deploy",
            "shop",
            "--ref",
            "refs/heads/main",
            "--commit",
            "abc123",
        ])
        .expect("parse");

        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Deploy {
                project,
                repository_ref,
                commit,
            } => {
                assert_eq!(project, "shop");
                assert_eq!(repository_ref, "refs/heads/main");
                assert_eq!(commit, "abc123");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_history_default_limit() {
        let cli = Cli::try_parse_from(["provision-pilot", "history", "shop"]).expect("parse");
        assert!(matches!(cli.command, Commands::History { limit: DEFAULT_HISTORY_LIMIT, .. }));
    }

    #[test]
    fn test_lease_release() {
        let cli = Cli::try_parse_from(["provision-pilot", "-v", "lease", "release", "shop"]).expect("parse");
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Lease {
                command: LeaseCommands::Release { ref project }
            } if project == "shop"
        ));
    }

    #[test]
    fn test_plan_requires_commit() {
        assert!(Cli::try_parse_from(["provision-pilot", "plan", "shop", "--ref", "main"]).is_err());
    }
}
