//! Command-line interface definition for changeprop
//!
//! This module defines the CLI structure using clap's derive API.

use clap::{Parser, Subcommand};

/// changeprop - propagate change events to dependent HTTP services
///
/// Consumes events from Kafka topics, matches them against configured
/// rules and issues the derived HTTP requests.
#[derive(Parser, Debug, Clone)]
#[command(name = "changeprop")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Consume topics and execute rules until interrupted
    Run {
        /// Override the Kafka bootstrap servers from config
        #[arg(short, long)]
        brokers: Option<String>,

        /// Run only the named rules (repeatable)
        #[arg(short, long = "rule")]
        rules: Vec<String>,
    },

    /// Compile every rule and report configuration errors
    Check,
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::try_parse_from(["changeprop", "run"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("config.yaml"));
        assert!(!cli.verbose);
        match cli.command {
            Commands::Run { brokers, rules } => {
                assert!(brokers.is_none());
                assert!(rules.is_empty());
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_parse_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "changeprop",
            "--config",
            "/etc/changeprop.yaml",
            "-v",
            "run",
            "--brokers",
            "kafka:9092",
            "--rule",
            "purge",
            "--rule",
            "summary",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("/etc/changeprop.yaml"));
        assert!(cli.verbose);
        match cli.command {
            Commands::Run { brokers, rules } => {
                assert_eq!(brokers.as_deref(), Some("kafka:9092"));
                assert_eq!(rules, vec!["purge".to_string(), "summary".to_string()]);
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_parse_check() {
        let cli = Cli::try_parse_from(["changeprop", "check"]).unwrap();
        assert!(matches!(cli.command, Commands::Check));
    }

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["changeprop"]).is_err());
    }
}
