//! CLI interface for Atrium
//!
//! This module provides the command-line interface using clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Atrium assistant runtime
///
/// Loads assistant packages, keeps them in a bounded cache and runs chat
/// turns against their connectors or sandboxes.
#[derive(Parser, Debug)]
#[command(name = "atrium")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List built-in and stored assistants
    List {
        /// Only assistants carrying this tag
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Show one assistant
    Show {
        /// Assistant id (e.g. "tests.basic")
        id: String,
    },

    /// Send one message to an assistant and stream the answer
    Chat {
        /// Assistant id
        id: String,

        /// Message text
        message: String,

        /// Chat id to use (a new one by default)
        #[arg(long)]
        chat: Option<String>,

        /// Do not run the automatic search
        #[arg(long)]
        no_search: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["atrium", "list"]);
        assert!(matches!(cli.command, Command::List { tag: None }));
        assert!(!cli.json);
        assert!(cli.log.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["atrium", "--json", "--log", "debug", "show", "tests.basic"]);
        assert!(cli.json);
        assert_eq!(cli.log, Some("debug".to_string()));
        if let Command::Show { id } = cli.command {
            assert_eq!(id, "tests.basic");
        } else {
            panic!("Expected Show command");
        }
    }

    #[test]
    fn test_chat_command() {
        let cli = Cli::parse_from([
            "atrium",
            "chat",
            "tests.basic",
            "what changed in 1.2?",
            "--no-search",
        ]);
        if let Command::Chat {
            id,
            message,
            chat,
            no_search,
        } = cli.command
        {
            assert_eq!(id, "tests.basic");
            assert_eq!(message, "what changed in 1.2?");
            assert!(chat.is_none());
            assert!(no_search);
        } else {
            panic!("Expected Chat command");
        }
    }

    #[test]
    fn test_config_show() {
        let cli = Cli::parse_from(["atrium", "config", "show"]);
        if let Command::Config { action } = cli.command {
            assert!(matches!(action, ConfigAction::Show));
        } else {
            panic!("Expected Config command");
        }
    }
}
