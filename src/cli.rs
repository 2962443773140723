use clap::{Parser, Subcommand};
use std::path::PathBuf;

use notifier::models::token::Action;

/// Reimbursement Box notifier: expense emails and one-time action links
#[derive(Parser)]
#[command(name = "rbox-notifier", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply database migrations (Postgres store only)
    Migrate,

    /// Dispatch a notification event (JSON, as posted by the expense app)
    Dispatch {
        /// Read the event from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Redeem a capability token and print the authorized decision
    Consume {
        #[arg(long)]
        token: String,
        /// approve or reject
        #[arg(long)]
        action: Action,
    },

    /// Visit an action link: redeem its token and update the expense
    Redeem {
        #[arg(long)]
        url: String,
    },

    /// Show the current status of a token without consuming it
    Status {
        #[arg(long)]
        token: String,
    },

    /// Expire all outstanding tokens for one reviewer on one expense
    Revoke {
        /// Expense id
        #[arg(long)]
        subject: String,
        /// Reviewer id
        #[arg(long)]
        principal: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_consume_parses_action() {
        let cli = Cli::try_parse_from([
            "rbox-notifier",
            "consume",
            "--token",
            "abc",
            "--action",
            "Reject",
        ])
        .unwrap();
        match cli.command {
            Commands::Consume { token, action } => {
                assert_eq!(token, "abc");
                assert_eq!(action, Action::Reject);
            }
            _ => panic!("expected consume"),
        }
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        assert!(Cli::try_parse_from([
            "rbox-notifier",
            "consume",
            "--token",
            "abc",
            "--action",
            "escalate",
        ])
        .is_err());
    }
}
