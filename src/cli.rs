//! Operator command line
//!
//! Parsed with clap; execution lives in the binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::models::{CustomerId, TechnicianId};

/// Nearest-technician dispatch against the local SQLite database
#[derive(Parser, Debug)]
#[command(name = "proximity_dispatch", version)]
#[command(about = "Assigns the nearest free technician to a customer", long_about = None)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Load customers and technicians from JSON files (upsert by id)
    Seed {
        #[arg(value_name = "CUSTOMERS_JSON")]
        customers: PathBuf,

        #[arg(value_name = "TECHNICIANS_JSON")]
        technicians: PathBuf,
    },

    /// Rank and choose a technician without writing anything
    Recommend {
        #[arg(value_name = "CUSTOMER_ID")]
        customer_id: CustomerId,
    },

    /// Rank, choose and commit an assignment
    Dispatch {
        #[arg(value_name = "CUSTOMER_ID")]
        customer_id: CustomerId,
    },

    /// Return a technician to the free pool
    Release {
        #[arg(value_name = "TECHNICIAN_ID")]
        technician_id: TechnicianId,
    },
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
    fn test_subcommands_parse() {
        let cli = Cli::try_parse_from(["proximity_dispatch", "dispatch", "42"]).unwrap();
        assert_eq!(cli.command, Command::Dispatch { customer_id: 42 });

        let cli = Cli::try_parse_from(["proximity_dispatch", "seed", "c.json", "t.json"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Seed { customers: PathBuf::from("c.json"), technicians: PathBuf::from("t.json") }
        );

        let cli = Cli::try_parse_from(["proximity_dispatch", "release", "7"]).unwrap();
        assert_eq!(cli.command, Command::Release { technician_id: 7 });
    }

    #[test]
    fn test_bad_arguments_are_rejected() {
        assert!(Cli::try_parse_from(["proximity_dispatch"]).is_err());
        assert!(Cli::try_parse_from(["proximity_dispatch", "recommend", "abc"]).is_err());
        assert!(Cli::try_parse_from(["proximity_dispatch", "seed", "only-one.json"]).is_err());
        assert!(Cli::try_parse_from(["proximity_dispatch", "teleport", "1"]).is_err());
    }
}
