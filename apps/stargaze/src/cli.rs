use std::path::PathBuf;

use clap::{Parser, Subcommand};
use scope_registry::TelescopeStatus;

#[derive(Parser, Debug)]
#[command(name = "stargaze")]
#[command(about = "Browse remote telescopes and run viewing or control sessions")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (TOML). Defaults to ./stargaze.toml when present.
    #[arg(long, global = true, env = "STARGAZE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the session metrics in text exposition format before exiting
    #[arg(long, global = true)]
    pub print_metrics: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List telescopes with their status and price
    List,

    /// Show the specifications of one telescope
    Details { telescope_id: String },

    /// Lease a telescope and watch its stream
    View { telescope_id: String },

    /// Lease a telescope, watch its stream and steer it from stdin
    Control { telescope_id: String },

    /// Request a status transition on behalf of the configured holder
    SetStatus {
        telescope_id: String,
        #[arg(value_parser = parse_status)]
        status: TelescopeStatus,
    },

    /// Publish the topics the telescope should look at
    Interests {
        telescope_id: String,
        #[arg(long = "topic", required = true)]
        topics: Vec<String>,
    },

    /// Register a telescope described by a JSON file
    Register {
        #[arg(long)]
        file: PathBuf,
    },

    /// Replace a telescope's description with the contents of a JSON file
    Update {
        telescope_id: String,
        #[arg(long)]
        file: PathBuf,
    },

    /// Remove a telescope from the backend
    Remove { telescope_id: String },
}

fn parse_status(value: &str) -> Result<TelescopeStatus, String> {
    value.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_set_status_in_either_spelling() {
        let cli = Cli::try_parse_from(["stargaze", "set-status", "T1", "locked"]).expect("parses");
        match cli.command {
            Commands::SetStatus {
                telescope_id,
                status,
            } => {
                assert_eq!(telescope_id, "T1");
                assert_eq!(status, TelescopeStatus::Locked);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["stargaze", "set-status", "T1", "broken"]).is_err());
    }

    #[test]
    fn interests_need_at_least_one_topic() {
        assert!(Cli::try_parse_from(["stargaze", "interests", "T1"]).is_err());
        let cli = Cli::try_parse_from([
            "stargaze",
            "interests",
            "T1",
            "--topic",
            "moon",
            "--topic",
            "jupiter",
        ])
        .expect("parses");
        match cli.command {
            Commands::Interests { topics, .. } => assert_eq!(topics, vec!["moon", "jupiter"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "stargaze",
            "control",
            "T1",
            "--print-metrics",
            "--config",
            "dev.toml",
        ])
        .expect("parses");
        assert!(cli.print_metrics);
        assert_eq!(cli.config, Some(PathBuf::from("dev.toml")));
        assert!(matches!(cli.command, Commands::Control { .. }));
    }
}
