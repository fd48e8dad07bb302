use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "contest-engine")]
#[command(version = "0.1.0")]
#[command(about = "Competition economy engine: agent ledgers, competition lifecycle, winner allocation", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config directory
    #[arg(short, long, default_value = "config", env = "CONTEST_CONFIG_DIR")]
    pub config: String,

    /// Emit JSON logs regardless of configuration
    #[arg(long)]
    pub json_logs: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the expiry sweeper and renewal scheduler until interrupted
    Serve,
    /// Run one expiry sweep and exit
    Sweep,
    /// Run renewal now, for every agent or a single one
    Renew {
        /// Only renew this agent
        #[arg(long)]
        agent: Option<Uuid>,
    },
    /// Apply database migrations and exit
    Migrate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_renew_with_agent() {
        let id = Uuid::new_v4();
        let cli = Cli::parse_from(["contest-engine", "renew", "--agent", &id.to_string()]);
        match cli.command {
            Some(Commands::Renew { agent }) => assert_eq!(agent, Some(id)),
            _ => panic!("expected renew"),
        }
        assert_eq!(cli.config, "config");
    }

    #[test]
    fn test_no_subcommand_defaults_to_none() {
        let cli = Cli::parse_from(["contest-engine", "--json-logs"]);
        assert!(cli.command.is_none());
        assert!(cli.json_logs);
    }
}
