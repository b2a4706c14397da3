use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "parley", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file path
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config_path: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the relay gateway (default)
    Serve {
        /// Gateway host
        #[arg(long)]
        host: Option<String>,

        /// Gateway port
        #[arg(short, long)]
        port: Option<u16>,

        /// Development mode (verbose logging)
        #[arg(short, long)]
        dev: bool,

        /// Accept identify requests that carry a bare user id
        #[arg(long)]
        allow_unauthenticated: bool,
    },

    /// Initialize configuration
    Init,

    /// Generate sample configuration
    ConfigSample {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Add or update a user in the directory
    AddUser {
        user_id: String,

        /// Display name (defaults to the user id)
        #[arg(short, long)]
        name: Option<String>,

        /// Avatar URL or path
        #[arg(short, long)]
        avatar: Option<String>,
    },

    /// Create a group room
    AddRoom {
        room_id: String,

        /// Room name (defaults to the room id)
        #[arg(short, long)]
        name: Option<String>,

        /// Creator, added as the first member
        #[arg(long)]
        created_by: Option<String>,
    },

    /// Add a user to a group room
    AddMember { room_id: String, user_id: String },

    /// Print stored messages of a room or a direct conversation
    History {
        /// Group room id
        #[arg(long, conflicts_with = "pair")]
        room: Option<String>,

        /// The two participants of a direct conversation
        #[arg(long, num_args = 2, value_names = ["USER_A", "USER_B"])]
        pair: Option<Vec<String>>,

        /// Show at most this many (most recent) messages
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Mint a bearer token for a user
    IssueToken {
        user_id: String,

        #[arg(short, long, default_value = "user")]
        role: String,

        /// Append the token to the config file instead of only printing it
        #[arg(long)]
        save: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_defaults_to_serve() {
        let cli = Cli::try_parse_from(["parley"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_serve_flags() {
        let cli = Cli::try_parse_from([
            "parley",
            "-c",
            "/tmp/p.yaml",
            "serve",
            "--port",
            "9000",
            "--dev",
        ])
        .unwrap();
        assert_eq!(cli.config_path.as_deref(), Some("/tmp/p.yaml"));
        match cli.command {
            Some(Commands::Serve { port, dev, .. }) => {
                assert_eq!(port, Some(9000));
                assert!(dev);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_history_pair_takes_two_users() {
        let cli = Cli::try_parse_from(["parley", "history", "--pair", "alice", "bob"]).unwrap();
        match cli.command {
            Some(Commands::History { room, pair, limit }) => {
                assert!(room.is_none());
                assert_eq!(pair, Some(vec!["alice".to_string(), "bob".to_string()]));
                assert_eq!(limit, 50);
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let conflict =
            Cli::try_parse_from(["parley", "history", "--room", "r", "--pair", "a", "b"]);
        assert!(conflict.is_err());
    }
}
