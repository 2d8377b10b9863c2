use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Send messages to Tether sessions and inspect their transcripts.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, author)]
pub struct Cli {
    /// Path to the session database file (defaults to ~/.tether/sessions.db)
    #[arg(long, env = "TETHER_SESSION_DB", global = true)]
    pub session_db: Option<PathBuf>,

    /// Keep sessions in memory only; nothing is written to disk
    #[arg(long, global = true)]
    pub memory: bool,

    /// Path to a TOML configuration file
    #[arg(long, env = "TETHER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Write logs to a timestamped file in this directory instead of stderr
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Send a message and stream the reply to stdout
    Send {
        /// Session to send to (a new session is created when omitted)
        #[arg(long)]
        session: Option<String>,
        /// Also stream reasoning output, to stderr
        #[arg(long)]
        show_reasoning: bool,
        /// Message text (read from stdin when omitted)
        text: Option<String>,
    },
    /// Print a session's transcript
    Show {
        #[arg(long)]
        session: String,
        /// Print the transcript as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum SessionCommands {
    /// List stored sessions
    List,
    /// Delete a session and its transcript
    Delete {
        /// Session ID to delete
        session_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_with_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["tether", "send", "--session", "s1", "hi", "--memory"])
            .expect("parse");
        assert!(cli.memory);
        match cli.command {
            Commands::Send {
                session,
                show_reasoning,
                text,
            } => {
                assert_eq!(session.as_deref(), Some("s1"));
                assert!(!show_reasoning);
                assert_eq!(text.as_deref(), Some("hi"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_session_subcommands() {
        let cli = Cli::try_parse_from(["tether", "sessions", "delete", "abc"]).expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Sessions {
                command: SessionCommands::Delete { ref session_id }
            } if session_id == "abc"
        ));
    }

    #[test]
    fn show_requires_a_session() {
        assert!(Cli::try_parse_from(["tether", "show"]).is_err());
    }
}
