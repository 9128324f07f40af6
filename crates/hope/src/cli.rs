//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

/// HOPE knowledge cache CLI
///
/// Inspect and teach the tiered knowledge cache, or serve questions with a
/// cached fast path and a streaming generator.
#[derive(Parser, Debug)]
#[command(name = "hope")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, env = "HOPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// JSON log lines and machine-readable output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Look a question up in every tier
    Query {
        /// Question text
        question: String,

        /// Conversation to use for context
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Teach the cache an answer
    Save(SaveArgs),

    /// Rate a cached answer (1-5)
    Rate(RateArgs),

    /// Record feedback on a permanent fact
    Feedback(FeedbackArgs),

    /// Promote eligible cached answers to permanent facts
    Promote,

    /// Remove expired and promoted cached answers
    Cleanup,

    /// Show statistics for every tier
    Stats,

    /// List permanent facts
    Facts {
        /// Include disabled facts
        #[arg(short, long)]
        all: bool,
    },

    /// Answer questions from stdin until Ctrl-C
    Serve(ServeArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Knowledge Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct SaveArgs {
    /// Question text
    pub question: String,

    /// Answer text
    pub answer: String,

    /// Rating (answers rated below 4 are not stored)
    #[arg(short, long, default_value_t = 5, value_parser = clap::value_parser!(u8).range(1..=5))]
    pub rating: u8,

    /// Conversation the answer belongs to
    #[arg(short, long)]
    pub session: Option<String>,
}

#[derive(Args, Debug)]
pub struct RateArgs {
    /// Cached answer ID
    pub id: String,

    /// Rating
    #[arg(value_parser = clap::value_parser!(u8).range(1..=5))]
    pub rating: u8,

    /// Rater role (expert, power_user, regular, new_user)
    #[arg(long, default_value = "regular")]
    pub role: String,

    /// Rater's historical accuracy (0-1)
    #[arg(long)]
    pub accuracy: Option<f64>,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("verdict").required(true).args(["positive", "negative"])))]
pub struct FeedbackArgs {
    /// Fact ID
    pub fact_id: String,

    /// The fact answered the question well
    #[arg(long)]
    pub positive: bool,

    /// The fact was wrong or unhelpful
    #[arg(long)]
    pub negative: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Serve
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Conversation ID for session context (one is generated if omitted)
    #[arg(short, long)]
    pub conversation: Option<String>,

    /// User ID recorded on each session
    #[arg(short, long)]
    pub user: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_save_rating_defaults_to_five() {
        let cli = Cli::parse_from(["hope", "save", "What is tokio?", "An async runtime."]);
        match cli.command {
            Commands::Save(args) => {
                assert_eq!(args.rating, 5);
                assert!(args.session.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_rating_out_of_range_rejected() {
        assert!(Cli::try_parse_from(["hope", "rate", "qa_1", "6"]).is_err());
        assert!(Cli::try_parse_from(["hope", "rate", "qa_1", "0"]).is_err());
    }

    #[test]
    fn test_feedback_requires_one_verdict() {
        assert!(Cli::try_parse_from(["hope", "feedback", "builtin_docker"]).is_err());
        assert!(Cli::try_parse_from(["hope", "feedback", "builtin_docker", "--positive", "--negative"]).is_err());

        let cli = Cli::parse_from(["hope", "feedback", "builtin_docker", "--negative"]);
        assert!(matches!(cli.command, Commands::Feedback(FeedbackArgs { negative: true, .. })));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["hope", "stats", "--json", "--config", "/tmp/hope.toml"]);
        assert!(cli.json);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/hope.toml")));
    }
}
