//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "kbsift",
    version,
    about = "Multi-knowledge-base retrieval with reranking and structured-output recovery",
    long_about = "kbsift searches several independently maintained vector indexes at once, merges and \
                  de-duplicates their hits, spreads the candidates across sources, reranks them with an \
                  optional LLM judge and answers questions with numbered references."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/kbsift/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration profile to apply
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Use the caller's own knowledge bases instead of the shared ones
    #[arg(long, global = true, value_name = "ID")]
    pub caller: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Retrieve the most relevant chunks for a query
    Search {
        /// Search query text
        query: String,

        /// Number of results to return
        #[arg(short = 'k', long, default_value = "5")]
        top_k: usize,

        /// Only return chunks from this knowledge base
        #[arg(long)]
        kb: Option<String>,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Answer a question from the knowledge bases, with references
    Ask {
        /// Question to ask
        question: String,

        /// Number of reference chunks
        #[arg(short = 'k', long, default_value = "5")]
        top_k: usize,

        /// Only use chunks from this knowledge base
        #[arg(long)]
        kb: Option<String>,

        /// Show the answer in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Add pre-chunked JSONL records ({"content", "source"}) to every index
    Ingest {
        /// JSONL file, one chunk per line
        file: PathBuf,

        /// Tag every source with this knowledge-base id
        #[arg(long)]
        kb: Option<String>,
    },

    /// Delete every chunk belonging to a knowledge base
    DeleteKb {
        /// Knowledge-base id
        kb_id: String,
    },

    /// Recover JSON from near-JSON model output (file or stdin)
    Recover {
        /// Input file (reads stdin when omitted)
        file: Option<PathBuf>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
