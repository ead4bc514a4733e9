use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "listwatch")]
#[command(
    author,
    version,
    about = "Tracks the lifecycle of listings published by an upstream API"
)]
#[command(after_help = "Examples:
  listwatch migrate
  listwatch run
  listwatch run --region 1168000000
  listwatch credentials add --token abc123 --expires-in 3600")]
pub struct Config {
    /// PostgreSQL database connection URL (required by `run` and `migrate`)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Path to the TOML configuration file
    #[arg(short, long, global = true, env = "LISTWATCH_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Collect, reconcile and persist listings
    #[command(after_help = "Examples:
  listwatch run                      # Run all enabled regions from config
  listwatch run --region 1168000000  # Run one region by code or name")]
    Run {
        /// Run a single region (code or name from config)
        #[arg(short, long, value_name = "REGION")]
        region: Option<String>,
    },
    /// Manage the credential pool
    Credentials {
        #[command(subcommand)]
        action: CredentialAction,
    },
    /// Apply pending database migrations
    Migrate,
}

/// Credential pool operations
#[derive(Subcommand, Debug)]
pub enum CredentialAction {
    /// List pooled credentials with their expiry
    List,
    /// Add a credential obtained out of band
    Add {
        /// Bearer token
        #[arg(long)]
        token: String,
        /// Seconds until the token expires
        #[arg(long, value_name = "SECS")]
        expires_in: i64,
    },
    /// Remove expired credentials from the pool
    Prune,
}
