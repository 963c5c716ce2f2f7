//! # metacache CLI
//!
//! Command-line interface for the metacache metadata search tool.
//!
//! ## Commands
//!
//! - `metacache build` - Bring the cache up to date (full build with `--force`)
//! - `metacache refresh` - Apply only the items changed since the last build
//! - `metacache query <terms>` - Search the cache
//! - `metacache status` - Show cache status and whether it is current
//! - `metacache clear` - Delete the cache file
//!
//! ## Example Usage
//!
//! ```bash
//! # Build the cache for the repository in the current directory
//! metacache build
//!
//! # Psytrance between 140 and 160 bpm, excluding progressive
//! metacache query -- genre:psy -genre:progressive bpm:140-160
//!
//! # Either crate, files present locally only, as JSON
//! metacache query --present-only --output json 'crate:warmup | crate:peak'
//! ```

mod app;
mod commands;

use clap::{Parser, Subcommand};
use metacache_core::Config;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// metacache - search git-annex metadata through a local cache
#[derive(Parser)]
#[command(name = "metacache")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Repository to index (overrides store.repository)
    #[arg(short = 'C', long, global = true, env = "METACACHE_REPOSITORY")]
    repository: Option<PathBuf>,

    /// Cache file (overrides cache.path)
    #[arg(long, global = true, env = "METACACHE_CACHE")]
    cache: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or update the cache
    Build {
        /// Rebuild every item even if the cache is current
        #[arg(short, long)]
        force: bool,
    },

    /// Apply changes since the last build
    Refresh,

    /// Search the cache
    #[command(alias = "q")]
    Query {
        /// Query terms, joined with spaces (put `--` before a leading `-term`)
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        terms: Vec<String>,

        /// Maximum number of results to show (0 = unlimited)
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only show items whose content is present locally
        #[arg(short, long)]
        present_only: bool,

        /// Query the cache as-is without refreshing it first
        #[arg(long)]
        no_refresh: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },

    /// Show cache status
    Status,

    /// Delete the cache
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(repository) = cli.repository {
        config.store.repository = repository;
    }
    if let Some(cache) = cli.cache {
        config.cache.path = Some(cache);
    }

    // Setup logging
    let log_level = if cli.quiet {
        "error".to_string()
    } else {
        match cli.verbose {
            0 => config.general.log_level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    match cli.command {
        Commands::Build { force } => commands::build::run(config, force),
        Commands::Refresh => commands::refresh::run(config),
        Commands::Query {
            terms,
            limit,
            present_only,
            no_refresh,
            output,
        } => commands::query::run(
            config,
            &terms.join(" "),
            limit,
            present_only,
            !no_refresh,
            output,
        ),
        Commands::Status => commands::status::run(config),
        Commands::Clear { yes } => commands::clear::run(config, yes),
    }
}
