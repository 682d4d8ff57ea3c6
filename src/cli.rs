//! Command-line interface argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::orchestrator::{DEFAULT_RECORDS, MAX_RECORDS, MIN_RECORDS};

/// Rewind - match history analysis with rate-limited upstreams
///
/// Fetches a player's recent matches under the telemetry API's quota,
/// aggregates them, and asks a local model for a short narrative.
///
/// Examples:
///   rewind serve --bind 0.0.0.0:8000
///   rewind analyze --player "Faker#KR1" --count 50
///   rewind analyze --player <PUUID> --format json --output report.json
///   rewind sweep --max-age-days 3
///   rewind init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .rewind.toml in the current directory
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Directory for the durable record cache
    #[arg(long, value_name = "DIR", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Telemetry API key
    #[arg(long, env = "RIOT_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    /// Inference service base URL
    #[arg(long, env = "REWIND_INFERENCE_URL", global = true)]
    pub inference_url: Option<String>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP service
    Serve {
        /// Listen address, overrides [server].bind
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Analyze one player in-process and write a report
    Analyze {
        /// Player PUUID, or a Riot ID such as "Name#TAG"
        #[arg(long, value_name = "ID")]
        player: String,

        /// Display name used in the report
        #[arg(long, value_name = "NAME")]
        name: Option<String>,

        /// Number of recent matches to analyze
        #[arg(long, default_value_t = DEFAULT_RECORDS, value_name = "N")]
        count: usize,

        /// Output format (markdown, json)
        #[arg(long, default_value = "markdown", value_name = "FORMAT")]
        format: OutputFormat,

        /// Output file path for the report
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Drop cache entries older than the sweep age
    Sweep {
        /// Overrides [cache].sweep_max_age_days
        #[arg(long, value_name = "DAYS")]
        max_age_days: Option<u64>,
    },

    /// Generate a default .rewind.toml configuration file
    InitConfig,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl OutputFormat {
    pub fn default_output(self) -> PathBuf {
        match self {
            OutputFormat::Markdown => PathBuf::from("rewind_report.md"),
            OutputFormat::Json => PathBuf::from("rewind_report.json"),
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(ref url) = self.inference_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Inference URL must start with 'http://' or 'https://'".to_string());
            }
        }

        match &self.command {
            Command::Analyze { player, count, .. } => {
                if player.trim().is_empty() {
                    return Err("Player id must not be empty".to_string());
                }
                if let Some((name, tag)) = player.split_once('#') {
                    if name.trim().is_empty() || tag.trim().is_empty() {
                        return Err("Riot ID must look like 'Name#TAG'".to_string());
                    }
                }
                if !(MIN_RECORDS..=MAX_RECORDS).contains(count) {
                    return Err(format!(
                        "Count must be between {} and {}",
                        MIN_RECORDS, MAX_RECORDS
                    ));
                }
            }
            Command::Sweep {
                max_age_days: Some(0),
            } => {
                return Err("Max age must be at least 1 day".to_string());
            }
            _ => {}
        }

        Ok(())
    }

    /// Whether the command talks to the telemetry API.
    pub fn needs_api_key(&self) -> bool {
        matches!(self.command, Command::Serve { .. } | Command::Analyze { .. })
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
