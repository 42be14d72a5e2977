use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;

/// Log level options for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// No logging output
    Off,
    /// Error messages only
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages (default for verbose)
    Info,
    /// Debug messages
    Debug,
    /// Trace-level messages (most verbose)
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "sparq")]
#[command(about = "sparq - maintenance tool for sparqlite stores")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Set log level (off, error, warn, info, debug, trace)
    /// Defaults to 'warn'
    #[arg(short = 'l', long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Enable verbose logging (shortcut for --log-level=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Store configuration file (TOML)
    #[arg(short = 'C', long, global = true, env = "SPARQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(short = 'd', long, global = true, env = "SPARQ_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Open the store read-only
    #[arg(long, global = true)]
    pub read_only: bool,

    /// Set output format
    #[arg(short = 'f', long, global = true, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

impl Cli {
    /// Effective log level after applying `--verbose`
    pub fn level(&self) -> LevelFilter {
        match (self.log_level, self.verbose) {
            (Some(level), _) => level.into(),
            (None, true) => LevelFilter::DEBUG,
            (None, false) => LevelFilter::WARN,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show database files, schema version and connection statistics
    Status,

    /// Open the store and report whether it needs attention
    Check,

    /// VACUUM the database if it grew past the threshold
    Vacuum {
        /// Size in bytes above which to vacuum (overrides the config file)
        #[arg(long)]
        threshold: Option<u64>,
    },

    /// Fold the WAL back into the database file
    Checkpoint,

    /// Run a SQL query and print its rows
    Query {
        /// SQL text to run
        sql: String,

        /// Graph databases to attach before running (can be repeated)
        #[arg(short = 'g', long = "graph", value_name = "NAME")]
        graphs: Vec<String>,
    },

    /// Print a table unioned across main and the given graphs
    Union {
        /// Table present in main and in every graph
        table: String,

        /// Graph databases to attach (can be repeated)
        #[arg(short = 'g', long = "graph", value_name = "NAME")]
        graphs: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verbose_means_debug() {
        let cli = Cli::try_parse_from(["sparq", "-v", "status"]).unwrap();
        assert_eq!(cli.level(), LevelFilter::DEBUG);

        let cli = Cli::try_parse_from(["sparq", "-v", "--log-level", "error", "status"]).unwrap();
        assert_eq!(cli.level(), LevelFilter::ERROR);

        let cli = Cli::try_parse_from(["sparq", "status"]).unwrap();
        assert_eq!(cli.level(), LevelFilter::WARN);
    }

    #[test]
    fn test_union_collects_graphs() {
        let cli = Cli::try_parse_from([
            "sparq", "union", "Items", "--graph", "urn:a", "-g", "urn:b",
        ])
        .unwrap();

        match cli.command {
            Commands::Union { table, graphs } => {
                assert_eq!(table, "Items");
                assert_eq!(graphs, vec!["urn:a", "urn:b"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
