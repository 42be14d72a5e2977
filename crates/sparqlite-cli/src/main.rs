use anyhow::Result;
use clap::Parser;
use tracing::debug;

use sparqlite_cli::{
    cli::{Cli, Commands},
    commands,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = cli.level();
    let env_filter = format!("sparqlite_store={},sparqlite_cli={}", level, level);
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(env_filter))
        .with_writer(std::io::stderr)
        .init();

    let config = sparqlite_cli::load_config(&cli)?;
    let options = sparqlite_cli::open_options(&cli);
    debug!(data_dir = ?config.data_dir, read_only = options.read_only, "Opening store");

    match cli.command {
        Commands::Status => commands::status::execute(config, options, cli.format)?,

        Commands::Check => commands::maintenance::check(config, options, cli.format)?,

        Commands::Vacuum { threshold } => {
            commands::maintenance::vacuum(config, options, threshold)?
        }

        Commands::Checkpoint => commands::maintenance::checkpoint(config, options)?,

        Commands::Query { sql, graphs } => {
            commands::query::execute(config, options, &sql, &graphs, cli.format)?
        }

        Commands::Union { table, graphs } => {
            commands::query::union(config, options, &table, &graphs, cli.format)?
        }
    }

    Ok(())
}
