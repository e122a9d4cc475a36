//! BUSCO worker main executable

pub mod common;
pub mod dataset;
pub mod err;
pub mod genome;
pub mod hmmer;
pub mod metaeuk;
pub mod report;

use clap::{Args, Parser, Subcommand};
use console::{Emoji, Term};

/// CLI parser based on clap.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Assess genome assembly completeness",
    long_about = "This tool searches an assembly for a lineage's single-copy orthologs \
    and reports per-ortholog status and an aggregate completeness summary"
)]
struct Cli {
    /// Commonly used arguments
    #[command(flatten)]
    common: common::Args,

    /// The sub command to run
    #[command(subcommand)]
    command: Commands,
}

/// Enum supporting the parsing of top-level commands.
#[derive(Debug, Subcommand)]
enum Commands {
    /// Genome-mode commands.
    Genome(Genome),
}

/// Parsing of "genome *" sub commands.
#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct Genome {
    /// The sub command to run
    #[command(subcommand)]
    command: GenomeCommands,
}

/// Enum supporting the parsing of "genome *" sub commands.
#[derive(Debug, Subcommand)]
enum GenomeCommands {
    Run(genome::Args),
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Build a tracing subscriber according to the configuration in `cli.common`.
    let collector = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(match cli.common.verbose.log_level() {
            Some(level) => match level {
                log::Level::Error => tracing::Level::ERROR,
                log::Level::Warn => tracing::Level::WARN,
                log::Level::Info => tracing::Level::INFO,
                log::Level::Debug => tracing::Level::DEBUG,
                log::Level::Trace => tracing::Level::TRACE,
            },
            None => tracing::Level::INFO,
        })
        .compact()
        .finish();

    // Install collector and go into sub commands.
    let term = Term::stderr();
    tracing::subscriber::with_default(collector, || {
        match &cli.command {
            Commands::Genome(genome) => match &genome.command {
                GenomeCommands::Run(args) => {
                    genome::run(&cli.common, args)?;
                }
            },
        }

        Ok::<(), anyhow::Error>(())
    })?;
    term.write_line(&format!("All done. Have a nice day!{}", Emoji(" 😃", "")))?;

    Ok(())
}
