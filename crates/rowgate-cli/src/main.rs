//! Rowgate Command-Line Tool
//!
//! Validates policy bundles, filters rows, authorizes writes and explains
//! decisions against a policy bundle file or a persistent catalog.

mod commands;
mod formatter;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use formatter::OutputFormat;
use rowgate_core::{Command, WriteCommand};
use tracing_subscriber::EnvFilter;

use crate::commands::{CliError, Sources};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Row-level authorization policy tool
#[derive(Parser, Debug)]
#[command(name = "rowgate")]
#[command(version, about = "Row-level authorization policy tool")]
pub struct Args {
    /// Engine configuration file (JSON)
    #[arg(long, global = true, env = "ROWGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Policy bundle file (JSON)
    #[arg(long, global = true, env = "ROWGATE_POLICIES")]
    pub policies: Option<PathBuf>,

    /// Policy catalog directory
    #[arg(long, global = true)]
    pub catalog: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "table", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Register every policy and report collections that are locked out
    Validate,

    /// Print the rows a principal may read
    Read {
        #[arg(long)]
        collection: String,
        /// Claims context file (JSON)
        #[arg(long)]
        context: PathBuf,
        /// Candidate rows file (JSON array of objects)
        #[arg(long)]
        rows: PathBuf,
    },

    /// Authorize a write; exits with status 2 when denied
    Write {
        #[arg(long)]
        collection: String,
        #[arg(long)]
        command: WriteCommand,
        #[arg(long)]
        context: PathBuf,
        /// Proposed row (INSERT, UPDATE) or target row (DELETE)
        #[arg(long)]
        row: PathBuf,
        /// Existing row, for an UPDATE
        #[arg(long)]
        existing: Option<PathBuf>,
    },

    /// Show the applicable policies, pushdown predicate and index hints
    Explain {
        #[arg(long)]
        collection: String,
        #[arg(long)]
        command: Command,
        #[arg(long)]
        context: PathBuf,
        /// Evaluate the policies against this row as well
        #[arg(long)]
        row: Option<PathBuf>,
    },

    /// Persist a policy bundle into the catalog
    Import,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rowgate=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        match e.downcast_ref::<CliError>() {
            Some(cli) => eprintln!("Error: {}", cli.render()),
            None => eprintln!("Error: {}", e),
        }
        let denied = matches!(e.downcast_ref::<CliError>(), Some(CliError::Denied(_)));
        std::process::exit(if denied { 2 } else { 1 });
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let sources = Sources::new(args.config, args.policies, args.catalog);
    let format = args.format;

    let output = match args.command {
        Action::Validate => commands::validate(&sources, format)?,
        Action::Read {
            collection,
            context,
            rows,
        } => commands::read(&sources, &collection, &context, &rows, format)?,
        Action::Write {
            collection,
            command,
            context,
            row,
            existing,
        } => commands::write(
            &sources,
            &collection,
            command,
            &context,
            &row,
            existing.as_deref(),
            format,
        )?,
        Action::Explain {
            collection,
            command,
            context,
            row,
        } => commands::explain(&sources, &collection, command, &context, row.as_deref(), format)?,
        Action::Import => commands::import(&sources, format)?,
    };

    println!("{}", output);
    Ok(())
}
