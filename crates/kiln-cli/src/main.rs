//! Kiln command-line tool
//!
//! Inspects code units and compiles them offline through the same driver a
//! host embeds, cache included.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Method JIT for CPython 3.10 wordcode", long_about = None)]
#[command(version)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the block graph and dataflow facts of a unit
    Analyze {
        /// Code unit description (JSON)
        unit: PathBuf,
    },

    /// Compile a unit and report the artifact
    Compile {
        /// Code unit description (JSON)
        unit: PathBuf,
        /// Cache directory (overrides KILN_CACHE_ROOT)
        #[arg(long)]
        cache_root: Option<PathBuf>,
        /// Skip the artifact cache
        #[arg(long, conflicts_with = "cache_root")]
        no_cache: bool,
        /// Print the emitted IR
        #[arg(long)]
        dump_ir: bool,
    },

    /// List the records in a cache file
    Cache {
        /// Cache file (`*.kiln-310.bin`)
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Analyze { unit } => commands::analyze::execute(&unit),
        Commands::Compile { unit, cache_root, no_cache, dump_ir } => {
            commands::compile::execute(&unit, cache_root, no_cache, dump_ir)
        }
        Commands::Cache { file } => commands::cache::execute(&file),
    }
}
