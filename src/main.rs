use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use assetfs::{OpenOptions, Vfs};

#[derive(Parser)]
#[command(name = "assetfs")]
#[command(about = "Inspect an asset store (index + data file pair)", long_about = None)]
struct Cli {
    /// Index file of the store
    #[arg(long, value_name = "PATH")]
    index: PathBuf,

    /// Data file of the store
    #[arg(long, value_name = "PATH")]
    data: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Print usage statistics")]
    Stat,
    #[command(about = "Print every file block and free extent")]
    Map,
    #[command(about = "Verify the index file against the replayed state")]
    Audit,
    #[command(about = "Write every stored payload out as individual files")]
    Extract {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    #[command(about = "Touch both files to check filesystem liveness")]
    Poke,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let read_only = !matches!(cli.command, Commands::Poke);
    let vfs = Vfs::open(
        &cli.index,
        &cli.data,
        OpenOptions {
            read_only,
            ..Default::default()
        },
    )
    .with_context(|| format!("failed to open store {}", cli.data.display()))?;

    match cli.command {
        Commands::Stat => vfs.dump_statistics(),
        Commands::Map => vfs.dump_map(),
        Commands::Audit => {
            if !vfs.audit() {
                bail!("audit found problems");
            }
        }
        Commands::Extract { dir } => {
            let count = vfs.dump_files(&dir)?;
            println!("extracted {count} assets to {}", dir.display());
        }
        Commands::Poke => vfs.poke_files(),
    }
    Ok(())
}
