//! Combine finished region outputs into one dataset tagged by region.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cordillera::output;
use cordillera::pipeline::combine::{combine_regions, COMBINED_DIR};

#[derive(Parser, Debug)]
#[command(name = "combine")]
#[command(about = "Combine per-region city outputs")]
struct Args {
    /// Directory holding one sub-directory per region
    #[arg(short, long, default_value = "data/output")]
    output_dir: PathBuf,

    /// Only these region slugs (repeatable)
    #[arg(short, long)]
    region: Vec<String>,

    /// Where to write the combined files (defaults to <output-dir>/combined)
    #[arg(long)]
    dest: Option<PathBuf>,
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let records = combine_regions(&args.output_dir, &args.region)
        .with_context(|| format!("Failed to combine {}", args.output_dir.display()))?;
    if records.is_empty() {
        anyhow::bail!("No region outputs found under {}", args.output_dir.display());
    }

    let dest = args.dest.unwrap_or_else(|| args.output_dir.join(COMBINED_DIR));
    output::write_all(&records, &dest)?;
    info!("Combined {} cities into {}", records.len(), dest.display());
    Ok(())
}
