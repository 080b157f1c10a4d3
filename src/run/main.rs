//! Region pipeline runner.
//!
//! Fetches, reconciles and enriches the cities of one or more mountain
//! regions, caching every stage so a run can resume part-way.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cordillera::config::{AirportMode, Config, HospitalMode, RegionConfig};
use cordillera::discord::DiscordWebhook;
use cordillera::perimeter::Perimeter;
use cordillera::pipeline::{RegionPipeline, RunOptions, Stage};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[command(name = "cordillera")]
#[command(about = "Reconcile and enrich mountain-region cities")]
struct Args {
    /// TOML config file; built-in regions and defaults are used without one
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Region slug to run (repeatable); defaults to every configured region
    #[arg(short, long)]
    region: Vec<String>,

    /// Start at this stage using the cached output of the stage before it
    #[arg(long, value_enum)]
    resume_from: Option<Stage>,

    /// Stop after this stage
    #[arg(long, value_enum)]
    stop_after: Option<Stage>,

    /// Leave missing elevations empty
    #[arg(long)]
    skip_elevation: bool,

    #[arg(long, value_enum)]
    hospital_mode: Option<HospitalMode>,

    #[arg(long, value_enum)]
    airport_mode: Option<AirportMode>,

    /// Discord webhook URL for notifications (optional)
    #[arg(long)]
    discord_webhook: Option<String>,
}

const BUILTIN_REGIONS: [&str; 6] = ["alps", "pyrenees", "rockies", "sierra_nevada", "cascade_range", "coast_mountains"];

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::with_builtin_regions(&BUILTIN_REGIONS),
    };

    config.credentials.apply_env();
    if args.skip_elevation {
        config.elevation.skip = true;
    }
    if let Some(mode) = args.hospital_mode {
        config.hospitals.mode = mode;
    }
    if let Some(mode) = args.airport_mode {
        config.airports.mode = mode;
    }
    if args.discord_webhook.is_some() {
        config.global.discord_webhook = args.discord_webhook.clone();
    }
    Ok(config)
}

fn select_regions(config: &Config, slugs: &[String]) -> Result<Vec<RegionConfig>> {
    if slugs.is_empty() {
        if config.regions.is_empty() {
            anyhow::bail!("No regions configured; pass --region or add [[regions]] to the config");
        }
        return Ok(config.regions.clone());
    }
    slugs
        .iter()
        .map(|slug| {
            config
                .region(slug)
                .cloned()
                .or_else(|| RegionConfig::builtin(slug))
                .with_context(|| format!("Unknown region '{}'", slug))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let config = load_config(&args)?;
    let mut regions = select_regions(&config, &args.region)?;
    if args.config.is_none() && args.region.is_empty() {
        // Built-in regions without a perimeter on disk or a fallback box cannot run
        regions.retain(|r| {
            match Perimeter::resolve(r.perimeter_geojson.as_deref(), &config.global.data_dir, &r.slug) {
                Ok(_) => true,
                Err(e) => {
                    warn!("Skipping region {}: {}", r.slug, e);
                    false
                }
            }
        });
        if regions.is_empty() {
            anyhow::bail!("No built-in region has a perimeter; pass --region or --config");
        }
    }

    let client = reqwest::Client::builder()
        .user_agent(&config.global.user_agent)
        .timeout(Duration::from_secs(config.global.http_timeout_secs))
        .gzip(true)
        .build()
        .context("Failed to build HTTP client")?;

    let discord = config
        .global
        .discord_webhook
        .as_ref()
        .map(|url| DiscordWebhook::new(url.clone(), client.clone()));

    let options = RunOptions {
        resume_from: args.resume_from,
        stop_after: args.stop_after,
    };

    info!("Cordillera: {} region(s)", regions.len());
    if let Some(ref dw) = discord {
        let names: Vec<&str> = regions.iter().map(|r| r.slug.as_str()).collect();
        let _ = dw
            .send_notification(
                "Run Started",
                &format!("Regions: **{}**", names.join(", ")),
                true,
                &[],
            )
            .await;
    }

    let mut failed = Vec::new();
    for region in &regions {
        let mut pipeline = RegionPipeline::new(&config, region, client.clone(), options);
        info!("Region {} ({}) run {}", region.name, region.slug, pipeline.run_id());

        match pipeline.run().await {
            Ok(summary) => {
                summary.log();
                if let Some(ref dw) = discord {
                    let _ = dw
                        .send_notification(
                            "Region Complete",
                            &format!("**{}** finished", region.name),
                            true,
                            &[
                                ("cities", summary.total.to_string()),
                                ("with population", summary.with_population.to_string()),
                                ("with elevation", summary.with_elevation.to_string()),
                            ],
                        )
                        .await;
                }
            }
            Err(e) => {
                error!("Region {} failed: {}", region.slug, e);
                if let Some(ref dw) = discord {
                    let _ = dw
                        .send_notification(
                            "Region Failed",
                            &format!("**{}**: {}", region.name, e),
                            false,
                            &[],
                        )
                        .await;
                }
                if e.aborts_run() {
                    return Err(e).with_context(|| format!("Region {} aborted", region.slug));
                }
                failed.push(region.slug.clone());
            }
        }
    }

    if !failed.is_empty() {
        anyhow::bail!(
            "{} of {} region(s) failed: {}",
            failed.len(),
            regions.len(),
            failed.join(", ")
        );
    }
    Ok(())
}
