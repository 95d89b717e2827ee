//! tessera - CLI

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tessera::runtime::scheduler::Scheduler;
use tessera::util::config::{load_config, RuntimeConfig};
use tessera::util::logger::{self, LogLevel};
use tessera::workload::{run_stress, run_tiles, StressConfig, TilesConfig};
use tessera::{LifoKind, RuntimeContext, NAME, VERSION};

/// Task-ready stacks and a data coherency directory
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Hammer one stack from many threads and check conservation
    Stress {
        #[arg(short, long, default_value_t = 8)]
        threads: usize,

        /// Values pushed per thread per round
        #[arg(short, long, default_value_t = 1000)]
        items: usize,

        #[arg(short, long, default_value_t = 10)]
        rounds: usize,

        /// Push in chains of this length
        #[arg(long, default_value_t = 1)]
        chain_len: usize,

        /// Stack implementation (atomic or locked)
        #[arg(long)]
        lifo: Option<LifoKind>,
    },

    /// Run a tiled update across host and accelerator devices
    Tiles {
        #[arg(short, long, default_value_t = 64)]
        tiles: usize,

        /// Update steps per tile
        #[arg(short, long, default_value_t = 8)]
        steps: usize,

        /// Bytes per tile
        #[arg(long, default_value_t = 4096)]
        tile_size: usize,

        /// Worker threads (overrides configuration)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Stack implementation (atomic or locked)
        #[arg(long)]
        lifo: Option<LifoKind>,
    },

    /// Print the effective configuration
    Config,

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    config
        .apply_env()
        .context("Failed to apply environment overrides")?;

    match &args.command {
        Commands::Tiles { workers, lifo, .. } => {
            if let Some(workers) = workers {
                config.scheduler.num_workers = *workers;
            }
            if let Some(lifo) = lifo {
                config.scheduler.lifo = *lifo;
            }
        }
        Commands::Stress { lifo: Some(lifo), .. } => config.scheduler.lifo = *lifo,
        _ => {}
    }
    config.validate().context("Invalid configuration")?;

    let level = if args.verbose {
        LogLevel::Debug
    } else {
        config.log.level
    };
    logger::init_with_level(level);

    if args.verbose {
        eprintln!("{} version: {}", NAME, VERSION);
        eprintln!("Host: {}", std::env::consts::OS);
    }

    match args.command {
        Commands::Stress {
            threads,
            items,
            rounds,
            chain_len,
            lifo: _,
        } => {
            let report = run_stress(&StressConfig {
                threads,
                items,
                rounds,
                chain_len,
                lifo: config.scheduler.lifo,
            })
            .context("Stress run failed")?;

            emit(args.json, &report, || {
                println!(
                    "{} stack, {} threads: pushed {} popped {} (drained {}) in {} ms, {:.0} ops/s",
                    report.lifo,
                    report.threads,
                    report.pushed,
                    report.popped,
                    report.drained,
                    report.elapsed_ms,
                    report.ops_per_sec
                );
                println!(
                    "conservation: {}",
                    if report.conserved { "ok" } else { "VIOLATED" }
                );
            })?;
            if !report.conserved {
                anyhow::bail!("values were lost or duplicated");
            }
        }
        Commands::Tiles {
            tiles,
            steps,
            tile_size,
            ..
        } => {
            let context = RuntimeContext::from_config(&config).context("Failed to set up devices")?;
            let scheduler = Scheduler::with_config(Arc::new(context), &config)
                .context("Failed to start scheduler")?;
            let report = run_tiles(
                &scheduler,
                &TilesConfig {
                    tiles,
                    steps,
                    tile_size,
                },
            )
            .context("Tiles run failed")?;

            emit(args.json, &report, || {
                println!(
                    "{} tiles x {} steps verified in {} ms on {} workers",
                    report.verified,
                    report.steps,
                    report.elapsed_ms,
                    scheduler.num_workers()
                );
                println!(
                    "transfers: {} ({} bytes), tasks: {} completed, {} stolen",
                    report.transport.transfers,
                    report.transport.bytes_moved,
                    report.scheduler.tasks_completed,
                    report.scheduler.tasks_stolen
                );
            })?;
        }
        Commands::Config => {
            print_config(&config)?;
        }
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
        }
    }

    Ok(())
}

fn emit<T: Serialize>(
    json: bool,
    report: &T,
    human: impl FnOnce(),
) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(report).context("Failed to encode report")?;
        println!("{text}");
    } else {
        human();
    }
    Ok(())
}

fn print_config(config: &RuntimeConfig) -> Result<()> {
    let text = config.to_toml().context("Failed to encode configuration")?;
    print!("{text}");
    Ok(())
}
