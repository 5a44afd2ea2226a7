// this_file: src/main.rs
//! surfpool CLI - drive and inspect the surface allocator

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use surfpool::simulate::{run_simulation, SimulationOptions};
use surfpool::{logging, Config, PixelFormat, SurfaceContext};

/// surfpool - surface allocator and buffer pool tooling
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, global = true, default_value = "info")]
    log_level: String,

    /// Enable quiet mode (only errors)
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic render loop and print a JSON report
    Simulate {
        /// Number of frames to render
        #[arg(short, long, default_value_t = 60)]
        frames: u32,

        /// Surfaces acquired per frame
        #[arg(long, default_value_t = 4)]
        layers: u32,

        /// Surface width in pixels
        #[arg(long, default_value_t = 800)]
        width: u32,

        /// Surface height in pixels
        #[arg(long, default_value_t = 600)]
        height: u32,

        /// Pixel format (rgba32, rgb32, rgb24, rgb16, rgb15, rgba15, cmap8, gray8, gray1)
        #[arg(long, default_value = "rgba32")]
        format: PixelFormat,

        /// Distinct surface widths cycled through by the layers
        #[arg(long, default_value_t = 1)]
        variants: u32,

        /// Worker threads (defaults to one per core)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Configuration file (JSON)
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Validate a configuration file, or print the defaults
    Config {
        /// Configuration file to check
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level, cli.quiet, true);

    match cli.command {
        Commands::Simulate {
            frames,
            layers,
            width,
            height,
            format,
            variants,
            threads,
            config,
        } => {
            let opts = SimulationOptions {
                frames,
                layers,
                width,
                height,
                format,
                size_variants: variants,
            };
            simulate(opts, threads, config)?;
        }
        Commands::Config { input } => {
            check_config(input)?;
        }
        Commands::Version => {
            println!("surfpool version {}", surfpool::VERSION);
            println!("Surface allocator and buffer pool");
        }
    }

    Ok(())
}

fn load_config(path: Option<String>) -> Result<Config> {
    match path {
        Some(path) => Config::load(&path).with_context(|| format!("loading config {}", path)),
        None => Ok(Config::default()),
    }
}

fn simulate(opts: SimulationOptions, threads: Option<usize>, config: Option<String>) -> Result<()> {
    let config = load_config(config)?;
    let ctx = SurfaceContext::new(&config)?;

    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(n) = threads {
        builder = builder.num_threads(n);
    }
    let workers = builder.build().context("building worker pool")?;

    info!(
        "Simulating {} frames of {} {}x{} {} layers",
        opts.frames, opts.layers, opts.width, opts.height, opts.format
    );
    let report = workers.install(|| run_simulation(&ctx, &opts))?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn check_config(input: Option<String>) -> Result<()> {
    match input {
        Some(path) => match Config::load(&path) {
            Ok(config) => {
                println!("✓ Valid configuration");
                println!("{}", config.to_json()?);
                Ok(())
            }
            Err(e) => {
                error!("Invalid configuration {}: {}", path, e);
                println!("✗ Invalid configuration: {}", e);
                Err(e.into())
            }
        },
        None => {
            println!("{}", Config::default().to_json()?);
            Ok(())
        }
    }
}
