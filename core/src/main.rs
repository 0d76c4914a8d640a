//! MCL SIM: replay range/odometry cycle logs through the Monte Carlo localizer.
//!
//! Parameters come from a configuration file (TOML/JSON/YAML) and can be overridden on the
//! command line. Without an input log a synthetic straight-line track is generated.
use clap::Parser;
use log::{error, info};
use nalgebra::Vector2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::error::Error;
use std::path::PathBuf;

use mcl::barrier::BarrierCorrector;
use mcl::config::SimulationConfig;
use mcl::filter::{InitialPlacement, MonteCarloLocalizer};
use mcl::particle::ParticleResamplingStrategy;
use mcl::sim::{CycleRecord, EstimateRecord, TrackConfig, replay, synthesize_track};

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Replay odometry and range logs through a Monte Carlo localizer.")]
struct Cli {
    /// Configuration file (TOML/JSON/YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cycle log to replay (CSV); overrides the configuration
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output CSV for the estimates; overrides the configuration
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of particles
    #[arg(long)]
    particles: Option<usize>,

    /// Random seed (0 for a random seed)
    #[arg(long)]
    seed: Option<u64>,

    /// Resampling strategy
    #[arg(long, value_enum)]
    resampling: Option<ParticleResamplingStrategy>,

    /// Initial particle placement
    #[arg(long, value_enum)]
    placement: Option<InitialPlacement>,

    /// Blend estimates with odometry dead reckoning
    #[arg(long)]
    smoothing: bool,

    /// Number of synthetic cycles to generate when no input log is given
    #[arg(long, default_value_t = 200)]
    steps: usize,

    /// Write the effective configuration to this file and exit
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Initialize the logger with the specified configuration.
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn build_config(cli: &Cli) -> Result<SimulationConfig, Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            SimulationConfig::from_file(path)?
        }
        None => SimulationConfig::default(),
    };
    if let Some(input) = &cli.input {
        config.input = Some(input.clone());
    }
    if let Some(output) = &cli.output {
        config.output = Some(output.clone());
    }
    if let Some(n) = cli.particles {
        config.filter.num_particles = n;
    }
    if let Some(seed) = cli.seed {
        config.filter.seed = seed;
    }
    if let Some(strategy) = cli.resampling {
        config.filter.resampling_strategy = strategy;
    }
    if let Some(placement) = cli.placement {
        config.filter.initial_placement = placement;
    }
    config.smoothing |= cli.smoothing;
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = build_config(&cli)?;
    if let Some(path) = &cli.write_config {
        config.to_file(path)?;
        info!("Configuration written to {}", path.display());
        return Ok(());
    }

    let records = match &config.input {
        Some(path) => CycleRecord::from_csv(path)?,
        None => {
            info!("No input log given; synthesizing {} cycles", cli.steps);
            let corrector = BarrierCorrector::new(config.map, config.barriers.clone());
            let track = TrackConfig {
                start: config.initial_position,
                steps: cli.steps,
                ..Default::default()
            };
            let mut rng = StdRng::seed_from_u64(config.filter.seed);
            synthesize_track(&track, &corrector, &mut rng)?
        }
    };

    let initial = Vector2::new(config.initial_position[0], config.initial_position[1]);
    let mut localizer = MonteCarloLocalizer::new(
        initial,
        config.map,
        config.barriers.clone(),
        config.filter.clone(),
    );
    let results = replay(&mut localizer, &records, config.smoothing);

    match &config.output {
        Some(path) => {
            EstimateRecord::to_csv(&results, path)?;
            info!("Results written to {}", path.display());
        }
        None => {
            if let Some(last) = results.last() {
                println!("{:.3},{:.3}", last.x, last.y);
            }
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logger(&cli.log_level, cli.log_file.as_ref()) {
        eprintln!("Failed to initialize logger: {}", e);
    }
    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}
