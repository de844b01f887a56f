//! CLI Entry Point for rust_fluidics
//!
//! Runs one router operation per invocation against the bench described in the configuration
//! file. Every completed delivery leg is printed to stdout as a JSON line; logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! rust_fluidics --config config/fluidics.toml transfer naoh cell 12
//! rust_fluidics --simulate mix naoh=3 hcl=2 --increment 1 --prime
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_fluidics::config::FluidicsConfig;
use rust_fluidics::error::FluidicsError;
use rust_fluidics::logging::{self, OutputFormat, TracingConfig};
use rust_fluidics::mixing::{MixScheduler, MixTask};
use rust_fluidics::records::JsonLinesSink;
use rust_fluidics::rig::{self, Backend, BenchRouter};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rust_fluidics")]
#[command(about = "Move measured reagent volumes between stations", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/fluidics.toml")]
    config: PathBuf,

    /// Run against firmware simulators instead of serial ports
    #[arg(long, global = true)]
    simulate: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    /// Log span open and close events
    #[arg(long, global = true)]
    log_spans: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the configured stations
    Ports,

    /// Move a volume from one station to another
    Transfer {
        /// Source station
        source: String,
        /// Destination station
        dest: String,
        /// Volume to move
        volume: f64,
    },

    /// Deliver a reagent to the cell, chasing each chunk with air
    Dispense {
        /// Reagent station
        reagent: String,
        /// Volume to deliver
        volume: f64,
    },

    /// Purge the cell with flush solvent
    Clean {
        /// Rinse volume
        #[arg(default_value_t = 0.0)]
        volume: f64,
    },

    /// Fill a reagent line without leaving reagent in the cell
    Prime {
        /// Reagent station
        reagent: String,
        /// Priming volume
        volume: f64,
    },

    /// Interleave several reagents into the cell
    Mix {
        /// Deliveries as NAME=VOLUME
        #[arg(required = true, value_parser = parse_delivery)]
        deliveries: Vec<(String, f64)>,
        /// Largest slice of one reagent per round
        #[arg(long)]
        increment: Option<f64>,
        /// Rehearse one round and clean before the real run
        #[arg(long)]
        prime: bool,
    },

    /// Point the valve at waste and home the pump
    Reset,

    /// Fill a reagent line and push it through with air
    InitLine {
        /// Reagent station
        reagent: String,
    },
}

fn parse_delivery(text: &str) -> Result<(String, f64), String> {
    let (name, volume) = text
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VOLUME, got '{text}'"))?;
    let volume = volume
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("bad volume in '{text}': {e}"))?;
    Ok((name.trim().to_string(), volume))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = FluidicsConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let tracing_config = TracingConfig::from_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(cli.log_format)
        .with_span_events(cli.log_spans);
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    if let Commands::Ports = cli.command {
        let table = config.port_table().context("loading port table")?;
        for (name, station) in table.iter() {
            match station.concentration {
                Some(conc) => println!("{name:<12} {:>3}  {conc}", station.port),
                None => println!("{name:<12} {:>3}", station.port),
            }
        }
        return Ok(());
    }

    let backend = if cli.simulate {
        Backend::Simulated
    } else {
        Backend::Serial
    };
    let router = rig::build_router(&config, backend).context("assembling the bench")?;
    let mut router = router.with_sink(Box::new(JsonLinesSink::new(std::io::stdout())));

    if let Err(err) = run(&mut router, cli.command) {
        if is_retryable(&err) {
            warn!("Device or link failure; run `reset` and retry");
        }
        return Err(err);
    }
    info!(application = %config.application.name, "Done");
    Ok(())
}

fn run(router: &mut BenchRouter, command: Commands) -> Result<()> {
    match command {
        Commands::Ports => {}
        Commands::Transfer {
            source,
            dest,
            volume,
        } => {
            router
                .transfer(&source, &dest, volume)
                .with_context(|| format!("transferring {volume} from {source} to {dest}"))?;
        }
        Commands::Dispense { reagent, volume } => {
            router
                .dispense(&reagent, volume)
                .with_context(|| format!("dispensing {volume} of {reagent}"))?;
        }
        Commands::Clean { volume } => {
            router.clean(volume).context("cleaning the cell")?;
        }
        Commands::Prime { reagent, volume } => {
            router
                .prime(&reagent, volume)
                .with_context(|| format!("priming {reagent}"))?;
        }
        Commands::Mix {
            deliveries,
            increment,
            prime,
        } => {
            let mut scheduler = MixScheduler::new();
            for (reagent, volume) in deliveries {
                let mut task = MixTask::new(reagent, volume)?;
                if let Some(step) = increment {
                    task = task.with_increment(step)?;
                }
                scheduler.submit(task);
            }
            if prime {
                scheduler.prime_round(router).context("priming mix lines")?;
            }
            scheduler.run_to_completion(router).context("mixing")?;
        }
        Commands::Reset => {
            router.reset_to_waste().context("resetting to waste")?;
        }
        Commands::InitLine { reagent } => {
            router
                .init_line(&reagent)
                .with_context(|| format!("initialising line {reagent}"))?;
        }
    }
    Ok(())
}

/// A channel or device-side failure somewhere in the chain, as opposed to a bad request.
fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<FluidicsError>())
        .any(FluidicsError::can_recover)
}
