#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{CommandFactory, Parser, Subcommand};
use ipca::ipca::main::{RunSummary, run};
use ipca::ipca::{Partition, RunConfig};
use std::error::Error;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "ipca",
    about = "Streaming incremental PCA with a row-distributed basis",
    long_about = "Fits an exact rank-q PCA over observations streamed in column blocks, \
                 with the basis rows spread across a group of in-process workers."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a streaming fit described by a TOML file
    #[command(about = "Fit incremental PCA (outputs: basis.csv, spectrum.csv, moments.csv, timings.csv)")]
    Run {
        /// Path to the TOML run configuration
        #[arg(long, value_name = "FILE")]
        config: PathBuf,

        /// Override the number of workers from the configuration
        #[arg(long, value_name = "N")]
        workers: Option<usize>,
    },

    /// Print which feature rows each worker owns
    #[command(about = "Show the feature partition for a worker count")]
    Partition {
        /// Feature dimension d
        #[arg(long, value_name = "D")]
        features: usize,

        /// Number of workers
        #[arg(long, value_name = "N")]
        workers: usize,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Run { config, workers }) => run_fit(config, workers),
        Some(Commands::Partition { features, workers }) => show_partition(features, workers),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Box::<dyn Error>::from),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_fit(config_path: PathBuf, workers: Option<usize>) -> Result<(), Box<dyn Error>> {
    let mut config = RunConfig::load(&config_path)?;
    if let Some(workers) = workers {
        config.run.workers = workers;
    }
    let summary = run(&config)?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Fitted {} components from {} observations ({} blocks) in {:.3}s",
        summary.n_components,
        summary.n_observations,
        summary.n_blocks,
        summary.elapsed.as_secs_f64()
    );
    for (k, (s, ratio)) in summary
        .singular_values
        .iter()
        .zip(&summary.explained_variance_ratio)
        .enumerate()
    {
        println!(
            "  pc{:<3} singular value {:>14.6e}  explained {:>7.3}%",
            k + 1,
            s,
            ratio * 100.0
        );
    }
    println!("Outputs written to {}", summary.output_dir.display());
}

fn show_partition(features: usize, workers: usize) -> Result<(), Box<dyn Error>> {
    let partition = Partition::new(features, workers)?;
    print!("{partition}");
    Ok(())
}
