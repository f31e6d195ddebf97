use blt::analysis::AnalyzeExperiment;
use clap::{Parser, Subcommand};
use log::error;

#[derive(Parser)]
#[command(name = "blt", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze the sequencing reads from a Barcoded Library of Targets
    /// experiment, producing per-UMI, per-target, and per-sample cut-rate
    /// tables and a per-sample specificity score.
    AnalyzeExperiment(AnalyzeExperiment),
}

fn main() {
    let cli = Cli::parse();
    let result = match &cli.command {
        Commands::AnalyzeExperiment(x) => x.run(),
    };
    if let Err(e) = result {
        error!("{e:#}");
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}
