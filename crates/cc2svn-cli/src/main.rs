mod cleartool;
mod cli;
mod config;
mod error;
mod telemetry;

use clap::Parser;

fn main() {
    let cli = cli::Cli::parse();
    if let Err(e) = cli::run(cli) {
        tracing::error!("error: {e}");
        eprintln!("cc2svn: {e}");
        std::process::exit(e.exit_code());
    }
}
