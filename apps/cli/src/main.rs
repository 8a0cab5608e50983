//! CaseBrief CLI: staged legal case analysis.
//!
//! Runs a case through the analysis stages one at a time (or all in order),
//! persisting each stage's result under the case.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
