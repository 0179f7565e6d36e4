//! Natrium CLI: topic and post generation for the Natrium Fitness channel.
//!
//! Runs the post-processing pipelines on saved generator output, or drives
//! the generator bridge end to end and renders the result in the terminal.

mod commands;
mod console;
mod lock;

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
