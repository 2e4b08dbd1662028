//! docflow CLI: run and inspect document analysis workflows.
//!
//! Submits a stored document to the analysis service, waits for the job,
//! saves every result page next to the document, and keeps a durable
//! checkpoint of each execution so it can be resumed.

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
