//! pubflow CLI: drive content through the publishing pipeline.
//!
//! Runs step batches against a JSON state document and exposes the
//! administrative overrides (retry, skip-to, reset, complete, fail).

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
