mod cli;
mod engine;
mod model;
mod orchestrator;
mod storage;
#[cfg(feature = "tui")]
mod tui;
mod units;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let one_shot = args.json || args.text;

    match cli::run(args).await {
        Ok(()) => {
            // Explicit zero for one-shot modes so wrappers see a clean exit.
            if one_shot {
                std::process::exit(0);
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}
