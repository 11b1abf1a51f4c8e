mod cli;
mod config;
mod ingest;
mod launcher;
mod metrics;
mod model;
mod orchestrator;
mod packet;
mod series;
mod shutdown;
mod storage;
mod text_summary;
#[cfg(feature = "tui")]
mod tui;

use clap::Parser;

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();

    // Exit explicitly so the viewer's (or a signal's) status becomes ours.
    let code = cli::exit_code(cli::run(args).await, &mut std::io::stderr());
    std::process::exit(code);
}
