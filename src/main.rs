use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pagewright::cli::Cli;
use pagewright::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = EnvFilter::new(if cli.verbose { "debug" } else { "info" });
        for directive in ["tokio_tungstenite=warn", "tungstenite=warn", "hyper_util=warn"] {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    cli.run().await
}
