use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use optchain::{analyze, auth, cli, config, download};

fn main() -> anyhow::Result<()> {
    // RUST_LOG=optchain=debug for request-level detail.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();

    config::load_dotenv();
    let cli = cli::Cli::parse();

    match cli.command {
        cli::Command::Download {
            symbol,
            output,
            resume,
            delay_ms,
            fail_fast,
            token_file,
        } => download::run(&download::DownloadConfig {
            symbol,
            output,
            resume,
            delay: Duration::from_millis(delay_ms),
            fail_fast,
            token_file,
        }),
        cli::Command::SetupAuth { token_file } => auth::run(token_file),
        cli::Command::Analyze { csv_file, output } => analyze::run(&analyze::AnalyzeConfig {
            input: csv_file,
            output,
        })
        .map(|_| ()),
    }
}
