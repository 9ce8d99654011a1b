use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Download full option chains from Robinhood into CSV, and analyze them.
#[derive(Parser)]
#[command(name = "optchain", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Download every expiration of a symbol's option chain to CSV
    Download {
        /// Stock ticker symbol (e.g. NVDA, TSLA, AAPL)
        symbol: String,

        /// Output CSV file (default: SYMBOL_options_chain_TIMESTAMP.csv)
        #[arg(long, short = 'o', visible_alias = "csv")]
        output: Option<PathBuf>,

        /// Resume an interrupted download, skipping expirations already in the file
        #[arg(long = "continue", visible_alias = "resume", requires = "output")]
        resume: bool,

        /// Pause between expirations, in milliseconds
        #[arg(long, default_value = "500")]
        delay_ms: u64,

        /// Abort on the first expiration that fails instead of skipping it
        #[arg(long)]
        fail_fast: bool,

        /// Token cache file (default: $ROBINHOOD_TOKEN_FILE or ~/.tokens/robinhood.json)
        #[arg(long)]
        token_file: Option<PathBuf>,
    },

    /// Log in interactively (with 2FA) and cache the device token
    SetupAuth {
        /// Token cache file (default: $ROBINHOOD_TOKEN_FILE or ~/.tokens/robinhood.json)
        #[arg(long)]
        token_file: Option<PathBuf>,
    },

    /// Compute put/call ratios, max pain and unusual activity for a chain CSV
    Analyze {
        /// Chain CSV produced by `download`
        csv_file: PathBuf,

        /// JSON report path (default: <csv stem>_analysis.json)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
}
