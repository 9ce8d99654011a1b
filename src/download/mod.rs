pub mod chain;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use tokio_stream::StreamExt;

use crate::auth::token::TokenStore;
use crate::auth::{self, AuthMode, StdinPrompt};
use crate::broker::OptionsSource;
use crate::broker::robinhood::RobinhoodClient;
use crate::config::{self, Credentials};
use crate::data::ChainSummary;
use crate::data::writer::{ChainWriter, completed_expirations, repair_torn_tail};

use chain::ChainFetcher;

/// CLI-facing config for the `download` command.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub symbol: String,
    pub output: Option<PathBuf>,
    pub resume: bool,
    pub delay: Duration,
    pub fail_fast: bool,
    pub token_file: Option<PathBuf>,
}

/// What a download run did.
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub symbol: String,
    pub output: PathBuf,
    pub expirations: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub empty: usize,
    pub failed: Vec<NaiveDate>,
    /// Expiration cut from a torn file tail before resuming.
    pub repaired: Option<NaiveDate>,
    pub rows_written: usize,
    pub interrupted: bool,
}

struct OutputPlan {
    path: PathBuf,
    append: bool,
    completed: BTreeSet<NaiveDate>,
    repaired: Option<NaiveDate>,
}

/// Entry point for the `download` command.
pub fn run(config: &DownloadConfig) -> Result<()> {
    let symbol = normalize_symbol(&config.symbol)?;
    // Refuse to clobber an existing file before logging in, and pin the
    // timestamped default name for the rest of the run.
    let plan = plan_output(config, &symbol)?;

    let interrupt = Arc::new(AtomicBool::new(false));
    install_interrupt_handler(interrupt.clone())?;

    let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    let report = rt.block_on(async {
        let mut client = RobinhoodClient::new(&config::api_base_url())?;
        let store = TokenStore::new(config::resolve_token_path(config.token_file.clone()));
        let creds = Credentials::from_env_opt();

        println!("Logging in to Robinhood...");
        let outcome = auth::authenticate(
            &mut client,
            &store,
            creds.as_ref(),
            &StdinPrompt,
            AuthMode::Cached,
        )
        .await
        .context("login failed (run `optchain setup-auth` first)")?;
        tracing::debug!(?outcome, "authenticated");
        println!("Login successful");

        download_planned(&client, config, &symbol, plan, &interrupt).await
    })?;

    print_summary(&report, config)?;

    if report.interrupted {
        bail!(
            "download interrupted; resume with: optchain download {} --continue --output {}",
            report.symbol,
            report.output.display()
        );
    }
    Ok(())
}

/// Fetch every expiration of `config.symbol` from `source` into the output CSV,
/// one expiration at a time. `interrupt` is checked between expirations.
pub async fn download<S: OptionsSource + ?Sized>(
    source: &S,
    config: &DownloadConfig,
    interrupt: &AtomicBool,
) -> Result<DownloadReport> {
    let symbol = normalize_symbol(&config.symbol)?;
    let plan = plan_output(config, &symbol)?;
    download_planned(source, config, &symbol, plan, interrupt).await
}

async fn download_planned<S: OptionsSource + ?Sized>(
    source: &S,
    config: &DownloadConfig,
    symbol: &str,
    plan: OutputPlan,
    interrupt: &AtomicBool,
) -> Result<DownloadReport> {
    println!("\nDownloading options chain for {symbol}");
    println!("{}", "=".repeat(60));

    let fetcher = ChainFetcher::new(source, config.delay);
    println!("Fetching available expiration dates...");
    let chain = fetcher.chain(symbol).await?;
    let dates = chain.expiration_dates.clone();

    match (dates.first(), dates.last()) {
        (Some(first), Some(last)) => {
            println!("Found {} expiration dates", dates.len());
            println!("  Range: {first} to {last}");
        }
        _ => println!("No expiration dates found for {symbol}"),
    }
    println!();

    let mut writer = if plan.append {
        ChainWriter::append(&plan.path)?
    } else {
        ChainWriter::create(&plan.path)?
    };

    if let Some(date) = plan.repaired {
        println!("Discarded partially written expiration {date}; it will be fetched again");
    }
    if !plan.completed.is_empty() {
        let remaining = dates.iter().filter(|d| !plan.completed.contains(d)).count();
        println!("Resuming {}", plan.path.display());
        println!("  Already completed: {} expiration dates", plan.completed.len());
        println!("  Remaining: {remaining} expiration dates");
        println!();
    }
    println!("Output file: {}", plan.path.display());
    println!();

    let mut report = DownloadReport {
        symbol: symbol.to_string(),
        output: plan.path.clone(),
        expirations: dates.len(),
        repaired: plan.repaired,
        ..Default::default()
    };

    let total = dates.len();
    let position: HashMap<NaiveDate, usize> =
        dates.iter().enumerate().map(|(i, d)| (*d, i + 1)).collect();

    let mut pending = Vec::with_capacity(total);
    for date in &dates {
        if plan.completed.contains(date) {
            report.skipped += 1;
            println!("[{}/{total}] {date} (already downloaded)", position[date]);
        } else {
            pending.push(*date);
        }
    }

    let mut batches = std::pin::pin!(fetcher.batches(&chain, pending));
    loop {
        if interrupt.load(Ordering::SeqCst) {
            report.interrupted = true;
            break;
        }
        let Some(batch) = batches.next().await else {
            break;
        };
        let idx = position.get(&batch.date).copied().unwrap_or(0);

        match batch.rows {
            Ok(rows) if rows.is_empty() => {
                report.empty += 1;
                println!("[{idx}/{total}] Fetching {}... (no data)", batch.date);
            }
            Ok(rows) => {
                let count = writer
                    .write_batch(&rows)
                    .with_context(|| format!("writing {} rows", batch.date))?;
                report.fetched += 1;
                report.rows_written += count;
                println!(
                    "[{idx}/{total}] Fetching {}... ✓ {count} options (Session total: {})",
                    batch.date, report.rows_written
                );
            }
            Err(e) if config.fail_fast => {
                return Err(e.context(format!("fetching expiration {}", batch.date)));
            }
            Err(e) => {
                tracing::warn!(date = %batch.date, "expiration failed: {e:#}");
                println!(
                    "[{idx}/{total}] Fetching {}... failed: {e:#} (will retry on --continue)",
                    batch.date
                );
                report.failed.push(batch.date);
            }
        }
    }

    Ok(report)
}

fn normalize_symbol(symbol: &str) -> Result<String> {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() {
        bail!("symbol must not be empty");
    }
    Ok(symbol)
}

fn default_output(symbol: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    PathBuf::from(format!("{symbol}_options_chain_{stamp}.csv"))
}

fn plan_output(config: &DownloadConfig, symbol: &str) -> Result<OutputPlan> {
    let path = config
        .output
        .clone()
        .unwrap_or_else(|| default_output(symbol));

    if !path.exists() {
        return Ok(OutputPlan {
            path,
            append: false,
            completed: BTreeSet::new(),
            repaired: None,
        });
    }
    if !config.resume {
        bail!(
            "{} already exists; use --continue to resume it or pick a different --output",
            path.display()
        );
    }
    // An interrupted batch write leaves a torn last line; cut it (and the
    // rest of its expiration) before scanning or appending.
    let repaired = repair_torn_tail(&path)?;
    let completed = completed_expirations(&path)?;
    Ok(OutputPlan {
        path,
        append: true,
        completed,
        repaired,
    })
}

fn install_interrupt_handler(flag: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\nInterrupted: finishing the current expiration (Ctrl-C again to abort)");
    })
    .context("installing Ctrl-C handler")
}

fn print_summary(report: &DownloadReport, config: &DownloadConfig) -> Result<()> {
    println!();
    println!("{}", "=".repeat(60));

    let summary = summarize(&report.output)?;
    println!("Download {}", if report.interrupted { "stopped" } else { "complete" });
    println!("File: {}", report.output.display());
    println!("Total options in file: {}", summary.total);
    println!("  Calls: {}", summary.calls);
    println!("  Puts: {}", summary.puts);
    if let Some((lo, hi)) = summary.date_range {
        println!("  Date range: {lo} to {hi}");
    }
    if let Some((lo, hi)) = summary.strike_range {
        println!("  Strike range: ${lo:.2} to ${hi:.2}");
    }

    if config.resume {
        println!("\nSession stats:");
        println!("  Fetched this session: {} expiration dates", report.fetched);
        println!("  Skipped (already had): {} expiration dates", report.skipped);
        println!("  New options added: {}", report.rows_written);
    }

    if !report.failed.is_empty() {
        let dates: Vec<String> = report.failed.iter().map(|d| d.to_string()).collect();
        println!("\n{} expirations failed: {}", dates.len(), dates.join(", "));
        println!(
            "Retry them with: optchain download {} --continue --output {}",
            report.symbol,
            report.output.display()
        );
    }
    Ok(())
}

fn summarize(path: &Path) -> Result<ChainSummary> {
    ChainSummary::from_csv(path).with_context(|| format!("summarizing {}", path.display()))
}
