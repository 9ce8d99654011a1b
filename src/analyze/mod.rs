pub mod metrics;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::data::{self, OptionContractRow, OptionType};

use metrics::{ExpirationRatios, MaxPain, OverallStats, UnusualActivity};

pub struct AnalyzeConfig {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
}

/// Everything the `analyze` command computes, as written to the JSON report.
#[derive(Debug, Serialize)]
pub struct ChainReport {
    pub source: PathBuf,
    pub overall: OverallStats,
    pub put_call_ratios: Vec<ExpirationRatios>,
    pub max_pain: Vec<MaxPain>,
    pub unusual_activity: Vec<UnusualActivity>,
}

impl ChainReport {
    pub fn build(source: &Path, rows: &[OptionContractRow]) -> Self {
        ChainReport {
            source: source.to_path_buf(),
            overall: metrics::overall_stats(rows),
            put_call_ratios: metrics::put_call_ratios(rows),
            max_pain: metrics::max_pain(rows),
            unusual_activity: metrics::unusual_activity(rows),
        }
    }
}

/// Output files of one analysis run.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutputs {
    pub report: PathBuf,
    pub calls: PathBuf,
    pub puts: PathBuf,
}

/// Entry point for the `analyze` command.
pub fn run(config: &AnalyzeConfig) -> Result<AnalysisOutputs> {
    if !config.input.exists() {
        bail!("file not found: {}", config.input.display());
    }

    println!("\nAnalyzing options chain data...");
    println!("{}", "=".repeat(60));

    let rows = data::load_rows(&config.input)?;
    println!("Loaded {} options from {}", rows.len(), config.input.display());

    let outputs = output_paths(&config.input, config.output.as_deref());
    let (calls, puts): (Vec<OptionContractRow>, Vec<OptionContractRow>) = rows
        .iter()
        .cloned()
        .partition(|r| r.option_type == OptionType::Call);
    println!("  Calls: {}", calls.len());
    println!("  Puts: {}", puts.len());

    let report = ChainReport::build(&config.input, &rows);
    print_report(&report);

    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(&outputs.report, json)
        .with_context(|| format!("writing report {}", outputs.report.display()))?;
    write_csv(&outputs.calls, &calls)?;
    write_csv(&outputs.puts, &puts)?;

    println!();
    println!("{}", "=".repeat(60));
    println!("Analysis complete");
    println!("  Report: {}", outputs.report.display());
    println!("  Calls:  {} ({} options)", outputs.calls.display(), calls.len());
    println!("  Puts:   {} ({} options)", outputs.puts.display(), puts.len());

    Ok(outputs)
}

/// Report defaults to `{stem}_analysis.json` in the working directory; the
/// calls/puts splits sit next to the report.
pub fn output_paths(input: &Path, output: Option<&Path>) -> AnalysisOutputs {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "options_chain".to_string());
    let report = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(format!("{stem}_analysis.json")));
    AnalysisOutputs {
        calls: report.with_file_name(format!("{stem}_calls.csv")),
        puts: report.with_file_name(format!("{stem}_puts.csv")),
        report,
    }
}

fn write_csv(path: &Path, rows: &[OptionContractRow]) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("creating CSV file {}", path.display()))?;
    wtr.write_record(data::CSV_HEADER)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

fn print_report(report: &ChainReport) {
    let o = &report.overall;
    println!("\nOVERALL STATISTICS");
    println!("  {:<28} {}", "Total Call Options", o.total_calls);
    println!("  {:<28} {}", "Total Put Options", o.total_puts);
    println!("  {:<28} {}", "Total Call Volume", o.call_volume);
    println!("  {:<28} {}", "Total Put Volume", o.put_volume);
    println!("  {:<28} {}", "Total Call Open Interest", o.call_open_interest);
    println!("  {:<28} {}", "Total Put Open Interest", o.put_open_interest);
    println!("  {:<28} {:.2}", "Overall P/C Volume Ratio", o.put_call_volume_ratio);
    println!("  {:<28} {:.2}", "Overall P/C OI Ratio", o.put_call_oi_ratio);

    if !report.put_call_ratios.is_empty() {
        println!("\nPUT/CALL RATIOS BY EXPIRATION");
        println!(
            "  {:<12} {:>10} {:>10} {:>8} {:>10} {:>10} {:>8}",
            "EXPIRATION", "CALL VOL", "PUT VOL", "P/C VOL", "CALL OI", "PUT OI", "P/C OI"
        );
        for r in &report.put_call_ratios {
            println!(
                "  {:<12} {:>10} {:>10} {:>8.2} {:>10} {:>10} {:>8.2}",
                r.expiration_date.to_string(),
                r.call_volume,
                r.put_volume,
                r.put_call_volume_ratio,
                r.call_oi,
                r.put_oi,
                r.put_call_oi_ratio
            );
        }
    }

    if !report.max_pain.is_empty() {
        println!("\nMAX PAIN BY EXPIRATION");
        for m in &report.max_pain {
            println!("  {:<12} ${:.2}", m.expiration_date.to_string(), m.max_pain_strike);
        }
    }

    if !report.unusual_activity.is_empty() {
        println!(
            "\nUNUSUAL OPTION ACTIVITY (Top {})",
            metrics::UNUSUAL_LIMIT
        );
        println!(
            "  {:<12} {:>10} {:<5} {:>10} {:>10} {:>7}",
            "EXPIRATION", "STRIKE", "TYPE", "VOLUME", "OI", "VOL/OI"
        );
        for u in &report.unusual_activity {
            println!(
                "  {:<12} {:>10.2} {:<5} {:>10} {:>10} {:>7.2}",
                u.expiration_date.to_string(),
                u.strike_price,
                u.option_type.as_str(),
                u.volume,
                u.open_interest,
                u.volume_oi_ratio
            );
        }
    }
}
