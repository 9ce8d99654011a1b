pub mod writer;

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Column order of the chain CSV. Must match the field order of [`OptionContractRow`].
pub const CSV_HEADER: [&str; 19] = [
    "symbol",
    "expiration_date",
    "strike_price",
    "option_type",
    "bid_price",
    "ask_price",
    "mark_price",
    "last_trade_price",
    "volume",
    "open_interest",
    "implied_volatility",
    "delta",
    "gamma",
    "theta",
    "vega",
    "rho",
    "high_price",
    "low_price",
    "previous_close",
];

/// Call or put. Serialized lowercase; calls order before puts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "call",
            OptionType::Put => "put",
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One option contract flattened into a CSV row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionContractRow {
    pub symbol: String,
    pub expiration_date: NaiveDate,
    pub strike_price: f64,
    pub option_type: OptionType,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub mark_price: Option<f64>,
    pub last_trade_price: Option<f64>,
    pub volume: u64,
    pub open_interest: u64,
    pub implied_volatility: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub rho: Option<f64>,
    pub high_price: Option<f64>,
    pub low_price: Option<f64>,
    pub previous_close: Option<f64>,
}

/// Sort a batch the way it is written: calls first, then ascending strike.
pub fn sort_batch(rows: &mut [OptionContractRow]) {
    rows.sort_by(|a, b| {
        a.option_type
            .cmp(&b.option_type)
            .then(a.strike_price.total_cmp(&b.strike_price))
    });
}

/// Load every row of a chain CSV.
pub fn load_rows(path: &Path) -> Result<Vec<OptionContractRow>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("opening CSV file {}", path.display()))?;
    let rows: Vec<OptionContractRow> = rdr
        .deserialize()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing CSV file {}", path.display()))?;
    Ok(rows)
}

/// Headline numbers for a chain file, printed after a download.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSummary {
    pub total: usize,
    pub calls: usize,
    pub puts: usize,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub strike_range: Option<(f64, f64)>,
}

impl ChainSummary {
    pub fn from_rows(rows: &[OptionContractRow]) -> Self {
        let calls = rows
            .iter()
            .filter(|r| r.option_type == OptionType::Call)
            .count();

        let date_range = rows
            .iter()
            .map(|r| r.expiration_date)
            .min()
            .zip(rows.iter().map(|r| r.expiration_date).max());

        let strike_range = if rows.is_empty() {
            None
        } else {
            let lo = rows.iter().map(|r| r.strike_price).fold(f64::INFINITY, f64::min);
            let hi = rows
                .iter()
                .map(|r| r.strike_price)
                .fold(f64::NEG_INFINITY, f64::max);
            Some((lo, hi))
        };

        ChainSummary {
            total: rows.len(),
            calls,
            puts: rows.len() - calls,
            date_range,
            strike_range,
        }
    }

    pub fn from_csv(path: &Path) -> Result<Self> {
        Ok(Self::from_rows(&load_rows(path)?))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn row(exp: &str, strike: f64, option_type: OptionType) -> OptionContractRow {
        OptionContractRow {
            symbol: "NVDA".to_string(),
            expiration_date: exp.parse().unwrap(),
            strike_price: strike,
            option_type,
            bid_price: Some(1.1),
            ask_price: Some(1.3),
            mark_price: Some(1.2),
            last_trade_price: None,
            volume: 10,
            open_interest: 100,
            implied_volatility: Some(0.45),
            delta: Some(0.5),
            gamma: None,
            theta: None,
            vega: None,
            rho: None,
            high_price: None,
            low_price: None,
            previous_close: Some(1.0),
        }
    }

    #[test]
    fn header_matches_serialized_field_order() {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.serialize(row("2025-01-17", 100.0, OptionType::Call)).unwrap();
        let out = String::from_utf8(wtr.into_inner().unwrap()).unwrap();
        let first = out.lines().next().unwrap();
        assert_eq!(first, CSV_HEADER.join(","));
    }

    #[test]
    fn missing_values_serialize_as_empty_cells() {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        wtr.serialize(row("2025-01-17", 100.0, OptionType::Put)).unwrap();
        let out = String::from_utf8(wtr.into_inner().unwrap()).unwrap();
        assert_eq!(
            out.trim_end(),
            "NVDA,2025-01-17,100.0,put,1.1,1.3,1.2,,10,100,0.45,0.5,,,,,,,1.0"
        );
    }

    #[test]
    fn sort_puts_calls_first_then_strike() {
        let mut rows = vec![
            row("2025-01-17", 110.0, OptionType::Put),
            row("2025-01-17", 120.0, OptionType::Call),
            row("2025-01-17", 90.0, OptionType::Put),
            row("2025-01-17", 100.0, OptionType::Call),
        ];
        sort_batch(&mut rows);
        let keys: Vec<(OptionType, f64)> =
            rows.iter().map(|r| (r.option_type, r.strike_price)).collect();
        assert_eq!(
            keys,
            vec![
                (OptionType::Call, 100.0),
                (OptionType::Call, 120.0),
                (OptionType::Put, 90.0),
                (OptionType::Put, 110.0),
            ]
        );
    }

    #[test]
    fn summary_counts_and_ranges() {
        let rows = vec![
            row("2025-02-21", 80.0, OptionType::Call),
            row("2025-01-17", 120.0, OptionType::Put),
            row("2025-01-17", 100.0, OptionType::Put),
        ];
        let s = ChainSummary::from_rows(&rows);
        assert_eq!(s.total, 3);
        assert_eq!(s.calls, 1);
        assert_eq!(s.puts, 2);
        assert_eq!(
            s.date_range,
            Some(("2025-01-17".parse().unwrap(), "2025-02-21".parse().unwrap()))
        );
        assert_eq!(s.strike_range, Some((80.0, 120.0)));
    }

    #[test]
    fn summary_of_empty_file_has_no_ranges() {
        let s = ChainSummary::from_rows(&[]);
        assert_eq!(s.total, 0);
        assert_eq!(s.date_range, None);
        assert_eq!(s.strike_range, None);
    }
}
