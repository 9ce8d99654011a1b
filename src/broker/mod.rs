pub mod robinhood;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};

use crate::data::OptionType;

// ── Errors ──────────────────────────────────────────────────────────

/// Transport-level failures from the brokerage API.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("not authenticated (HTTP {0}); run `optchain setup-auth`")]
    Unauthorized(u16),
    #[error("symbol '{0}' not found")]
    NotFound(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl BrokerError {
    /// Worth retrying: network errors, rate limits, server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            BrokerError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

// ── Domain types ────────────────────────────────────────────────────

/// An underlying's option chain: its id and the expiration dates on offer.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionChain {
    pub id: String,
    pub symbol: String,
    pub expiration_dates: Vec<NaiveDate>,
}

/// A tradable option contract (no market data).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OptionInstrument {
    pub id: String,
    pub expiration_date: NaiveDate,
    pub strike_price: String,
    #[serde(rename = "type")]
    pub option_type: OptionType,
}

/// Quote, volume and Greeks for one contract. The API sends decimals as
/// strings and uses null for anything it does not know.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OptionMarketData {
    #[serde(default)]
    pub instrument_id: String,
    #[serde(default, deserialize_with = "decimal")]
    pub bid_price: Option<f64>,
    #[serde(default, deserialize_with = "decimal")]
    pub ask_price: Option<f64>,
    #[serde(default, deserialize_with = "decimal")]
    pub mark_price: Option<f64>,
    #[serde(default, deserialize_with = "decimal")]
    pub last_trade_price: Option<f64>,
    #[serde(default, deserialize_with = "count")]
    pub volume: Option<u64>,
    #[serde(default, deserialize_with = "count")]
    pub open_interest: Option<u64>,
    #[serde(default, deserialize_with = "decimal")]
    pub implied_volatility: Option<f64>,
    #[serde(default, deserialize_with = "decimal")]
    pub delta: Option<f64>,
    #[serde(default, deserialize_with = "decimal")]
    pub gamma: Option<f64>,
    #[serde(default, deserialize_with = "decimal")]
    pub theta: Option<f64>,
    #[serde(default, deserialize_with = "decimal")]
    pub vega: Option<f64>,
    #[serde(default, deserialize_with = "decimal")]
    pub rho: Option<f64>,
    #[serde(default, deserialize_with = "decimal")]
    pub high_price: Option<f64>,
    #[serde(default, deserialize_with = "decimal")]
    pub low_price: Option<f64>,
    #[serde(default, deserialize_with = "decimal")]
    pub previous_close_price: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Num(f64),
    Str(String),
}

fn decimal<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(match Option::<NumOrStr>::deserialize(d)? {
        Some(NumOrStr::Num(n)) => Some(n),
        Some(NumOrStr::Str(s)) => s.trim().parse().ok(),
        None => None,
    })
}

fn count<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    Ok(decimal(d)?.filter(|n| *n >= 0.0).map(|n| n as u64))
}

// ── Source trait ────────────────────────────────────────────────────

/// Where option chains come from. The Robinhood client implements this;
/// tests substitute an in-memory source.
#[async_trait]
pub trait OptionsSource: Send + Sync {
    /// Resolve the chain (and its expiration dates) for an upper-case symbol.
    async fn chain(&self, symbol: &str) -> Result<OptionChain>;

    /// All active contracts, calls and puts, for one expiration.
    async fn option_instruments(
        &self,
        chain: &OptionChain,
        expiration: NaiveDate,
    ) -> Result<Vec<OptionInstrument>>;

    /// Market data for a batch of contract ids. Ids the API does not know are
    /// simply absent from the result.
    async fn market_data(&self, ids: &[String]) -> Result<Vec<OptionMarketData>>;
}
