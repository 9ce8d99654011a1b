use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tokio_stream::Stream;

use crate::broker::{OptionChain, OptionInstrument, OptionMarketData, OptionsSource};
use crate::data::{OptionContractRow, sort_batch};

/// Contract ids per market-data request.
pub const MARKET_DATA_BATCH: usize = 40;

/// One expiration's worth of rows, or why it could not be fetched.
pub struct ExpirationBatch {
    pub date: NaiveDate,
    pub rows: Result<Vec<OptionContractRow>>,
}

/// Walks an option chain one expiration at a time.
pub struct ChainFetcher<'a, S: OptionsSource + ?Sized> {
    source: &'a S,
    delay: Duration,
}

impl<'a, S: OptionsSource + ?Sized> ChainFetcher<'a, S> {
    pub fn new(source: &'a S, delay: Duration) -> Self {
        ChainFetcher { source, delay }
    }

    pub async fn chain(&self, symbol: &str) -> Result<OptionChain> {
        self.source
            .chain(symbol)
            .await
            .with_context(|| format!("getting expiration dates for {symbol}"))
    }

    /// Every contract expiring on `date`, with market data, sorted calls-first
    /// by strike. Contracts without market data are left out.
    pub async fn fetch_expiration(
        &self,
        chain: &OptionChain,
        date: NaiveDate,
    ) -> Result<Vec<OptionContractRow>> {
        let instruments = self.source.option_instruments(chain, date).await?;
        if instruments.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = instruments.iter().map(|i| i.id.clone()).collect();
        let mut quotes: HashMap<String, OptionMarketData> = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(MARKET_DATA_BATCH) {
            for md in self.source.market_data(chunk).await? {
                quotes.insert(md.instrument_id.clone(), md);
            }
        }

        let mut rows = Vec::with_capacity(instruments.len());
        for inst in &instruments {
            let Some(md) = quotes.get(&inst.id) else {
                tracing::debug!(id = %inst.id, "no market data; skipping contract");
                continue;
            };
            match to_row(&chain.symbol, date, inst, md) {
                Some(row) => rows.push(row),
                None => tracing::warn!(
                    id = %inst.id,
                    strike = %inst.strike_price,
                    "unparseable strike; skipping contract"
                ),
            }
        }
        sort_batch(&mut rows);
        Ok(rows)
    }

    /// Lazily fetch `dates` in order, pausing between expirations.
    pub fn batches<'s>(
        &'s self,
        chain: &'s OptionChain,
        dates: Vec<NaiveDate>,
    ) -> impl Stream<Item = ExpirationBatch> + 's {
        async_stream::stream! {
            for (i, date) in dates.into_iter().enumerate() {
                if i > 0 && !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                let rows = self.fetch_expiration(chain, date).await;
                yield ExpirationBatch { date, rows };
            }
        }
    }
}

fn to_row(
    symbol: &str,
    expiration: NaiveDate,
    inst: &OptionInstrument,
    md: &OptionMarketData,
) -> Option<OptionContractRow> {
    let strike_price: f64 = inst.strike_price.trim().parse().ok()?;
    Some(OptionContractRow {
        symbol: symbol.to_string(),
        expiration_date: expiration,
        strike_price,
        option_type: inst.option_type,
        bid_price: md.bid_price,
        ask_price: md.ask_price,
        mark_price: md.mark_price,
        last_trade_price: md.last_trade_price,
        volume: md.volume.unwrap_or(0),
        open_interest: md.open_interest.unwrap_or(0),
        implied_volatility: md.implied_volatility,
        delta: md.delta,
        gamma: md.gamma,
        theta: md.theta,
        vega: md.vega,
        rho: md.rho,
        high_price: md.high_price,
        low_price: md.low_price,
        previous_close: md.previous_close_price,
    })
}
