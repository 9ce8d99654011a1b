#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::NaiveDate;

use optchain::broker::{BrokerError, OptionChain, OptionInstrument, OptionMarketData, OptionsSource};
use optchain::data::OptionType;
use optchain::download::DownloadConfig;

// ── In-memory broker ─────────────────────────────────────────────────

/// Serves a fixed option chain from memory and records what was asked of it.
pub struct FakeBroker {
    pub symbol: String,
    expirations: BTreeMap<NaiveDate, Vec<OptionInstrument>>,
    quotes: BTreeMap<String, OptionMarketData>,
    failing: Mutex<HashSet<NaiveDate>>,
    interrupt_on: Option<(NaiveDate, Arc<AtomicBool>)>,
    pub instrument_calls: Mutex<Vec<NaiveDate>>,
    pub market_data_calls: Mutex<Vec<usize>>,
    pub chain_calls: AtomicUsize,
}

impl FakeBroker {
    pub fn new(symbol: &str) -> Self {
        FakeBroker {
            symbol: symbol.to_string(),
            expirations: BTreeMap::new(),
            quotes: BTreeMap::new(),
            failing: Mutex::new(HashSet::new()),
            interrupt_on: None,
            instrument_calls: Mutex::new(Vec::new()),
            market_data_calls: Mutex::new(Vec::new()),
            chain_calls: AtomicUsize::new(0),
        }
    }

    /// Add an expiration with `contracts` contracts, alternating put/call
    /// with strikes descending so the fetcher has to sort them.
    pub fn with_expiration(mut self, date: &str, contracts: usize) -> Self {
        let date = d(date);
        let mut instruments = Vec::with_capacity(contracts);
        for i in 0..contracts {
            let id = format!("{date}-{i}");
            let option_type = if i % 2 == 0 { OptionType::Put } else { OptionType::Call };
            instruments.push(OptionInstrument {
                id: id.clone(),
                expiration_date: date,
                strike_price: format!("{:.4}", 200.0 - (i / 2) as f64 * 5.0),
                option_type,
            });
            self.quotes.insert(
                id.clone(),
                OptionMarketData {
                    instrument_id: id,
                    bid_price: Some(1.0),
                    ask_price: Some(1.2),
                    mark_price: Some(1.1),
                    volume: Some(i as u64),
                    open_interest: Some(100),
                    ..Default::default()
                },
            );
        }
        self.expirations.insert(date, instruments);
        self
    }

    /// Drop market data for one contract so the fetcher has to skip it.
    pub fn without_quote(mut self, id: &str) -> Self {
        self.quotes.remove(id);
        self
    }

    /// Make `option_instruments` fail for `date` until [`FakeBroker::heal`].
    pub fn failing_on(self, date: &str) -> Self {
        self.fail(date);
        self
    }

    pub fn fail(&self, date: &str) {
        self.failing.lock().unwrap().insert(d(date));
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Raise `flag` while `date` is being fetched, like a Ctrl-C arriving
    /// mid-expiration.
    pub fn interrupt_during(mut self, date: &str, flag: Arc<AtomicBool>) -> Self {
        self.interrupt_on = Some((d(date), flag));
        self
    }

    pub fn fetched_dates(&self) -> Vec<NaiveDate> {
        self.instrument_calls.lock().unwrap().clone()
    }

    pub fn market_data_batches(&self) -> Vec<usize> {
        self.market_data_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OptionsSource for FakeBroker {
    async fn chain(&self, symbol: &str) -> Result<OptionChain> {
        self.chain_calls.fetch_add(1, Ordering::SeqCst);
        if symbol != self.symbol {
            return Err(BrokerError::NotFound(symbol.to_string()).into());
        }
        Ok(OptionChain {
            id: format!("chain-{}", self.symbol),
            symbol: self.symbol.clone(),
            expiration_dates: self.expirations.keys().copied().collect(),
        })
    }

    async fn option_instruments(
        &self,
        _chain: &OptionChain,
        expiration: NaiveDate,
    ) -> Result<Vec<OptionInstrument>> {
        self.instrument_calls.lock().unwrap().push(expiration);
        if let Some((date, flag)) = &self.interrupt_on {
            if *date == expiration {
                flag.store(true, Ordering::SeqCst);
            }
        }
        if self.failing.lock().unwrap().contains(&expiration) {
            bail!("simulated outage for {expiration}");
        }
        Ok(self.expirations.get(&expiration).cloned().unwrap_or_default())
    }

    async fn market_data(&self, ids: &[String]) -> Result<Vec<OptionMarketData>> {
        self.market_data_calls.lock().unwrap().push(ids.len());
        Ok(ids.iter().filter_map(|id| self.quotes.get(id).cloned()).collect())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

pub fn d(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

pub fn config(symbol: &str, output: &Path, resume: bool) -> DownloadConfig {
    DownloadConfig {
        symbol: symbol.to_string(),
        output: Some(output.to_path_buf()),
        resume,
        delay: Duration::ZERO,
        fail_fast: false,
        token_file: None,
    }
}

/// Raw CSV records (header excluded) as string vectors.
pub fn records(path: &Path) -> Vec<Vec<String>> {
    let mut rdr = csv::Reader::from_path(path).unwrap();
    rdr.records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect()
}
