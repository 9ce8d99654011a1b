use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::data::{OptionContractRow, OptionType};

/// Contract multiplier used for max-pain dollar values.
const CONTRACT_SIZE: f64 = 100.0;
/// Flag contracts whose volume is at least this share of open interest.
const VOLUME_OI_FLAG: f64 = 0.5;
/// Flag contracts this many standard deviations above mean volume.
const VOLUME_SIGMA_FLAG: f64 = 2.0;
pub const UNUSUAL_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverallStats {
    pub total_calls: usize,
    pub total_puts: usize,
    pub call_volume: u64,
    pub put_volume: u64,
    pub call_open_interest: u64,
    pub put_open_interest: u64,
    pub put_call_volume_ratio: f64,
    pub put_call_oi_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpirationRatios {
    pub expiration_date: NaiveDate,
    pub call_volume: u64,
    pub put_volume: u64,
    pub put_call_volume_ratio: f64,
    pub call_oi: u64,
    pub put_oi: u64,
    pub put_call_oi_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaxPain {
    pub expiration_date: NaiveDate,
    pub max_pain_strike: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnusualActivity {
    pub expiration_date: NaiveDate,
    pub strike_price: f64,
    pub option_type: OptionType,
    pub volume: u64,
    pub open_interest: u64,
    pub volume_oi_ratio: f64,
    pub last_trade_price: Option<f64>,
    pub implied_volatility: Option<f64>,
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn ratio(puts: u64, calls: u64) -> f64 {
    if calls > 0 {
        round2(puts as f64 / calls as f64)
    } else {
        0.0
    }
}

#[derive(Default)]
struct Totals {
    calls: usize,
    puts: usize,
    call_volume: u64,
    put_volume: u64,
    call_oi: u64,
    put_oi: u64,
}

impl Totals {
    fn add(&mut self, row: &OptionContractRow) {
        match row.option_type {
            OptionType::Call => {
                self.calls += 1;
                self.call_volume += row.volume;
                self.call_oi += row.open_interest;
            }
            OptionType::Put => {
                self.puts += 1;
                self.put_volume += row.volume;
                self.put_oi += row.open_interest;
            }
        }
    }
}

pub fn overall_stats(rows: &[OptionContractRow]) -> OverallStats {
    let mut t = Totals::default();
    rows.iter().for_each(|r| t.add(r));
    OverallStats {
        total_calls: t.calls,
        total_puts: t.puts,
        call_volume: t.call_volume,
        put_volume: t.put_volume,
        call_open_interest: t.call_oi,
        put_open_interest: t.put_oi,
        put_call_volume_ratio: ratio(t.put_volume, t.call_volume),
        put_call_oi_ratio: ratio(t.put_oi, t.call_oi),
    }
}

/// Rows grouped by expiration, in date order.
fn by_expiration(rows: &[OptionContractRow]) -> BTreeMap<NaiveDate, Vec<&OptionContractRow>> {
    let mut groups: BTreeMap<NaiveDate, Vec<&OptionContractRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.expiration_date).or_default().push(row);
    }
    groups
}

pub fn put_call_ratios(rows: &[OptionContractRow]) -> Vec<ExpirationRatios> {
    by_expiration(rows)
        .into_iter()
        .map(|(date, group)| {
            let mut t = Totals::default();
            group.iter().for_each(|r| t.add(r));
            ExpirationRatios {
                expiration_date: date,
                call_volume: t.call_volume,
                put_volume: t.put_volume,
                put_call_volume_ratio: ratio(t.put_volume, t.call_volume),
                call_oi: t.call_oi,
                put_oi: t.put_oi,
                put_call_oi_ratio: ratio(t.put_oi, t.call_oi),
            }
        })
        .collect()
}

/// Strike at which the intrinsic value held by option buyers is smallest.
/// Ties go to the lowest strike.
pub fn max_pain_strike(rows: &[&OptionContractRow]) -> Option<f64> {
    let mut strikes: Vec<f64> = rows.iter().map(|r| r.strike_price).collect();
    strikes.sort_by(f64::total_cmp);
    strikes.dedup();

    let mut best: Option<(f64, f64)> = None;
    for &settle in &strikes {
        let value: f64 = rows
            .iter()
            .map(|r| {
                let oi = r.open_interest as f64;
                match r.option_type {
                    OptionType::Call if r.strike_price < settle => {
                        (settle - r.strike_price) * oi * CONTRACT_SIZE
                    }
                    OptionType::Put if r.strike_price > settle => {
                        (r.strike_price - settle) * oi * CONTRACT_SIZE
                    }
                    _ => 0.0,
                }
            })
            .sum();
        if best.is_none_or(|(_, v)| value < v) {
            best = Some((settle, value));
        }
    }
    best.map(|(strike, _)| strike)
}

pub fn max_pain(rows: &[OptionContractRow]) -> Vec<MaxPain> {
    by_expiration(rows)
        .into_iter()
        .filter_map(|(date, group)| {
            max_pain_strike(&group).map(|strike| MaxPain {
                expiration_date: date,
                max_pain_strike: strike,
            })
        })
        .collect()
}

/// Contracts with outsized volume, loudest first, capped at [`UNUSUAL_LIMIT`].
///
/// A traded contract is flagged when its volume is at least two sample
/// standard deviations above the mean traded volume, or when volume is at
/// least half of open interest.
pub fn unusual_activity(rows: &[OptionContractRow]) -> Vec<UnusualActivity> {
    let active: Vec<&OptionContractRow> = rows.iter().filter(|r| r.volume > 0).collect();
    if active.is_empty() {
        return Vec::new();
    }

    let n = active.len() as f64;
    let mean = active.iter().map(|r| r.volume as f64).sum::<f64>() / n;
    // Sample std dev is undefined for a single contract; only the OI rule applies then.
    let threshold = (active.len() > 1).then(|| {
        let var = active
            .iter()
            .map(|r| (r.volume as f64 - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0);
        mean + VOLUME_SIGMA_FLAG * var.sqrt()
    });

    let mut flagged: Vec<UnusualActivity> = active
        .into_iter()
        .filter_map(|r| {
            let vol_oi = if r.open_interest > 0 {
                r.volume as f64 / r.open_interest as f64
            } else {
                0.0
            };
            let loud = threshold.is_some_and(|t| r.volume as f64 >= t);
            (loud || vol_oi >= VOLUME_OI_FLAG).then(|| UnusualActivity {
                expiration_date: r.expiration_date,
                strike_price: r.strike_price,
                option_type: r.option_type,
                volume: r.volume,
                open_interest: r.open_interest,
                volume_oi_ratio: round2(vol_oi),
                last_trade_price: r.last_trade_price,
                implied_volatility: r.implied_volatility,
            })
        })
        .collect();

    flagged.sort_by(|a, b| b.volume.cmp(&a.volume));
    flagged.truncate(UNUSUAL_LIMIT);
    flagged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::row;

    fn contract(exp: &str, strike: f64, ty: OptionType, volume: u64, oi: u64) -> OptionContractRow {
        let mut r = row(exp, strike, ty);
        r.volume = volume;
        r.open_interest = oi;
        r
    }

    #[test]
    fn overall_ratios_round_and_guard_zero_calls() {
        let rows = vec![
            contract("2025-01-17", 100.0, OptionType::Call, 300, 900),
            contract("2025-01-17", 100.0, OptionType::Put, 100, 400),
        ];
        let s = overall_stats(&rows);
        assert_eq!(s.total_calls, 1);
        assert_eq!(s.total_puts, 1);
        assert_eq!(s.put_call_volume_ratio, 0.33);
        assert_eq!(s.put_call_oi_ratio, 0.44);

        let puts_only = vec![contract("2025-01-17", 100.0, OptionType::Put, 5, 5)];
        let s = overall_stats(&puts_only);
        assert_eq!(s.put_call_volume_ratio, 0.0);
        assert_eq!(s.put_call_oi_ratio, 0.0);
    }

    #[test]
    fn ratios_per_expiration_are_date_ordered() {
        let rows = vec![
            contract("2025-02-21", 100.0, OptionType::Call, 10, 10),
            contract("2025-01-17", 100.0, OptionType::Call, 40, 20),
            contract("2025-01-17", 90.0, OptionType::Put, 20, 30),
        ];
        let r = put_call_ratios(&rows);
        assert_eq!(r.len(), 2);
        assert_eq!(r[0].expiration_date, "2025-01-17".parse().unwrap());
        assert_eq!(r[0].put_call_volume_ratio, 0.5);
        assert_eq!(r[0].put_call_oi_ratio, 1.5);
        assert_eq!(r[1].put_volume, 0);
        assert_eq!(r[1].put_call_volume_ratio, 0.0);
    }

    #[test]
    fn max_pain_matches_hand_computation() {
        // Settle 90:  puts 100 (10*50) + 110 (20*50) -> 1500 * 100
        // Settle 100: call 90 (10*100) + put 110 (10*50) -> 1500 * 100
        // Settle 110: call 90 (20*100) + call 100 (10*200) -> 4000 * 100
        // Tie between 90 and 100 resolves to the lower strike.
        let rows = vec![
            contract("2025-01-17", 90.0, OptionType::Call, 0, 100),
            contract("2025-01-17", 100.0, OptionType::Call, 0, 200),
            contract("2025-01-17", 100.0, OptionType::Put, 0, 50),
            contract("2025-01-17", 110.0, OptionType::Put, 0, 50),
        ];
        let refs: Vec<&OptionContractRow> = rows.iter().collect();
        assert_eq!(max_pain_strike(&refs), Some(90.0));

        let skewed = vec![
            contract("2025-01-17", 90.0, OptionType::Call, 0, 10),
            contract("2025-01-17", 100.0, OptionType::Put, 0, 500),
            contract("2025-01-17", 110.0, OptionType::Put, 0, 500),
        ];
        let refs: Vec<&OptionContractRow> = skewed.iter().collect();
        assert_eq!(max_pain_strike(&refs), Some(110.0));
        assert_eq!(max_pain_strike(&[]), None);
    }

    #[test]
    fn unusual_flags_high_volume_ratio_and_outliers() {
        let mut rows: Vec<OptionContractRow> = (0..10)
            .map(|i| contract("2025-01-17", 100.0 + i as f64, OptionType::Call, 10, 1000))
            .collect();
        // Volume spike: far above mean + 2 sigma.
        rows.push(contract("2025-01-17", 150.0, OptionType::Call, 5000, 100_000));
        // Opening activity: volume is 80% of OI.
        rows.push(contract("2025-01-17", 80.0, OptionType::Put, 8, 10));
        // Untraded contracts never count.
        rows.push(contract("2025-01-17", 70.0, OptionType::Put, 0, 0));

        let flagged = unusual_activity(&rows);
        assert_eq!(flagged.len(), 2);
        assert_eq!(flagged[0].strike_price, 150.0);
        assert_eq!(flagged[0].volume_oi_ratio, 0.05);
        assert_eq!(flagged[1].strike_price, 80.0);
        assert_eq!(flagged[1].volume_oi_ratio, 0.8);
    }

    #[test]
    fn single_active_contract_uses_only_oi_rule() {
        let rows = vec![contract("2025-01-17", 100.0, OptionType::Call, 10, 1000)];
        assert!(unusual_activity(&rows).is_empty());

        let rows = vec![contract("2025-01-17", 100.0, OptionType::Call, 10, 0)];
        assert!(unusual_activity(&rows).is_empty());
    }

    #[test]
    fn unusual_is_capped() {
        let rows: Vec<OptionContractRow> = (0..80)
            .map(|i| contract("2025-01-17", i as f64, OptionType::Put, 10 + i, 10))
            .collect();
        let flagged = unusual_activity(&rows);
        assert_eq!(flagged.len(), UNUSUAL_LIMIT);
        assert_eq!(flagged[0].volume, 89);
    }
}
