use std::collections::VecDeque;

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::events::{Timestamp, TradeTick};
use crate::types::Price;

/// Completed bucket volumes kept per interval
const VOLUME_HISTORY: usize = 15;

/// VWAP of the current wall-clock bucket of one interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntervalVwap {
    pub interval_secs: u64,
    pub vwap: Option<Price>,
}

#[derive(Debug, Clone)]
struct IntervalFlow {
    interval_ms: u64,
    bucket_start: Option<Timestamp>,
    notional: Decimal,
    volume: Decimal,
    ticks: u64,
    completed: VecDeque<Decimal>,
}

impl IntervalFlow {
    fn new(interval_secs: u64) -> Self {
        Self {
            interval_ms: interval_secs.max(1) * 1_000,
            bucket_start: None,
            notional: Decimal::ZERO,
            volume: Decimal::ZERO,
            ticks: 0,
            completed: VecDeque::with_capacity(VOLUME_HISTORY),
        }
    }

    /// Roll to the bucket containing `ts`, recording idle buckets as zero volume
    fn roll(&mut self, ts: Timestamp) {
        let bucket = ts - ts % self.interval_ms;
        match self.bucket_start {
            Some(start) if bucket > start => {
                let skipped = ((bucket - start) / self.interval_ms).min(VOLUME_HISTORY as u64);
                self.push_completed(self.volume);
                for _ in 1..skipped {
                    self.push_completed(Decimal::ZERO);
                }
                self.notional = Decimal::ZERO;
                self.volume = Decimal::ZERO;
                self.ticks = 0;
                self.bucket_start = Some(bucket);
            }
            Some(_) => {}
            None => self.bucket_start = Some(bucket),
        }
    }

    fn push_completed(&mut self, volume: Decimal) {
        if self.completed.len() == VOLUME_HISTORY {
            self.completed.pop_front();
        }
        self.completed.push_back(volume);
    }

    fn add(&mut self, tick: &TradeTick) {
        self.notional += tick.price.value() * tick.size.value();
        self.volume += tick.size.value();
        self.ticks += 1;
    }

    fn vwap(&self) -> Option<Price> {
        if self.volume.is_zero() {
            return None;
        }
        Some(Price::new(self.notional / self.volume))
    }

    fn mean_trade_size(&self) -> Option<Decimal> {
        (self.ticks > 0).then(|| self.volume / Decimal::from(self.ticks))
    }
}

/// Trade-driven flow metrics: per-interval VWAP, cumulative OBV, intensity
/// over the last ticks, and large-trade / volume-spike flags.
#[derive(Debug, Clone)]
pub struct TradeFlow {
    intervals: Vec<IntervalFlow>,
    obv: Decimal,
    recent: VecDeque<TradeTick>,
    capacity: usize,
    intensity_window: usize,
    large_trade_size: Decimal,
    spike_multiple: Decimal,
    large_trade: bool,
    volume_spike: bool,
}

impl TradeFlow {
    pub fn new(
        interval_secs: &[u64],
        capacity: usize,
        intensity_window: usize,
        large_trade_size: f64,
        spike_multiple: f64,
    ) -> Self {
        let mut sorted = interval_secs.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        Self {
            intervals: sorted.into_iter().map(IntervalFlow::new).collect(),
            obv: Decimal::ZERO,
            recent: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            intensity_window: intensity_window.max(1),
            large_trade_size: Decimal::from_f64(large_trade_size).unwrap_or(Decimal::MAX),
            spike_multiple: Decimal::from_f64(spike_multiple).unwrap_or(Decimal::TWO),
            large_trade: false,
            volume_spike: false,
        }
    }

    pub fn update(&mut self, tick: &TradeTick) {
        for interval in &mut self.intervals {
            interval.roll(tick.timestamp);
        }

        let size = tick.size.value();
        self.volume_spike = self
            .intervals
            .first()
            .and_then(IntervalFlow::mean_trade_size)
            .map_or(false, |mean| size > mean * self.spike_multiple);
        self.large_trade = size >= self.large_trade_size;

        for interval in &mut self.intervals {
            interval.add(tick);
        }

        if tick.is_buyer_aggressor() {
            self.obv += size;
        } else {
            self.obv -= size;
        }

        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(tick.clone());
    }

    pub fn vwap(&self, interval_secs: u64) -> Option<Price> {
        self.intervals
            .iter()
            .find(|i| i.interval_ms == interval_secs * 1_000)
            .and_then(IntervalFlow::vwap)
    }

    pub fn vwaps(&self) -> Vec<IntervalVwap> {
        self.intervals
            .iter()
            .map(|i| IntervalVwap {
                interval_secs: i.interval_ms / 1_000,
                vwap: i.vwap(),
            })
            .collect()
    }

    /// On-balance volume, cumulative since the pipeline started
    pub fn obv(&self) -> Decimal {
        self.obv
    }

    /// `(buy - sell) / (buy + sell)` over the last ticks of the intensity window
    pub fn intensity(&self) -> Option<f64> {
        let (buy, sell) = self
            .recent
            .iter()
            .rev()
            .take(self.intensity_window)
            .fold((Decimal::ZERO, Decimal::ZERO), |(buy, sell), t| {
                if t.is_buyer_aggressor() {
                    (buy + t.size.value(), sell)
                } else {
                    (buy, sell + t.size.value())
                }
            });
        let total = buy + sell;
        if total.is_zero() {
            return None;
        }
        ((buy - sell) / total).to_f64()
    }

    /// Ticks per second in the current bucket of the shortest interval
    pub fn tick_rate(&self) -> f64 {
        self.intervals.first().map_or(0.0, |i| {
            i.ticks as f64 / (i.interval_ms as f64 / 1_000.0)
        })
    }

    /// Volume of the last completed bucket of the shortest interval
    pub fn recent_volume(&self) -> Option<Decimal> {
        self.intervals.first()?.completed.back().copied()
    }

    /// Mean volume of the completed buckets of the shortest interval
    pub fn reference_volume(&self) -> Option<Decimal> {
        let completed = &self.intervals.first()?.completed;
        if completed.is_empty() {
            return None;
        }
        let total: Decimal = completed.iter().sum();
        Some(total / Decimal::from(completed.len()))
    }

    pub fn is_large_trade(&self) -> bool {
        self.large_trade
    }

    pub fn is_volume_spike(&self) -> bool {
        self.volume_spike
    }

    pub fn last_price(&self) -> Option<Price> {
        self.recent.back().map(|t| t.price)
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}
