use std::collections::VecDeque;

use rust_decimal::prelude::*;

use crate::core::events::{Timestamp, TradeTick};
use crate::types::Price;

/// OHLC bar built from trades over a fixed wall-clock bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bar {
    pub start: Timestamp,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl Bar {
    fn open_at(start: Timestamp, price: Decimal) -> Self {
        Self {
            start,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    fn extend(&mut self, price: Decimal) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }

    fn true_range(&self, prev_close: Option<Decimal>) -> Decimal {
        let range = self.high - self.low;
        match prev_close {
            Some(pc) => range.max((self.high - pc).abs()).max((self.low - pc).abs()),
            None => range,
        }
    }
}

/// Average True Range with Wilder smoothing plus realised volatility of bar
/// closes. Only completed bars contribute.
#[derive(Debug, Clone)]
pub struct VolatilityTracker {
    bar_ms: u64,
    period: usize,
    current: Option<Bar>,
    prev_close: Option<Decimal>,
    seed: Vec<Decimal>,
    atr: Option<Decimal>,
    closes: VecDeque<Decimal>,
    max_closes: usize,
}

impl VolatilityTracker {
    pub fn new(bar_secs: u64, period: usize, volatility_bars: usize) -> Self {
        let period = period.max(1);
        Self {
            bar_ms: bar_secs.max(1) * 1_000,
            period,
            current: None,
            prev_close: None,
            seed: Vec::with_capacity(period),
            atr: None,
            closes: VecDeque::with_capacity(volatility_bars + 1),
            max_closes: volatility_bars.max(2) + 1,
        }
    }

    pub fn update(&mut self, tick: &TradeTick) {
        let price = tick.price.value();
        let bucket = tick.timestamp - tick.timestamp % self.bar_ms;

        match self.current.as_mut() {
            Some(bar) if bucket > bar.start => {
                let finished = *bar;
                self.complete(finished);
                self.current = Some(Bar::open_at(bucket, price));
            }
            Some(bar) => bar.extend(price),
            None => self.current = Some(Bar::open_at(bucket, price)),
        }
    }

    fn complete(&mut self, bar: Bar) {
        let tr = bar.true_range(self.prev_close);
        let period = Decimal::from(self.period);
        self.atr = match self.atr {
            Some(atr) => Some((atr * (period - Decimal::ONE) + tr) / period),
            None => {
                self.seed.push(tr);
                if self.seed.len() == self.period {
                    let sum: Decimal = self.seed.drain(..).sum();
                    Some(sum / period)
                } else {
                    None
                }
            }
        };
        self.prev_close = Some(bar.close);

        if self.closes.len() == self.max_closes {
            self.closes.pop_front();
        }
        self.closes.push_back(bar.close);
    }

    pub fn atr(&self) -> Option<Price> {
        self.atr.map(Price::new)
    }

    /// Sample standard deviation of log returns between completed bar closes
    pub fn realized_volatility(&self) -> Option<f64> {
        let returns: Vec<f64> = self
            .closes
            .iter()
            .zip(self.closes.iter().skip(1))
            .filter_map(|(prev, next)| {
                let (prev, next) = (prev.to_f64()?, next.to_f64()?);
                (prev > 0.0 && next > 0.0).then(|| (next / prev).ln())
            })
            .collect();
        if returns.len() < 2 {
            return None;
        }
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        Some(variance.sqrt())
    }

    pub fn completed_bars(&self) -> usize {
        self.closes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Size;

    fn tick(price: &str, ts: u64) -> TradeTick {
        TradeTick::from_buyer_maker(
            "BTCUSDT",
            Price::parse(price).unwrap(),
            Size::parse("1").unwrap(),
            false,
            ts,
        )
    }

    fn feed_bar(tracker: &mut VolatilityTracker, minute: u64, prices: &[&str]) {
        for (i, p) in prices.iter().enumerate() {
            tracker.update(&tick(p, minute * 60_000 + i as u64 * 1_000));
        }
    }

    #[test]
    fn test_atr_seed_then_wilder_smoothing() {
        let mut tracker = VolatilityTracker::new(60, 3, 30);
        feed_bar(&mut tracker, 0, &["9", "10", "8", "9"]);
        feed_bar(&mut tracker, 1, &["10", "12", "9", "11"]);
        feed_bar(&mut tracker, 2, &["11", "10", "10.5"]);
        assert!(tracker.atr().is_none());

        // Opening bar 3 completes bar 2: TRs 2, 3, 1
        feed_bar(&mut tracker, 3, &["12", "13", "10", "12"]);
        assert_eq!(tracker.atr(), Some(Price::new(Decimal::from(2))));

        feed_bar(&mut tracker, 4, &["12"]);
        let expected = Decimal::from(7) / Decimal::from(3);
        assert_eq!(tracker.atr(), Some(Price::new(expected)));
    }

    #[test]
    fn test_realized_volatility() {
        let mut tracker = VolatilityTracker::new(60, 14, 30);
        assert!(tracker.realized_volatility().is_none());
        for (minute, price) in ["100", "101", "100", "101", "100"].iter().enumerate() {
            feed_bar(&mut tracker, minute as u64, &[price]);
        }
        // Four completed closes, three returns
        assert_eq!(tracker.completed_bars(), 4);
        let vol = tracker.realized_volatility().unwrap();
        assert!(vol > 0.005 && vol < 0.02);
    }

    #[test]
    fn test_flat_prices_have_zero_volatility() {
        let mut tracker = VolatilityTracker::new(60, 2, 30);
        for minute in 0..5 {
            feed_bar(&mut tracker, minute, &["100"]);
        }
        assert_eq!(tracker.realized_volatility(), Some(0.0));
        assert_eq!(tracker.atr(), Some(Price::new(Decimal::ZERO)));
    }
}
