use rust_decimal::prelude::*;

use crate::core::events::OrderBookSnapshot;

/// Order book imbalance over the top `levels` of each side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBookImbalance {
    levels: usize,
}

impl OrderBookImbalance {
    pub fn new(levels: usize) -> Self {
        Self { levels }
    }

    /// `(bid - ask) / (bid + ask)` in [-1, 1]; None when both sums are zero
    pub fn calculate(&self, book: &OrderBookSnapshot) -> Option<f64> {
        if self.levels == 0 {
            return None;
        }

        let bid_volume: Decimal = book.bids.iter().take(self.levels).map(|l| l.size.value()).sum();
        let ask_volume: Decimal = book.asks.iter().take(self.levels).map(|l| l.size.value()).sum();
        let total = bid_volume + ask_volume;

        if total.is_zero() {
            return None;
        }

        ((bid_volume - ask_volume) / total)
            .to_f64()
            .map(|v| v.clamp(-1.0, 1.0))
    }

    pub fn levels(&self) -> usize {
        self.levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::OrderBookLevel;
    use crate::types::{Price, Size};

    fn book(bids: &[(&str, &str)], asks: &[(&str, &str)]) -> OrderBookSnapshot {
        let levels = |side: &[(&str, &str)]| {
            side.iter()
                .map(|(p, s)| OrderBookLevel::new(Price::parse(p).unwrap(), Size::parse(s).unwrap()))
                .collect()
        };
        OrderBookSnapshot::new("BTCUSDT", levels(bids), levels(asks), 0)
    }

    #[test]
    fn test_balanced_book_is_zero() {
        let book = book(
            &[("50000", "10"), ("49900", "5")],
            &[("50100", "10"), ("50200", "5")],
        );
        assert_eq!(OrderBookImbalance::new(5).calculate(&book), Some(0.0));
    }

    #[test]
    fn test_depth_limits_levels() {
        let book = book(
            &[("100", "3"), ("99", "100")],
            &[("101", "1"), ("102", "1")],
        );
        assert_eq!(OrderBookImbalance::new(1).calculate(&book), Some(0.5));
        let deep = OrderBookImbalance::new(2).calculate(&book).unwrap();
        assert!((deep - 101.0 / 105.0).abs() < 1e-12);
    }

    #[test]
    fn test_one_sided_and_empty() {
        let bids_only = book(&[("100", "3")], &[]);
        assert_eq!(OrderBookImbalance::new(5).calculate(&bids_only), Some(1.0));

        let zero = book(&[("100", "0")], &[("101", "0")]);
        assert_eq!(OrderBookImbalance::new(5).calculate(&zero), None);
        assert_eq!(OrderBookImbalance::new(0).calculate(&bids_only), None);
    }
}
