use std::collections::{HashMap, HashSet};

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::events::{OrderBookLevel, OrderBookSnapshot, Timestamp};
use crate::detectors::{BookSide, LevelKey};
use crate::types::{Price, Size};

/// Large level pulled shortly after it appeared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoofEvent {
    pub side: BookSide,
    pub price: Price,
    pub size: Size,
    /// Time the level was visible, in milliseconds
    pub lifetime_ms: u64,
    pub detected_at: Timestamp,
}

#[derive(Debug, Clone, Copy)]
struct TrackedLevel {
    first_seen: Timestamp,
    size: Size,
    /// Exceeded the size multiple of its side median at any observation
    oversized: bool,
}

/// Tracks level lifetimes across snapshots and flags large, short-lived levels.
///
/// Only levels that vanish while their price is still inside the visible book
/// are considered; levels that scroll past the far end of the truncated depth
/// are forgotten silently.
#[derive(Debug, Clone)]
pub struct SpoofingDetector {
    cancel_threshold_ms: u64,
    size_multiple: Decimal,
    tracked: HashMap<LevelKey, TrackedLevel>,
}

impl SpoofingDetector {
    pub fn new(cancel_threshold_ms: u64, size_multiple: f64) -> Self {
        Self {
            cancel_threshold_ms,
            size_multiple: Decimal::from_f64(size_multiple).unwrap_or(Decimal::ONE),
            tracked: HashMap::new(),
        }
    }

    pub fn update(&mut self, book: &OrderBookSnapshot) -> Vec<SpoofEvent> {
        let now = book.timestamp;
        self.observe(BookSide::Bid, &book.bids, now);
        self.observe(BookSide::Ask, &book.asks, now);

        let present: HashSet<LevelKey> = book
            .bids
            .iter()
            .map(|l| LevelKey::new(BookSide::Bid, l.price))
            .chain(book.asks.iter().map(|l| LevelKey::new(BookSide::Ask, l.price)))
            .collect();
        let lowest_bid = book.bids.last().map(|l| l.price);
        let highest_ask = book.asks.last().map(|l| l.price);

        let mut events = Vec::new();
        self.tracked.retain(|key, level| {
            if present.contains(key) {
                return true;
            }
            let in_view = match key.side {
                BookSide::Bid => lowest_bid.map_or(false, |low| key.price >= low),
                BookSide::Ask => highest_ask.map_or(false, |high| key.price <= high),
            };
            let lifetime_ms = now.saturating_sub(level.first_seen);
            if in_view && level.oversized && lifetime_ms <= self.cancel_threshold_ms {
                events.push(SpoofEvent {
                    side: key.side,
                    price: key.price,
                    size: level.size,
                    lifetime_ms,
                    detected_at: now,
                });
            }
            false
        });

        events.sort_by(|a, b| a.side.cmp(&b.side).then(a.price.cmp(&b.price)));
        events
    }

    pub fn tracked_levels(&self) -> usize {
        self.tracked.len()
    }

    fn observe(&mut self, side: BookSide, levels: &[OrderBookLevel], now: Timestamp) {
        let Some(median) = median_size(levels) else {
            return;
        };
        let threshold = median * self.size_multiple;

        for level in levels {
            let oversized = level.size.value() > threshold;
            self.tracked
                .entry(LevelKey::new(side, level.price))
                .and_modify(|t| {
                    t.size = level.size;
                    t.oversized |= oversized;
                })
                .or_insert(TrackedLevel {
                    first_seen: now,
                    size: level.size,
                    oversized,
                });
        }
    }
}

/// Median size of one side, the level under test included
fn median_size(levels: &[OrderBookLevel]) -> Option<Decimal> {
    if levels.is_empty() {
        return None;
    }
    let mut sizes: Vec<Decimal> = levels.iter().map(|l| l.size.value()).collect();
    sizes.sort();
    let mid = sizes.len() / 2;
    Some(if sizes.len() % 2 == 0 {
        (sizes[mid - 1] + sizes[mid]) / Decimal::TWO
    } else {
        sizes[mid]
    })
}
