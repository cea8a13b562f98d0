use std::collections::{HashMap, VecDeque};

use rust_decimal::prelude::*;

use crate::core::events::OrderBookSnapshot;
use crate::detectors::{BookSide, LevelKey};
use crate::types::Size;

/// Flags resting levels that keep being replenished.
///
/// A level is considered only if it is present in every snapshot of the last
/// `window` snapshots. Each transition between consecutive snapshots counts as
/// replenishment when the size changed but shrank by less than
/// `shrink_fraction` of its previous size. The level is flagged when counted
/// transitions exceed `ratio` of all transitions.
#[derive(Debug, Clone)]
pub struct IcebergDetector {
    window: usize,
    ratio: f64,
    shrink_fraction: Decimal,
}

impl IcebergDetector {
    pub fn new(window: usize, ratio: f64, shrink_fraction: f64) -> Self {
        Self {
            window: window.max(2),
            ratio,
            shrink_fraction: Decimal::from_f64(shrink_fraction).unwrap_or(Decimal::ZERO),
        }
    }

    /// Evaluate the newest `window` snapshots; empty until the window is full
    pub fn evaluate(&self, snapshots: &VecDeque<OrderBookSnapshot>) -> Vec<LevelKey> {
        if snapshots.len() < self.window {
            return Vec::new();
        }
        let recent: Vec<HashMap<LevelKey, Size>> = snapshots
            .iter()
            .skip(snapshots.len() - self.window)
            .map(level_sizes)
            .collect();

        let transitions = (self.window - 1) as f64;
        let mut flagged: Vec<LevelKey> = recent[0]
            .keys()
            .filter(|key| recent.iter().all(|sizes| sizes.contains_key(*key)))
            .filter(|key| {
                let replenished = recent
                    .windows(2)
                    .filter(|pair| self.is_replenishment(pair[0][*key], pair[1][*key]))
                    .count();
                replenished as f64 / transitions > self.ratio
            })
            .copied()
            .collect();

        flagged.sort_by(|a, b| a.side.cmp(&b.side).then(a.price.cmp(&b.price)));
        flagged
    }

    fn is_replenishment(&self, before: Size, after: Size) -> bool {
        if before == after {
            return false;
        }
        let shrink = before.value() - after.value();
        shrink < self.shrink_fraction * before.value()
    }
}

fn level_sizes(book: &OrderBookSnapshot) -> HashMap<LevelKey, Size> {
    let bids = book
        .bids
        .iter()
        .map(|l| (LevelKey::new(BookSide::Bid, l.price), l.size));
    let asks = book
        .asks
        .iter()
        .map(|l| (LevelKey::new(BookSide::Ask, l.price), l.size));
    bids.chain(asks).collect()
}
