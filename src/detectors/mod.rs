//! Per-instrument microstructure detectors.
//!
//! One [`MicrostructureDetector`] is built per instrument from the shared
//! [`DetectorConfig`]; it has a single writer (the instrument pipeline) so its
//! state is plain owned data.

pub mod atr;
pub mod iceberg;
pub mod imbalance;
pub mod spoofing;
pub mod trade_flow;

use std::collections::VecDeque;

use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use atr::{Bar, VolatilityTracker};
pub use iceberg::IcebergDetector;
pub use imbalance::OrderBookImbalance;
pub use spoofing::{SpoofEvent, SpoofingDetector};
pub use trade_flow::{IntervalVwap, TradeFlow};

use crate::config::DetectorConfig;
use crate::core::events::{MarketEvent, OrderBookSnapshot, Timestamp, TradeTick};
use crate::types::{Price, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

/// Price level on one side of the book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LevelKey {
    pub side: BookSide,
    pub price: Price,
}

impl LevelKey {
    pub fn new(side: BookSide, price: Price) -> Self {
        Self { side, price }
    }
}

/// Imbalance at one configured depth
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthImbalance {
    pub depth: usize,
    pub value: Option<f64>,
}

/// Derived metrics after the latest update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicrostructureSnapshot {
    pub symbol: Symbol,
    pub timestamp: Timestamp,
    pub imbalance: Vec<DepthImbalance>,
    pub iceberg_levels: Vec<LevelKey>,
    pub spoof_suspected: bool,
    pub vwap: Vec<IntervalVwap>,
    pub obv: Decimal,
    pub intensity: Option<f64>,
    pub tick_rate: f64,
    pub large_trade: bool,
    pub volume_spike: bool,
    pub atr: Option<Price>,
    pub realized_volatility: Option<f64>,
    pub recent_volume: Option<Decimal>,
    pub reference_volume: Option<Decimal>,
    pub mid_price: Option<Price>,
    pub last_price: Option<Price>,
}

impl MicrostructureSnapshot {
    /// Imbalance at the shallowest configured depth
    pub fn primary_imbalance(&self) -> Option<f64> {
        self.imbalance.first().and_then(|i| i.value)
    }

    /// Best available reference price: last trade, else mid
    pub fn reference_price(&self) -> Option<Price> {
        self.last_price.or(self.mid_price)
    }
}

/// All detectors of one instrument behind a single update entry point
#[derive(Debug)]
pub struct MicrostructureDetector {
    symbol: Symbol,
    config: DetectorConfig,
    snapshots: VecDeque<OrderBookSnapshot>,
    imbalance: Vec<OrderBookImbalance>,
    iceberg: IcebergDetector,
    spoofing: SpoofingDetector,
    last_spoof: Option<Timestamp>,
    flow: TradeFlow,
    volatility: VolatilityTracker,
    iceberg_levels: Vec<LevelKey>,
    last_update: Timestamp,
}

impl MicrostructureDetector {
    pub fn new(symbol: Symbol, config: &DetectorConfig) -> Self {
        let mut depths = config.imbalance_depths.clone();
        depths.sort_unstable();
        depths.dedup();

        Self {
            symbol,
            snapshots: VecDeque::with_capacity(config.snapshot_window),
            imbalance: depths.into_iter().map(OrderBookImbalance::new).collect(),
            iceberg: IcebergDetector::new(
                config.iceberg_window,
                config.iceberg_ratio,
                config.iceberg_shrink_fraction,
            ),
            spoofing: SpoofingDetector::new(config.spoof_cancel_ms, config.spoof_size_multiple),
            last_spoof: None,
            flow: TradeFlow::new(
                &config.flow_intervals_secs,
                config.trade_window,
                config.intensity_window,
                config.large_trade_size,
                config.volume_spike_multiple,
            ),
            volatility: VolatilityTracker::new(
                config.atr_bar_secs,
                config.atr_period,
                config.volatility_bars,
            ),
            iceberg_levels: Vec::new(),
            last_update: 0,
            config: config.clone(),
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Fold one event into the detector state.
    ///
    /// Events for other instruments and malformed books are skipped with the
    /// prior state retained; the return value is then None.
    pub fn update(&mut self, event: &MarketEvent) -> Option<MicrostructureSnapshot> {
        if event.symbol() != &self.symbol {
            debug!("{} detector ignoring event for {}", self.symbol, event.symbol());
            return None;
        }
        match event {
            MarketEvent::Depth(book) => self.on_book(book)?,
            MarketEvent::Trade(tick) => self.on_trade(tick),
        }
        self.last_update = self.last_update.max(event.timestamp());
        Some(self.snapshot())
    }

    fn on_book(&mut self, book: &OrderBookSnapshot) -> Option<()> {
        if let Err(e) = book.validate() {
            debug!("Skipping invalid {} book: {}", self.symbol, e);
            return None;
        }
        if self.snapshots.len() == self.config.snapshot_window.max(1) {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(book.clone());

        self.iceberg_levels = self.iceberg.evaluate(&self.snapshots);
        let spoofs = self.spoofing.update(book);
        if let Some(latest) = spoofs.last() {
            debug!(
                "{} spoof suspected: {:?} {} size {} lived {}ms",
                self.symbol, latest.side, latest.price, latest.size, latest.lifetime_ms
            );
            self.last_spoof = Some(latest.detected_at);
        }
        Some(())
    }

    fn on_trade(&mut self, tick: &TradeTick) {
        self.flow.update(tick);
        self.volatility.update(tick);
    }

    /// Current derived metrics
    pub fn snapshot(&self) -> MicrostructureSnapshot {
        let book = self.snapshots.back();
        MicrostructureSnapshot {
            symbol: self.symbol.clone(),
            timestamp: self.last_update,
            imbalance: self
                .imbalance
                .iter()
                .map(|i| DepthImbalance {
                    depth: i.levels(),
                    value: book.and_then(|b| i.calculate(b)),
                })
                .collect(),
            iceberg_levels: self.iceberg_levels.clone(),
            spoof_suspected: self.spoof_suspected(),
            vwap: self.flow.vwaps(),
            obv: self.flow.obv(),
            intensity: self.flow.intensity(),
            tick_rate: self.flow.tick_rate(),
            large_trade: self.flow.is_large_trade(),
            volume_spike: self.flow.is_volume_spike(),
            atr: self.volatility.atr(),
            realized_volatility: self.volatility.realized_volatility(),
            recent_volume: self.flow.recent_volume(),
            reference_volume: self.flow.reference_volume(),
            mid_price: book.and_then(OrderBookSnapshot::mid_price),
            last_price: self.flow.last_price(),
        }
    }

    /// A spoof was flagged within the configured memory horizon
    fn spoof_suspected(&self) -> bool {
        self.last_spoof.map_or(false, |at| {
            self.last_update.saturating_sub(at) <= self.config.spoof_memory_ms
        })
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn trade_count(&self) -> usize {
        self.flow.len()
    }
}
