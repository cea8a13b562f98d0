use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;
use crate::types::{Price, Size, Symbol};

/// Exchange order identifier
pub type OrderId = String;

/// Timestamp in milliseconds since the Unix epoch
pub type Timestamp = u64;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

/// Order status as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

/// Trading direction requested by a signal or permitted by the sizing engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
    Flat,
}

impl Direction {
    pub fn order_side(&self) -> Option<OrderSide> {
        match self {
            Direction::Long => Some(OrderSide::Buy),
            Direction::Short => Some(OrderSide::Sell),
            Direction::Flat => None,
        }
    }
}

/// Directional signal from the external signal provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Direction,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

impl Signal {
    pub fn new(direction: Direction, confidence: f64) -> Self {
        Self {
            direction,
            confidence,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.confidence.is_finite() && (0.0..=1.0).contains(&self.confidence)
    }
}

/// Order book level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Price,
    pub size: Size,
}

impl OrderBookLevel {
    pub fn new(price: Price, size: Size) -> Self {
        Self { price, size }
    }
}

/// Partial order book for one instrument: bids descending, asks ascending
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: Symbol,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub timestamp: Timestamp,
}

impl OrderBookSnapshot {
    pub fn new(
        symbol: impl Into<Symbol>,
        bids: Vec<OrderBookLevel>,
        asks: Vec<OrderBookLevel>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            bids,
            asks,
            timestamp,
        }
    }

    /// Check strict price monotonicity per side and non-negative sizes
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.bids.is_empty() && self.asks.is_empty() {
            return Err(SnapshotError::Empty);
        }
        for level in self.bids.iter().chain(self.asks.iter()) {
            if level.size.is_negative() {
                return Err(SnapshotError::NegativeSize(level.price));
            }
            if level.price.is_sign_negative() || level.price.is_zero() {
                return Err(SnapshotError::InvalidPrice(level.price));
            }
        }
        if let Some(w) = self.bids.windows(2).find(|w| w[0].price <= w[1].price) {
            return Err(SnapshotError::BidsNotDescending(w[1].price));
        }
        if let Some(w) = self.asks.windows(2).find(|w| w[0].price >= w[1].price) {
            return Err(SnapshotError::AsksNotAscending(w[1].price));
        }
        Ok(())
    }

    /// Keep at most `depth` levels per side
    pub fn truncate(&mut self, depth: usize) {
        self.bids.truncate(depth);
        self.asks.truncate(depth);
    }

    pub fn best_bid(&self) -> Option<&OrderBookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&OrderBookLevel> {
        self.asks.first()
    }

    pub fn mid_price(&self) -> Option<Price> {
        let bid = self.best_bid()?.price.value();
        let ask = self.best_ask()?.price.value();
        Some(Price::new((bid + ask) / Decimal::TWO))
    }
}

/// Executed trade; `aggressor` is the side that crossed the spread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeTick {
    pub symbol: Symbol,
    pub price: Price,
    pub size: Size,
    pub aggressor: OrderSide,
    pub timestamp: Timestamp,
}

impl TradeTick {
    /// Exchanges report whether the buyer was the resting side; the aggressor is
    /// then the seller.
    pub fn from_buyer_maker(
        symbol: impl Into<Symbol>,
        price: Price,
        size: Size,
        is_buyer_maker: bool,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            size,
            aggressor: if is_buyer_maker {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            },
            timestamp,
        }
    }

    pub fn is_buyer_aggressor(&self) -> bool {
        self.aggressor == OrderSide::Buy
    }
}

/// Decoded market data message routed to an instrument pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketEvent {
    Depth(OrderBookSnapshot),
    Trade(TradeTick),
}

impl MarketEvent {
    pub fn symbol(&self) -> &Symbol {
        match self {
            MarketEvent::Depth(snapshot) => &snapshot.symbol,
            MarketEvent::Trade(trade) => &trade.symbol,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            MarketEvent::Depth(snapshot) => snapshot.timestamp,
            MarketEvent::Trade(trade) => trade.timestamp,
        }
    }
}

/// Order submitted to the exchange client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: OrderSide,
    pub quantity: Size,
    pub order_type: OrderType,
    pub reduce_only: bool,
    pub client_order_id: String,
}

/// Exchange acknowledgement of a submitted order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub filled_quantity: Size,
    pub average_price: Option<Price>,
}

/// Fill confirmation delivered after an order was acknowledged as working
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillReport {
    pub symbol: Symbol,
    pub order_id: OrderId,
    pub side: OrderSide,
    pub quantity: Size,
    pub price: Price,
}

/// Realised result of a closing trade; drives the loss-streak counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub symbol: Symbol,
    pub realized_pnl: Decimal,
    pub closed_at: DateTime<Utc>,
}

impl TradeOutcome {
    pub fn is_loss(&self) -> bool {
        self.realized_pnl < Decimal::ZERO
    }
}
