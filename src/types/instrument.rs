use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core::events::{Direction, OrderSide};
use crate::types::{Price, Size, Symbol};

/// Side of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn direction(&self) -> Direction {
        match self {
            PositionSide::Long => Direction::Long,
            PositionSide::Short => Direction::Short,
        }
    }

    pub fn from_direction(direction: Direction) -> Option<PositionSide> {
        match direction {
            Direction::Long => Some(PositionSide::Long),
            Direction::Short => Some(PositionSide::Short),
            Direction::Flat => None,
        }
    }

    /// Order side that increases a position of this side
    pub fn opening_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position of this side
    pub fn closing_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    fn sign(&self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

/// Open position on one instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub size: Size,
    pub entry_price: Price,
}

/// Result of applying a fill to a position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillEffect {
    /// Position after the fill, None when it was closed flat
    pub position: Option<Position>,
    /// PnL realised by the reducing part of the fill, None for pure opening fills
    pub realized_pnl: Option<Decimal>,
}

impl Position {
    pub fn new(symbol: Symbol, side: PositionSide, size: Size, entry_price: Price) -> Self {
        Self {
            symbol,
            side,
            size,
            entry_price,
        }
    }

    pub fn unrealized_pnl(&self, mark: Price) -> Decimal {
        (mark.value() - self.entry_price.value()) * self.size.value() * self.side.sign()
    }

    pub fn is_losing(&self, mark: Price) -> bool {
        self.unrealized_pnl(mark) < Decimal::ZERO
    }

    /// Apply a fill of `qty` at `price` on `side` to an optional existing position.
    ///
    /// Same-side fills average into the entry. Opposite-side fills realise PnL on
    /// the reduced quantity and flip the position if they exceed it.
    pub fn apply_fill(
        existing: Option<&Position>,
        symbol: &Symbol,
        side: OrderSide,
        qty: Size,
        price: Price,
    ) -> FillEffect {
        let fill_side = match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };

        let Some(pos) = existing else {
            return FillEffect {
                position: (!qty.is_zero())
                    .then(|| Position::new(symbol.clone(), fill_side, qty, price)),
                realized_pnl: None,
            };
        };

        if pos.side == fill_side {
            let total = pos.size + qty;
            let entry = if total.is_zero() {
                price
            } else {
                Price::new((pos.size * pos.entry_price + qty * price) / total.value())
            };
            return FillEffect {
                position: Some(Position::new(symbol.clone(), fill_side, total, entry)),
                realized_pnl: None,
            };
        }

        let closed = qty.min(pos.size);
        let realized =
            (price.value() - pos.entry_price.value()) * closed.value() * pos.side.sign();
        let remaining = pos.size - closed;
        let flipped = qty - closed;

        let position = if !remaining.is_zero() {
            Some(Position::new(symbol.clone(), pos.side, remaining, pos.entry_price))
        } else if !flipped.is_zero() {
            Some(Position::new(symbol.clone(), fill_side, flipped, price))
        } else {
            None
        };

        FillEffect {
            position,
            realized_pnl: Some(realized),
        }
    }
}

/// Static exchange metadata plus the live account state for one instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: Symbol,
    pub tick_size: Price,
    pub quantity_step: Size,
    pub leverage: u32,
    pub position: Option<Position>,
}

impl Instrument {
    pub fn new(symbol: Symbol, tick_size: Price, quantity_step: Size, leverage: u32) -> Self {
        Self {
            symbol,
            tick_size,
            quantity_step,
            leverage,
            position: None,
        }
    }
}
