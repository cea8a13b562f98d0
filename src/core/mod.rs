pub mod events;

pub use events::{
    Direction, FillReport, MarketEvent, OrderAck, OrderBookLevel, OrderBookSnapshot, OrderId,
    OrderRequest, OrderSide, OrderStatus, OrderType, Signal, Timestamp, TradeOutcome, TradeTick,
};
