pub mod config;
pub mod connectors;
pub mod core;
pub mod detectors;
pub mod engine;
pub mod error;
pub mod execution;
pub mod feed;
pub mod logging;
pub mod pipeline;
pub mod providers;
pub mod regime;
pub mod risk;
pub mod types;

pub use crate::config::EngineConfig;
pub use crate::core::events::{
    Direction, FillReport, MarketEvent, OrderAck, OrderBookLevel, OrderBookSnapshot, OrderRequest,
    OrderSide, OrderStatus, OrderType, Signal, TradeOutcome, TradeTick,
};
pub use detectors::{MicrostructureDetector, MicrostructureSnapshot};
pub use engine::{Collaborators, TradingEngine};
pub use error::{ConfigError, ExchangeError, ExecutionError, FeedError, ProviderError};
pub use execution::{CycleResult, CycleState, ExecutionCoordinator, ExecutionMode};
pub use feed::{FeedMultiplexer, StreamConnection};
pub use logging::init_logging;
pub use providers::{AuditSink, ExchangeClient, Notifier, SignalProvider, VolatilityProvider};
pub use regime::{Regime, RegimeClassifier};
pub use risk::{
    CircuitBreaker, LeverageManager, PositionSizingDecision, RiskSizingEngine, StopController,
};
pub use types::{Instrument, Position, Price, Size, Symbol};
