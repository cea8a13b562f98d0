//! Seams to the collaborators outside the trading core: signal and volatility
//! sources, the exchange account, and the notification and audit sinks.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core::events::{OrderAck, OrderRequest, Signal, TradeOutcome};
use crate::error::{ExchangeError, NotifyError, ProviderError};
use crate::risk::PositionSizingDecision;
use crate::types::{Position, Symbol};

/// Black-box directional signal source
#[async_trait]
pub trait SignalProvider: Send + Sync {
    async fn get_signal(&self, symbol: &Symbol) -> Result<Signal, ProviderError>;
}

/// External volatility factor used for regime classification
#[async_trait]
pub trait VolatilityProvider: Send + Sync {
    async fn get_volatility_factor(&self, symbol: &Symbol) -> Result<f64, ProviderError>;
}

/// Exchange trading account
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, ExchangeError>;

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError>;

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), ExchangeError>;

    /// Account equity in quote currency
    async fn get_equity(&self) -> Result<Decimal, ExchangeError>;
}

/// Best-effort operator notifications
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), NotifyError>;
}

/// Record written to the audit sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuditRecord {
    Decision(PositionSizingDecision),
    Outcome(TradeOutcome),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), NotifyError>;
}

/// Notifier that only writes to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        log::info!("[notify] {}", message);
        Ok(())
    }
}

/// Audit sink that discards everything
#[derive(Debug, Default, Clone)]
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn record(&self, _record: AuditRecord) -> Result<(), NotifyError> {
        Ok(())
    }
}
