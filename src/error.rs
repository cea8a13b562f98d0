use std::time::Duration;

use thiserror::Error;

use crate::types::{Price, Symbol};

/// Structural problems with a decoded order book
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("order book has no levels")]
    Empty,
    #[error("negative size at price {0}")]
    NegativeSize(Price),
    #[error("non-positive price {0}")]
    InvalidPrice(Price),
    #[error("bids not strictly descending at {0}")]
    BidsNotDescending(Price),
    #[error("asks not strictly ascending at {0}")]
    AsksNotAscending(Price),
}

/// Market data transport and decoding errors
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(#[from] SnapshotError),
    #[error("no pong within {0:?}")]
    KeepaliveTimeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("unknown instrument {0}")]
    UnknownInstrument(Symbol),
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Parse(e.to_string())
    }
}

impl From<rust_decimal::Error> for FeedError {
    fn from(e: rust_decimal::Error) -> Self {
        FeedError::Parse(e.to_string())
    }
}

/// Failures of the external signal, volatility and account providers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("no signal available for {0}")]
    SignalUnavailable(Symbol),
    #[error("no volatility factor available for {0}")]
    VolatilityUnavailable(Symbol),
    #[error("account equity unavailable: {0}")]
    EquityUnavailable(String),
}

/// Errors returned by the exchange trading client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid leverage {0}")]
    InvalidLeverage(u32),
}

/// Execution coordinator errors
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("a trade cycle is already in flight for {0}")]
    CycleInFlight(Symbol),
    #[error("no cycle awaiting a fill for {0}")]
    NoPendingCycle(Symbol),
    #[error("fill for order {got} does not match pending order {expected}")]
    OrderMismatch { expected: String, got: String },
    #[error("submission for {symbol} rejected after {attempts} attempts: {last_error}")]
    Rejected {
        symbol: Symbol,
        attempts: u32,
        last_error: ExchangeError,
    },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Notification sink failures; logged, never propagated into trading
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Logger installation errors
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level {0}")]
    InvalidLevel(String),
    #[error("failed to open log file: {0}")]
    Io(#[from] std::io::Error),
    #[error("logger already installed: {0}")]
    AlreadyInstalled(#[from] log::SetLoggerError),
}
