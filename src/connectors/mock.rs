//! In-memory doubles for the transport, the exchange and the signal sources.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;

use crate::core::events::{OrderAck, OrderRequest, OrderStatus, Signal, TradeOutcome};
use crate::error::{ExchangeError, FeedError, NotifyError, ProviderError};
use crate::feed::transport::{Connector, DuplexChannel, Frame};
use crate::providers::{
    AuditRecord, AuditSink, ExchangeClient, Notifier, SignalProvider, VolatilityProvider,
};
use crate::risk::PositionSizingDecision;
use crate::types::{Position, Price, Symbol};

/// Scripted server side of one connection lifetime
pub struct ScriptedSession {
    tx: UnboundedSender<Frame>,
    rx: UnboundedReceiver<Frame>,
    hold_open: bool,
    auto_pong: bool,
    sent: Arc<Mutex<Vec<Frame>>>,
}

impl ScriptedSession {
    /// Deliver `frames` then close, unless `hold_open` is set
    pub fn new(frames: Vec<Frame>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for frame in frames {
            let _ = tx.send(frame);
        }
        Self {
            tx,
            rx,
            hold_open: false,
            auto_pong: false,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Session that stays open while the returned sender is alive
    pub fn live(frames: Vec<Frame>) -> (Self, UnboundedSender<Frame>) {
        let session = Self::new(frames);
        let tx = session.tx.clone();
        (session, tx)
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Answer every keepalive ping
    pub fn auto_pong(mut self) -> Self {
        self.auto_pong = true;
        self
    }

    /// Frames the client sent during this session
    pub fn sent_frames(&self) -> Arc<Mutex<Vec<Frame>>> {
        self.sent.clone()
    }

    fn into_channel(self) -> ScriptedChannel {
        let keep = self.hold_open || self.auto_pong;
        ScriptedChannel {
            tx: keep.then_some(self.tx),
            rx: self.rx,
            auto_pong: self.auto_pong,
            sent: self.sent,
        }
    }
}

struct ScriptedChannel {
    tx: Option<UnboundedSender<Frame>>,
    rx: UnboundedReceiver<Frame>,
    auto_pong: bool,
    sent: Arc<Mutex<Vec<Frame>>>,
}

#[async_trait]
impl DuplexChannel for ScriptedChannel {
    async fn recv(&mut self) -> Option<Result<Frame, FeedError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn send(&mut self, frame: Frame) -> Result<(), FeedError> {
        if let (Frame::Ping(data), true, Some(tx)) = (&frame, self.auto_pong, &self.tx) {
            let _ = tx.send(Frame::Pong(data.clone()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
        Ok(())
    }
}

/// Connector replaying queued sessions per endpoint; fails when none are left
#[derive(Default)]
pub struct ScriptedConnector {
    sessions: Mutex<HashMap<String, VecDeque<ScriptedSession>>>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_session(&self, endpoint: &str, session: ScriptedSession) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint.to_string())
            .or_default()
            .push_back(session);
    }

    pub fn connect_attempts(&self, endpoint: &str) -> usize {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn DuplexChannel>, FeedError> {
        *self
            .attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint.to_string())
            .or_default() += 1;

        let session = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front);

        match session {
            Some(session) => Ok(Box::new(session.into_channel())),
            None => Err(FeedError::Connect {
                endpoint: endpoint.to_string(),
                reason: "no scripted session".to_string(),
            }),
        }
    }
}

/// Exchange double with scripted rejections, latency and ack status
#[derive(Debug)]
pub struct MockExchange {
    equity: RwLock<Decimal>,
    fill_price: RwLock<Price>,
    ack_status: RwLock<OrderStatus>,
    latency: RwLock<Duration>,
    failures_remaining: AtomicU32,
    omit_price: AtomicBool,
    order_counter: AtomicU64,
    orders: RwLock<Vec<OrderRequest>>,
    leverage_calls: RwLock<Vec<(Symbol, u32)>>,
    positions: RwLock<Vec<Position>>,
}

impl MockExchange {
    pub fn new(equity: Decimal, fill_price: Price) -> Self {
        Self {
            equity: RwLock::new(equity),
            fill_price: RwLock::new(fill_price),
            ack_status: RwLock::new(OrderStatus::Filled),
            latency: RwLock::new(Duration::ZERO),
            failures_remaining: AtomicU32::new(0),
            omit_price: AtomicBool::new(false),
            order_counter: AtomicU64::new(1),
            orders: RwLock::new(Vec::new()),
            leverage_calls: RwLock::new(Vec::new()),
            positions: RwLock::new(Vec::new()),
        }
    }

    pub async fn set_fill_price(&self, price: Price) {
        *self.fill_price.write().await = price;
    }

    pub async fn set_equity(&self, equity: Decimal) {
        *self.equity.write().await = equity;
    }

    /// Status returned by subsequent acks; anything but `Filled` leaves the
    /// fill to be confirmed later.
    pub async fn set_ack_status(&self, status: OrderStatus) {
        *self.ack_status.write().await = status;
    }

    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.write().await = latency;
    }

    pub async fn set_positions(&self, positions: Vec<Position>) {
        *self.positions.write().await = positions;
    }

    /// Report fills without an average price
    pub fn omit_fill_price(&self, omit: bool) {
        self.omit_price.store(omit, Ordering::SeqCst);
    }

    /// Reject the next `n` submissions
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub async fn orders(&self) -> Vec<OrderRequest> {
        self.orders.read().await.clone()
    }

    pub async fn leverage_calls(&self) -> Vec<(Symbol, u32)> {
        self.leverage_calls.read().await.clone()
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, ExchangeError> {
        let latency = *self.latency.read().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ExchangeError::Rejected("scripted rejection".to_string()));
        }

        let status = *self.ack_status.read().await;
        let price = *self.fill_price.read().await;
        let id = self.order_counter.fetch_add(1, Ordering::SeqCst);
        let filled = status == OrderStatus::Filled;
        let ack = OrderAck {
            order_id: format!("mock_{}", id),
            status,
            filled_quantity: if filled { order.quantity } else { Default::default() },
            average_price: (filled && !self.omit_price.load(Ordering::SeqCst)).then_some(price),
        };
        self.orders.write().await.push(order);
        Ok(ack)
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        Ok(self.positions.read().await.clone())
    }

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), ExchangeError> {
        self.leverage_calls
            .write()
            .await
            .push((symbol.clone(), leverage));
        Ok(())
    }

    async fn get_equity(&self) -> Result<Decimal, ExchangeError> {
        Ok(*self.equity.read().await)
    }
}

/// Signal source with per-instrument fixed signals
#[derive(Debug, Default)]
pub struct MockSignalProvider {
    signals: DashMap<Symbol, Signal>,
}

impl MockSignalProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_signal(&self, symbol: &Symbol, signal: Signal) {
        self.signals.insert(symbol.clone(), signal);
    }

    pub fn clear_signal(&self, symbol: &Symbol) {
        self.signals.remove(symbol);
    }
}

#[async_trait]
impl SignalProvider for MockSignalProvider {
    async fn get_signal(&self, symbol: &Symbol) -> Result<Signal, ProviderError> {
        self.signals
            .get(symbol)
            .map(|s| *s)
            .ok_or_else(|| ProviderError::SignalUnavailable(symbol.clone()))
    }
}

/// Volatility source with per-instrument fixed factors
#[derive(Debug, Default)]
pub struct MockVolatilityProvider {
    factors: DashMap<Symbol, f64>,
}

impl MockVolatilityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_factor(&self, symbol: &Symbol, factor: f64) {
        self.factors.insert(symbol.clone(), factor);
    }
}

#[async_trait]
impl VolatilityProvider for MockVolatilityProvider {
    async fn get_volatility_factor(&self, symbol: &Symbol) -> Result<f64, ProviderError> {
        self.factors
            .get(symbol)
            .map(|f| *f)
            .ok_or_else(|| ProviderError::VolatilityUnavailable(symbol.clone()))
    }
}

/// Notifier keeping every message in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: RwLock<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<String> {
        self.messages.read().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        self.messages.write().await.push(message.to_string());
        Ok(())
    }
}

/// Audit sink keeping every record in memory
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    records: RwLock<Vec<AuditRecord>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn decisions(&self) -> Vec<PositionSizingDecision> {
        self.records
            .read()
            .await
            .iter()
            .filter_map(|r| match r {
                AuditRecord::Decision(d) => Some(d.clone()),
                AuditRecord::Outcome(_) => None,
            })
            .collect()
    }

    pub async fn outcomes(&self) -> Vec<TradeOutcome> {
        self.records
            .read()
            .await
            .iter()
            .filter_map(|r| match r {
                AuditRecord::Outcome(o) => Some(o.clone()),
                AuditRecord::Decision(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), NotifyError> {
        self.records.write().await.push(record);
        Ok(())
    }
}
