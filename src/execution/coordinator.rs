use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use rust_decimal::prelude::*;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::core::events::{
    FillReport, OrderAck, OrderId, OrderRequest, OrderSide, OrderStatus, OrderType, TradeOutcome,
};
use crate::error::{ExchangeError, ExecutionError, ProviderError};
use crate::execution::mode::{ExecutionMode, ModeAction};
use crate::providers::{AuditRecord, AuditSink, ExchangeClient, Notifier};
use crate::risk::{CircuitBreaker, PositionSizingDecision};
use crate::types::{Instrument, Position, Price, Size, Symbol};

/// Tick size (0.01) and quantity step (0.001) assumed for instruments
/// registered without exchange metadata
const DEFAULT_TICK_SCALE: u32 = 2;
const DEFAULT_STEP_SCALE: u32 = 3;

/// Per-instrument trade cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Sizing,
    Submitting,
    AwaitingFill,
    Settled,
    Rejected,
}

impl CycleState {
    /// A new cycle may start from here
    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleState::Idle | CycleState::Settled | CycleState::Rejected)
    }
}

/// Why a decision produced no order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Flat,
    NotifyOnly,
    AlreadyPositioned,
    NoPosition,
    NoReferencePrice,
    ZeroQuantity,
}

/// How a cycle ended, or where it is waiting
#[derive(Debug, Clone, PartialEq)]
pub enum CycleResult {
    Skipped(SkipReason),
    AwaitingFill(OrderId),
    Settled {
        order_id: OrderId,
        outcome: Option<TradeOutcome>,
    },
}

/// Order acknowledged by the exchange but not yet filled
#[derive(Debug, Clone)]
struct PendingFill {
    order_id: OrderId,
    deadline: Instant,
}

/// Turns sizing decisions into at most one outstanding order per instrument,
/// tracks fills and positions, and feeds closed trades to the circuit breaker.
pub struct ExecutionCoordinator {
    config: ExecutionConfig,
    mode: RwLock<ExecutionMode>,
    exchange: Arc<dyn ExchangeClient>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    breaker: CircuitBreaker,
    cycles: DashMap<Symbol, CycleState>,
    pending: DashMap<Symbol, PendingFill>,
    instruments: DashMap<Symbol, Instrument>,
    default_leverage: u32,
}

impl ExecutionCoordinator {
    pub fn new(
        config: ExecutionConfig,
        exchange: Arc<dyn ExchangeClient>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
        breaker: CircuitBreaker,
        default_leverage: u32,
    ) -> Self {
        Self {
            mode: RwLock::new(config.mode),
            config,
            exchange,
            notifier,
            audit,
            breaker,
            cycles: DashMap::new(),
            pending: DashMap::new(),
            instruments: DashMap::new(),
            default_leverage,
        }
    }

    pub async fn mode(&self) -> ExecutionMode {
        *self.mode.read().await
    }

    pub async fn set_mode(&self, mode: ExecutionMode) {
        let mut current = self.mode.write().await;
        if *current != mode {
            info!("Execution mode {} -> {}", *current, mode);
            *current = mode;
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn register_instrument(&self, instrument: Instrument) {
        self.instruments.insert(instrument.symbol.clone(), instrument);
    }

    /// Register `symbol` with default metadata unless already known
    pub fn ensure_instrument(&self, symbol: &Symbol) -> Instrument {
        self.instruments
            .entry(symbol.clone())
            .or_insert_with(|| {
                Instrument::new(
                    symbol.clone(),
                    Price::new(Decimal::new(1, DEFAULT_TICK_SCALE)),
                    Size::new(Decimal::new(1, DEFAULT_STEP_SCALE)),
                    self.default_leverage,
                )
            })
            .clone()
    }

    pub fn instrument(&self, symbol: &Symbol) -> Option<Instrument> {
        self.instruments.get(symbol).map(|i| i.clone())
    }

    pub fn position(&self, symbol: &Symbol) -> Option<Position> {
        self.instruments.get(symbol).and_then(|i| i.position.clone())
    }

    pub fn cycle_state(&self, symbol: &Symbol) -> CycleState {
        self.cycles.get(symbol).map_or(CycleState::Idle, |s| *s)
    }

    /// Replace local positions with the exchange's view
    pub async fn sync_positions(&self) -> Result<usize, ExecutionError> {
        let positions = self.exchange.get_positions().await?;
        for mut entry in self.instruments.iter_mut() {
            let held = positions.iter().find(|p| &p.symbol == entry.key()).cloned();
            entry.value_mut().position = held;
        }
        for position in &positions {
            self.ensure_instrument(&position.symbol);
            if let Some(mut instrument) = self.instruments.get_mut(&position.symbol) {
                instrument.position = Some(position.clone());
            }
        }
        info!("Synchronised {} open positions", positions.len());
        Ok(positions.len())
    }

    /// Run one trade cycle for `decision`.
    ///
    /// Non-flat decisions open a position, or close an opposite one. Fails with
    /// `CycleInFlight` while the previous cycle for the instrument is still open.
    pub async fn execute(
        &self,
        decision: PositionSizingDecision,
    ) -> Result<CycleResult, ExecutionError> {
        self.spawn_audit(AuditRecord::Decision(decision.clone()));
        let symbol = decision.symbol.clone();
        self.expire_stale(&symbol).await;

        let Some(side) = decision.direction.order_side() else {
            return Ok(CycleResult::Skipped(SkipReason::Flat));
        };

        let mode = self.mode().await;
        if mode.action(decision.confidence, self.config.hybrid_confidence) == ModeAction::NotifyOnly {
            self.spawn_notify(format!(
                "[{}] {} {:?} fraction={} stop={} tp={} leverage={} confidence={}",
                mode,
                symbol,
                decision.direction,
                decision.notional_fraction,
                decision.stop_loss_pct,
                decision.take_profit_pct,
                decision.leverage,
                decision.confidence
            ));
            return Ok(CycleResult::Skipped(SkipReason::NotifyOnly));
        }

        self.begin(&symbol)?;
        let result = self.run_cycle(&decision, side).await;
        self.finish(&symbol, &result);
        result
    }

    async fn run_cycle(
        &self,
        decision: &PositionSizingDecision,
        side: OrderSide,
    ) -> Result<CycleResult, ExecutionError> {
        let symbol = &decision.symbol;
        let instrument = self.ensure_instrument(symbol);
        self.apply_leverage(symbol, decision.leverage).await;

        let request = match &instrument.position {
            Some(position) if position.side.opening_order_side() == side => {
                debug!("{} already {:?}, not adding", symbol, position.side);
                return Ok(CycleResult::Skipped(SkipReason::AlreadyPositioned));
            }
            Some(position) => self.closing_request(position),
            None => {
                let Some(price) = decision.reference_price.filter(|p| !p.is_zero()) else {
                    return Ok(CycleResult::Skipped(SkipReason::NoReferencePrice));
                };
                let equity = self
                    .exchange
                    .get_equity()
                    .await
                    .map_err(|e| ProviderError::EquityUnavailable(e.to_string()))?;
                let fraction = Decimal::from_f64(decision.notional_fraction).unwrap_or(Decimal::ZERO);
                let quantity = Size::new(fraction * equity / price.value())
                    .round_down_to_step(instrument.quantity_step);
                if quantity.is_zero() || quantity.is_negative() {
                    return Ok(CycleResult::Skipped(SkipReason::ZeroQuantity));
                }
                self.new_request(symbol, side, quantity, false)
            }
        };

        self.submit(request, decision.reference_price).await
    }

    /// Close the open position on `symbol` through the normal cycle path.
    /// Protective exits are not subject to the execution mode. `mark` prices
    /// the fill when the exchange reports none.
    pub async fn close_position(
        &self,
        symbol: &Symbol,
        mark: Option<Price>,
        reason: &str,
    ) -> Result<CycleResult, ExecutionError> {
        self.expire_stale(symbol).await;
        let Some(position) = self.position(symbol) else {
            return Ok(CycleResult::Skipped(SkipReason::NoPosition));
        };
        self.begin(symbol)?;
        info!("Closing {:?} {} {}: {}", position.side, position.size, symbol, reason);
        self.spawn_notify(format!("Closing {} {:?}: {}", symbol, position.side, reason));

        let result = self.submit(self.closing_request(&position), mark).await;
        self.finish(symbol, &result);
        result
    }

    /// Settle a cycle left in `AwaitingFill`
    pub async fn confirm_fill(&self, fill: FillReport) -> Result<Option<TradeOutcome>, ExecutionError> {
        let expected = match self.pending.get(&fill.symbol) {
            Some(pending) => pending.order_id.clone(),
            None => return Err(ExecutionError::NoPendingCycle(fill.symbol.clone())),
        };
        if expected != fill.order_id {
            return Err(ExecutionError::OrderMismatch {
                expected,
                got: fill.order_id,
            });
        }
        self.pending.remove(&fill.symbol);

        let outcome = self
            .settle(&fill.symbol, fill.side, fill.quantity, fill.price)
            .await;
        self.cycles.insert(fill.symbol.clone(), CycleState::Settled);
        Ok(outcome)
    }

    fn begin(&self, symbol: &Symbol) -> Result<(), ExecutionError> {
        match self.cycles.entry(symbol.clone()) {
            Entry::Occupied(entry) if !entry.get().is_terminal() => {
                Err(ExecutionError::CycleInFlight(symbol.clone()))
            }
            Entry::Occupied(mut entry) => {
                entry.insert(CycleState::Sizing);
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(CycleState::Sizing);
                Ok(())
            }
        }
    }

    fn finish(&self, symbol: &Symbol, result: &Result<CycleResult, ExecutionError>) {
        let state = match result {
            Ok(CycleResult::Settled { .. }) => CycleState::Settled,
            Ok(CycleResult::AwaitingFill(_)) => CycleState::AwaitingFill,
            Ok(CycleResult::Skipped(_)) => CycleState::Idle,
            Err(ExecutionError::Rejected { .. }) => CycleState::Rejected,
            Err(_) => CycleState::Idle,
        };
        self.cycles.insert(symbol.clone(), state);
    }

    fn set_state(&self, symbol: &Symbol, state: CycleState) {
        self.cycles.insert(symbol.clone(), state);
    }

    /// Move the account leverage of `symbol` to `leverage`. Independent of the
    /// decision direction and the execution mode; a failed change is logged and
    /// the previous leverage kept.
    pub async fn apply_leverage(&self, symbol: &Symbol, leverage: u32) {
        let current = self.ensure_instrument(symbol).leverage;
        if current == leverage || leverage == 0 {
            return;
        }
        match self.exchange.set_leverage(symbol, leverage).await {
            Ok(()) => {
                if let Some(mut instrument) = self.instruments.get_mut(symbol) {
                    instrument.leverage = leverage;
                }
                info!("{} leverage set to {}x", symbol, leverage);
            }
            Err(e) => warn!("Failed to set {} leverage to {}x: {}", symbol, leverage, e),
        }
    }

    fn new_request(&self, symbol: &Symbol, side: OrderSide, quantity: Size, reduce_only: bool) -> OrderRequest {
        OrderRequest {
            symbol: symbol.clone(),
            side,
            quantity,
            order_type: OrderType::Market,
            reduce_only,
            client_order_id: Uuid::new_v4().simple().to_string(),
        }
    }

    fn closing_request(&self, position: &Position) -> OrderRequest {
        self.new_request(
            &position.symbol,
            position.side.closing_order_side(),
            position.size,
            true,
        )
    }

    async fn submit(&self, request: OrderRequest, mark: Option<Price>) -> Result<CycleResult, ExecutionError> {
        let symbol = request.symbol.clone();
        self.set_state(&symbol, CycleState::Submitting);

        let ack = match self.submit_with_retry(&request).await {
            Ok(ack) => ack,
            Err((attempts, last_error)) => {
                error!(
                    "{} {:?} {} rejected after {} attempts: {}",
                    symbol, request.side, request.quantity, attempts, last_error
                );
                self.spawn_notify(format!(
                    "Order for {} rejected after {} attempts: {}",
                    symbol, attempts, last_error
                ));
                return Err(ExecutionError::Rejected {
                    symbol,
                    attempts,
                    last_error,
                });
            }
        };

        if ack.status == OrderStatus::Filled {
            let quantity = if ack.filled_quantity.is_zero() {
                request.quantity
            } else {
                ack.filled_quantity
            };
            let price = ack
                .average_price
                .filter(|p| !p.is_zero())
                .or_else(|| mark.filter(|p| !p.is_zero()));
            let outcome = match price {
                Some(price) => self.settle(&symbol, request.side, quantity, price).await,
                None => {
                    warn!(
                        "{} fill {} has no price, adopting the exchange position",
                        symbol, ack.order_id
                    );
                    if let Err(e) = self.reconcile(&symbol).await {
                        warn!("{} position reconciliation failed: {}", symbol, e);
                    }
                    None
                }
            };
            return Ok(CycleResult::Settled {
                order_id: ack.order_id,
                outcome,
            });
        }

        debug!("{} order {} working ({:?})", symbol, ack.order_id, ack.status);
        self.pending.insert(
            symbol.clone(),
            PendingFill {
                order_id: ack.order_id.clone(),
                deadline: Instant::now() + self.config.await_fill_timeout(),
            },
        );
        Ok(CycleResult::AwaitingFill(ack.order_id))
    }

    /// Release a cycle whose order is still unfilled past its deadline. The
    /// exchange's position is adopted; the cycle settles if that changed the
    /// book and is rejected otherwise.
    async fn expire_stale(&self, symbol: &Symbol) {
        let now = Instant::now();
        let Some((_, pending)) = self.pending.remove_if(symbol, |_, p| now >= p.deadline) else {
            return;
        };

        let state = match self.reconcile(symbol).await {
            Ok(true) => CycleState::Settled,
            Ok(false) => CycleState::Rejected,
            Err(e) => {
                warn!("{} position reconciliation failed: {}", symbol, e);
                CycleState::Rejected
            }
        };
        warn!(
            "{} order {} unfilled after {:?}, cycle {:?}",
            symbol,
            pending.order_id,
            self.config.await_fill_timeout(),
            state
        );
        self.spawn_notify(format!(
            "Order {} for {} not filled in time, position taken from exchange",
            pending.order_id, symbol
        ));
        self.set_state(symbol, state);
    }

    /// Replace the local position of `symbol` with the exchange's. Returns
    /// whether the book changed.
    async fn reconcile(&self, symbol: &Symbol) -> Result<bool, ExchangeError> {
        let held = self
            .exchange
            .get_positions()
            .await?
            .into_iter()
            .find(|p| &p.symbol == symbol);
        self.ensure_instrument(symbol);
        let changed = match self.instruments.get_mut(symbol) {
            Some(mut instrument) => {
                let changed = instrument.position != held;
                instrument.position = held;
                changed
            }
            None => false,
        };
        Ok(changed)
    }

    async fn submit_with_retry(&self, request: &OrderRequest) -> Result<OrderAck, (u32, ExchangeError)> {
        let max_attempts = self.config.max_submit_attempts.max(1);
        let timeout = self.config.submit_timeout();
        let mut last_error = ExchangeError::Rejected("not attempted".to_string());

        for attempt in 1..=max_attempts {
            let result = match tokio::time::timeout(timeout, self.exchange.place_order(request.clone())).await {
                Ok(Ok(ack)) if matches!(ack.status, OrderStatus::Rejected | OrderStatus::Expired) => {
                    Err(ExchangeError::Rejected(format!("order {} {:?}", ack.order_id, ack.status)))
                }
                Ok(result) => result,
                Err(_) => Err(ExchangeError::Timeout(timeout)),
            };

            match result {
                Ok(ack) => {
                    info!(
                        "{} {:?} {} accepted as {} (attempt {})",
                        request.symbol, request.side, request.quantity, ack.order_id, attempt
                    );
                    return Ok(ack);
                }
                Err(e) => {
                    warn!(
                        "{} submission attempt {}/{} failed: {}",
                        request.symbol, attempt, max_attempts, e
                    );
                    last_error = e;
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }
        Err((max_attempts, last_error))
    }

    /// Apply a fill to the position book; closing fills produce an outcome that
    /// is fed to the breaker and the audit sink.
    async fn settle(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Size,
        price: Price,
    ) -> Option<TradeOutcome> {
        self.ensure_instrument(symbol);
        let existing = self.position(symbol);
        let effect = Position::apply_fill(existing.as_ref(), symbol, side, quantity, price);

        if let Some(mut instrument) = self.instruments.get_mut(symbol) {
            instrument.position = effect.position.clone();
        }
        self.spawn_notify(format!("Filled {} {:?} {} @ {}", symbol, side, quantity, price));

        let realized_pnl = effect.realized_pnl?;
        let now = Utc::now();
        let outcome = TradeOutcome {
            symbol: symbol.clone(),
            realized_pnl,
            closed_at: now,
        };
        let state = self.breaker.record_outcome(&outcome, now).await;
        if state.is_halted(now) {
            self.spawn_notify(format!(
                "Trading halted after {} consecutive losses",
                state.consecutive_losses
            ));
        }
        self.spawn_audit(AuditRecord::Outcome(outcome.clone()));
        Some(outcome)
    }

    fn spawn_notify(&self, message: String) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&message).await {
                error!("Notification failed: {}", e);
            }
        });
    }

    fn spawn_audit(&self, record: AuditRecord) {
        let audit = self.audit.clone();
        tokio::spawn(async move {
            if let Err(e) = audit.record(record).await {
                warn!("Audit write failed: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::mock::{MockExchange, RecordingAuditSink, RecordingNotifier};
    use crate::core::events::Direction;
    use crate::providers::{MockNotifier, NullAuditSink};
    use crate::regime::Regime;
    use crate::types::PositionSide;
    use std::time::Duration;

    fn px(s: &str) -> Price {
        Price::parse(s).unwrap()
    }

    fn config() -> ExecutionConfig {
        ExecutionConfig {
            retry_delay_ms: 10,
            submit_timeout_ms: 200,
            ..ExecutionConfig::default()
        }
    }

    fn decision(symbol: &str, direction: Direction, fraction: f64) -> PositionSizingDecision {
        PositionSizingDecision {
            id: Uuid::new_v4(),
            symbol: Symbol::new(symbol),
            direction,
            notional_fraction: fraction,
            stop_loss_pct: 0.01,
            take_profit_pct: 0.02,
            leverage: 5,
            confidence: 0.7,
            regime: Regime::StrongBullish,
            reference_price: Some(px("100")),
            timestamp: Utc::now(),
        }
    }

    fn coordinator(
        exchange: Arc<MockExchange>,
        notifier: Arc<RecordingNotifier>,
        config: ExecutionConfig,
    ) -> ExecutionCoordinator {
        ExecutionCoordinator::new(
            config,
            exchange,
            notifier,
            Arc::new(NullAuditSink),
            CircuitBreaker::new(3, Duration::from_secs(60)),
            5,
        )
    }

    #[tokio::test]
    async fn test_flat_decision_submits_nothing() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        let coord = coordinator(exchange.clone(), Arc::new(RecordingNotifier::new()), config());

        let result = coord.execute(decision("BTCUSDT", Direction::Flat, 0.0)).await.unwrap();
        assert_eq!(result, CycleResult::Skipped(SkipReason::Flat));
        assert!(exchange.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_long_decision_opens_position() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        let coord = coordinator(exchange.clone(), Arc::new(RecordingNotifier::new()), config());
        let symbol = Symbol::new("BTCUSDT");

        let result = coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap();
        assert!(matches!(result, CycleResult::Settled { outcome: None, .. }));

        // 0.1 * 10000 / 100
        let orders = exchange.orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].quantity, Size::parse("10").unwrap());
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert!(!orders[0].reduce_only);

        let position = coord.position(&symbol).unwrap();
        assert_eq!(position.side, PositionSide::Long);
        assert_eq!(coord.cycle_state(&symbol), CycleState::Settled);
        assert_eq!(exchange.leverage_calls().await.len(), 0);
    }

    #[tokio::test]
    async fn test_leverage_change_is_applied_first() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        let coord = coordinator(exchange.clone(), Arc::new(RecordingNotifier::new()), config());

        let mut d = decision("BTCUSDT", Direction::Long, 0.05);
        d.leverage = 7;
        coord.execute(d).await.unwrap();

        assert_eq!(exchange.leverage_calls().await, vec![(Symbol::new("BTCUSDT"), 7)]);
        assert_eq!(coord.instrument(&Symbol::new("BTCUSDT")).unwrap().leverage, 7);
    }

    #[tokio::test]
    async fn test_opposite_decision_closes_and_reports_outcome() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        let coord = coordinator(exchange.clone(), Arc::new(RecordingNotifier::new()), config());
        let symbol = Symbol::new("BTCUSDT");

        coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap();
        exchange.set_fill_price(px("95")).await;

        let result = coord.execute(decision("BTCUSDT", Direction::Short, 0.1)).await.unwrap();
        let CycleResult::Settled { outcome: Some(outcome), .. } = result else {
            panic!("expected a closing outcome, got {:?}", result);
        };
        assert_eq!(outcome.realized_pnl, Decimal::new(-50, 0));
        assert!(coord.position(&symbol).is_none());

        let orders = exchange.orders().await;
        assert!(orders[1].reduce_only);
        assert_eq!(orders[1].side, OrderSide::Sell);
        assert_eq!(coord.breaker().snapshot(Utc::now()).await.consecutive_losses, 1);
    }

    #[tokio::test]
    async fn test_same_side_decision_does_not_pyramid() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        let coord = coordinator(exchange.clone(), Arc::new(RecordingNotifier::new()), config());

        coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap();
        let result = coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap();
        assert_eq!(result, CycleResult::Skipped(SkipReason::AlreadyPositioned));
        assert_eq!(exchange.orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        exchange.fail_next(2);
        let coord = coordinator(exchange.clone(), Arc::new(RecordingNotifier::new()), config());

        let result = coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap();
        assert!(matches!(result, CycleResult::Settled { .. }));
        assert_eq!(exchange.orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_after_exhausting_attempts() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        exchange.fail_next(3);
        let notifier = Arc::new(RecordingNotifier::new());
        let coord = coordinator(exchange.clone(), notifier.clone(), config());
        let symbol = Symbol::new("BTCUSDT");

        let err = coord
            .execute(decision("BTCUSDT", Direction::Long, 0.1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Rejected { attempts: 3, .. }));
        assert_eq!(coord.cycle_state(&symbol), CycleState::Rejected);
        assert!(coord.position(&symbol).is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(notifier
            .messages()
            .await
            .iter()
            .any(|m| m.contains("rejected after 3 attempts")));

        // A rejected cycle does not block the next one
        let result = coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap();
        assert!(matches!(result, CycleResult::Settled { .. }));
    }

    #[tokio::test]
    async fn test_slow_submission_times_out() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        exchange.set_latency(Duration::from_millis(500)).await;
        let cfg = ExecutionConfig {
            max_submit_attempts: 1,
            submit_timeout_ms: 20,
            ..config()
        };
        let coord = coordinator(exchange, Arc::new(RecordingNotifier::new()), cfg);

        let err = coord
            .execute(decision("BTCUSDT", Direction::Long, 0.1))
            .await
            .unwrap_err();
        match err {
            ExecutionError::Rejected { last_error, .. } => {
                assert!(matches!(last_error, ExchangeError::Timeout(_)))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_cycle_blocked_while_awaiting_fill() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        exchange.set_ack_status(OrderStatus::New).await;
        let coord = coordinator(exchange.clone(), Arc::new(RecordingNotifier::new()), config());
        let symbol = Symbol::new("BTCUSDT");

        let result = coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap();
        let CycleResult::AwaitingFill(order_id) = result else {
            panic!("expected a working order, got {:?}", result);
        };
        assert_eq!(coord.cycle_state(&symbol), CycleState::AwaitingFill);

        let err = coord
            .execute(decision("BTCUSDT", Direction::Long, 0.1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::CycleInFlight(_)));
        assert_eq!(exchange.orders().await.len(), 1);

        let mismatch = coord
            .confirm_fill(FillReport {
                symbol: symbol.clone(),
                order_id: "other".to_string(),
                side: OrderSide::Buy,
                quantity: Size::parse("10").unwrap(),
                price: px("100"),
            })
            .await
            .unwrap_err();
        assert!(matches!(mismatch, ExecutionError::OrderMismatch { .. }));

        let outcome = coord
            .confirm_fill(FillReport {
                symbol: symbol.clone(),
                order_id,
                side: OrderSide::Buy,
                quantity: Size::parse("10").unwrap(),
                price: px("100"),
            })
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(coord.cycle_state(&symbol), CycleState::Settled);
        assert_eq!(coord.position(&symbol).unwrap().size, Size::parse("10").unwrap());
    }

    #[tokio::test]
    async fn test_confirm_without_pending_cycle() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        let coord = coordinator(exchange, Arc::new(RecordingNotifier::new()), config());
        let err = coord
            .confirm_fill(FillReport {
                symbol: Symbol::new("ETHUSDT"),
                order_id: "mock_1".to_string(),
                side: OrderSide::Buy,
                quantity: Size::parse("1").unwrap(),
                price: px("100"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NoPendingCycle(_)));
    }

    #[tokio::test]
    async fn test_unfilled_order_expires_into_rejected_cycle() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        exchange.set_ack_status(OrderStatus::New).await;
        let notifier = Arc::new(RecordingNotifier::new());
        let cfg = ExecutionConfig {
            await_fill_timeout_ms: 30,
            ..config()
        };
        let coord = coordinator(exchange.clone(), notifier.clone(), cfg);
        let symbol = Symbol::new("BTCUSDT");

        let result = coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap();
        assert!(matches!(result, CycleResult::AwaitingFill(_)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        exchange.set_ack_status(OrderStatus::Filled).await;

        // Exchange reports nothing held: the working order never filled
        let result = coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap();
        assert!(matches!(result, CycleResult::Settled { .. }));
        assert_eq!(exchange.orders().await.len(), 2);
        assert_eq!(coord.position(&symbol).unwrap().side, PositionSide::Long);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(notifier
            .messages()
            .await
            .iter()
            .any(|m| m.contains("not filled in time")));
    }

    #[tokio::test]
    async fn test_expired_order_adopts_exchange_position() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        exchange.set_ack_status(OrderStatus::New).await;
        let cfg = ExecutionConfig {
            await_fill_timeout_ms: 30,
            ..config()
        };
        let coord = coordinator(exchange.clone(), Arc::new(RecordingNotifier::new()), cfg);
        let symbol = Symbol::new("BTCUSDT");

        let CycleResult::AwaitingFill(order_id) =
            coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap()
        else {
            panic!("expected a working order");
        };

        // Not yet expired: the next cycle is still blocked
        assert!(matches!(
            coord.execute(decision("BTCUSDT", Direction::Short, 0.1)).await,
            Err(ExecutionError::CycleInFlight(_))
        ));

        exchange
            .set_positions(vec![Position::new(
                symbol.clone(),
                PositionSide::Long,
                Size::parse("10").unwrap(),
                px("100"),
            )])
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        exchange.set_ack_status(OrderStatus::Filled).await;
        exchange.set_fill_price(px("104")).await;

        let result = coord.close_position(&symbol, Some(px("104")), "stop").await.unwrap();
        let CycleResult::Settled { outcome: Some(outcome), .. } = result else {
            panic!("expected a closing outcome, got {:?}", result);
        };
        assert_eq!(outcome.realized_pnl, Decimal::new(40, 0));
        assert!(coord.position(&symbol).is_none());

        // The late fill no longer matches a pending cycle
        let err = coord
            .confirm_fill(FillReport {
                symbol: symbol.clone(),
                order_id,
                side: OrderSide::Buy,
                quantity: Size::parse("10").unwrap(),
                price: px("100"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NoPendingCycle(_)));
    }

    #[tokio::test]
    async fn test_priceless_close_uses_mark_not_zero() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        let coord = coordinator(exchange.clone(), Arc::new(RecordingNotifier::new()), config());
        let symbol = Symbol::new("BTCUSDT");

        coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap();
        exchange.omit_fill_price(true);

        let result = coord.close_position(&symbol, Some(px("102")), "take profit").await.unwrap();
        let CycleResult::Settled { outcome: Some(outcome), .. } = result else {
            panic!("expected a closing outcome, got {:?}", result);
        };
        assert_eq!(outcome.realized_pnl, Decimal::new(20, 0));
        assert_eq!(coord.breaker().snapshot(Utc::now()).await.consecutive_losses, 0);
    }

    #[tokio::test]
    async fn test_priceless_fill_without_mark_reconciles() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        let coord = coordinator(exchange.clone(), Arc::new(RecordingNotifier::new()), config());
        let symbol = Symbol::new("BTCUSDT");

        coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap();
        exchange.omit_fill_price(true);

        let result = coord.close_position(&symbol, None, "stop").await.unwrap();
        assert!(matches!(result, CycleResult::Settled { outcome: None, .. }));
        // Exchange reports flat, no fabricated loss is booked
        assert!(coord.position(&symbol).is_none());
        assert_eq!(coord.breaker().snapshot(Utc::now()).await.consecutive_losses, 0);
    }

    #[tokio::test]
    async fn test_priceless_open_takes_reference_price() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        exchange.omit_fill_price(true);
        let coord = coordinator(exchange.clone(), Arc::new(RecordingNotifier::new()), config());

        coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap();
        let position = coord.position(&Symbol::new("BTCUSDT")).unwrap();
        assert_eq!(position.entry_price, px("100"));
    }

    #[tokio::test]
    async fn test_apply_leverage_ignores_mode() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        let coord = coordinator(exchange.clone(), Arc::new(RecordingNotifier::new()), config());
        let symbol = Symbol::new("BTCUSDT");

        coord.apply_leverage(&symbol, 5).await;
        assert!(exchange.leverage_calls().await.is_empty());

        coord.set_mode(ExecutionMode::Manual).await;
        coord.apply_leverage(&symbol, 3).await;
        assert_eq!(exchange.leverage_calls().await, vec![(symbol.clone(), 3)]);
        assert_eq!(coord.instrument(&symbol).unwrap().leverage, 3);
    }

    #[tokio::test]
    async fn test_semi_automatic_only_notifies() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|m| m.contains("BTCUSDT") && m.contains("semi_automatic"))
            .times(1)
            .returning(|_| Ok(()));
        let coord = ExecutionCoordinator::new(
            ExecutionConfig {
                mode: ExecutionMode::SemiAutomatic,
                ..config()
            },
            exchange.clone(),
            Arc::new(notifier),
            Arc::new(NullAuditSink),
            CircuitBreaker::new(3, Duration::from_secs(60)),
            5,
        );

        let result = coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap();
        assert_eq!(result, CycleResult::Skipped(SkipReason::NotifyOnly));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(exchange.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_hybrid_mode_gates_on_confidence() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        let coord = coordinator(exchange.clone(), Arc::new(RecordingNotifier::new()), config());
        coord.set_mode(ExecutionMode::Hybrid).await;

        let low = decision("BTCUSDT", Direction::Long, 0.1);
        assert_eq!(
            coord.execute(low).await.unwrap(),
            CycleResult::Skipped(SkipReason::NotifyOnly)
        );

        let mut high = decision("BTCUSDT", Direction::Long, 0.1);
        high.confidence = 0.9;
        assert!(matches!(coord.execute(high).await.unwrap(), CycleResult::Settled { .. }));
    }

    #[tokio::test]
    async fn test_close_position_bypasses_mode() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        let coord = coordinator(exchange.clone(), Arc::new(RecordingNotifier::new()), config());
        let symbol = Symbol::new("BTCUSDT");

        coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap();
        coord.set_mode(ExecutionMode::Manual).await;
        exchange.set_fill_price(px("110")).await;

        let result = coord.close_position(&symbol, Some(px("110")), "take profit").await.unwrap();
        let CycleResult::Settled { outcome: Some(outcome), .. } = result else {
            panic!("expected a closing outcome, got {:?}", result);
        };
        assert_eq!(outcome.realized_pnl, Decimal::new(100, 0));
        assert!(coord.position(&symbol).is_none());
        assert_eq!(
            coord.close_position(&symbol, None, "again").await.unwrap(),
            CycleResult::Skipped(SkipReason::NoPosition)
        );
    }

    #[tokio::test]
    async fn test_decisions_and_outcomes_are_audited() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        let audit = Arc::new(RecordingAuditSink::new());
        let coord = ExecutionCoordinator::new(
            config(),
            exchange.clone(),
            Arc::new(RecordingNotifier::new()),
            audit.clone(),
            CircuitBreaker::new(3, Duration::from_secs(60)),
            5,
        );

        coord.execute(decision("BTCUSDT", Direction::Long, 0.1)).await.unwrap();
        coord.execute(decision("BTCUSDT", Direction::Short, 0.1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(audit.decisions().await.len(), 2);
        assert_eq!(audit.outcomes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_positions_adopts_exchange_view() {
        let exchange = Arc::new(MockExchange::new(Decimal::new(10_000, 0), px("100")));
        let symbol = Symbol::new("ETHUSDT");
        exchange
            .set_positions(vec![Position::new(
                symbol.clone(),
                PositionSide::Short,
                Size::parse("2").unwrap(),
                px("2000"),
            )])
            .await;
        let coord = coordinator(exchange, Arc::new(RecordingNotifier::new()), config());

        assert_eq!(coord.sync_positions().await.unwrap(), 1);
        assert_eq!(coord.position(&symbol).unwrap().side, PositionSide::Short);
    }
}
