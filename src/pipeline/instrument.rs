//! Per-instrument worker: detectors, regime, sizing and protective exits run
//! sequentially on one task, fed by the multiplexer's route for the symbol.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::connectors::DryRunExchange;
use crate::core::events::{MarketEvent, Timestamp};
use crate::detectors::{MicrostructureDetector, MicrostructureSnapshot};
use crate::error::ExecutionError;
use crate::execution::{CycleResult, ExecutionCoordinator};
use crate::providers::{ExchangeClient, SignalProvider, VolatilityProvider};
use crate::regime::{Regime, RegimeClassifier, RegimeInputs};
use crate::risk::{
    LeverageManager, PositionSizingDecision, RiskSizingEngine, SizingRequest, StopController,
    TrailingStop,
};
use crate::types::{Price, Symbol};

/// Collaborators shared by every pipeline
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<EngineConfig>,
    pub signals: Arc<dyn SignalProvider>,
    pub volatility: Arc<dyn VolatilityProvider>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub coordinator: Arc<ExecutionCoordinator>,
    /// Paper account whose marks follow the feed
    pub paper: Option<Arc<DryRunExchange>>,
}

pub struct InstrumentPipeline {
    symbol: Symbol,
    ctx: PipelineContext,
    detector: MicrostructureDetector,
    classifier: RegimeClassifier,
    sizing: RiskSizingEngine,
    stops: StopController,
    leverage: LeverageManager,
    trailing: Option<TrailingStop>,
    regime: Option<Regime>,
    last_evaluation: Option<Timestamp>,
}

impl InstrumentPipeline {
    pub fn new(symbol: Symbol, ctx: PipelineContext) -> Self {
        let config = ctx.config.clone();
        let stops = StopController::new(config.stops.clone(), config.sizing.risk_reward_ratio);
        Self {
            detector: MicrostructureDetector::new(symbol.clone(), &config.detectors),
            classifier: RegimeClassifier::new(config.regime.clone()),
            sizing: RiskSizingEngine::new(config.sizing.clone(), stops.clone()),
            stops,
            leverage: LeverageManager::new(config.leverage.clone()),
            trailing: None,
            regime: None,
            last_evaluation: None,
            symbol,
            ctx,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Regime of the last evaluation
    pub fn regime(&self) -> Option<Regime> {
        self.regime
    }

    pub fn trailing_stop(&self) -> Option<&TrailingStop> {
        self.trailing.as_ref()
    }

    pub fn spawn(self, events: UnboundedReceiver<MarketEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    /// Consume events until the route is dropped
    pub async fn run(mut self, mut events: UnboundedReceiver<MarketEvent>) {
        info!("{} pipeline started", self.symbol);
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        info!("{} pipeline stopped", self.symbol);
    }

    /// Process one event. Returns the sizing decision when an evaluation ran.
    pub async fn handle(&mut self, event: MarketEvent) -> Option<PositionSizingDecision> {
        if let Some(paper) = &self.ctx.paper {
            paper.observe(&event);
        }
        let snapshot = self.detector.update(&event)?;

        if let MarketEvent::Trade(tick) = &event {
            self.protect(tick.price, &snapshot).await;
        }

        let interval = self.ctx.config.execution.evaluation_interval_ms;
        if let Some(last) = self.last_evaluation {
            if snapshot.timestamp < last.saturating_add(interval) {
                return None;
            }
        }
        self.last_evaluation = Some(snapshot.timestamp);
        self.evaluate(&snapshot).await
    }

    async fn evaluate(&mut self, snapshot: &MicrostructureSnapshot) -> Option<PositionSizingDecision> {
        let factor = match self.ctx.volatility.get_volatility_factor(&self.symbol).await {
            Ok(v) => v,
            Err(e) => {
                warn!("{} evaluation skipped: {}", self.symbol, e);
                return None;
            }
        };
        let inputs = RegimeInputs::from_snapshot(snapshot, factor);
        let regime = self.classifier.classify(&inputs);
        if self.regime != Some(regime) {
            info!("{} regime -> {} (v={:.3})", self.symbol, regime, factor);
            self.regime = Some(regime);
        }
        let bias = self.classifier.bias(regime, &inputs);

        let signal = match self.ctx.signals.get_signal(&self.symbol).await {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!("{}: {}", self.symbol, e);
                None
            }
        };
        let equity = match self.ctx.exchange.get_equity().await {
            Ok(equity) => Some(equity),
            Err(e) => {
                warn!("{} equity unavailable: {}", self.symbol, e);
                None
            }
        };

        let coordinator = &self.ctx.coordinator;
        let current_leverage = coordinator
            .instrument(&self.symbol)
            .map_or(self.leverage.default_leverage(), |i| i.leverage);
        let position = coordinator.position(&self.symbol);
        let leverage = self.leverage.evaluate(
            current_leverage,
            position.as_ref(),
            regime,
            snapshot.reference_price(),
        );

        let now = Utc::now();
        let request = SizingRequest {
            symbol: self.symbol.clone(),
            signal,
            regime,
            bias,
            spoof_suspected: snapshot.spoof_suspected,
            equity,
            volatility: snapshot.realized_volatility,
            recent_volume: snapshot.recent_volume,
            reference_volume: snapshot.reference_volume,
            reference_price: snapshot.reference_price(),
            atr: snapshot.atr,
            leverage,
            breaker: coordinator.breaker().snapshot(now).await,
            now,
        };
        let decision = self.sizing.size(&request);

        // Leverage follows the position and regime even when nothing is submitted
        coordinator.apply_leverage(&self.symbol, leverage).await;
        match coordinator.execute(decision.clone()).await {
            Ok(CycleResult::Skipped(reason)) => debug!("{} cycle skipped: {:?}", self.symbol, reason),
            Ok(result) => {
                debug!("{} cycle: {:?}", self.symbol, result);
                self.sync_trailing(snapshot.atr, snapshot.reference_price());
            }
            Err(ExecutionError::CycleInFlight(_)) => {
                debug!("{} decision dropped: cycle in flight", self.symbol)
            }
            Err(e) => warn!("{} execution failed: {}", self.symbol, e),
        }
        Some(decision)
    }

    /// Keep the trailing stop in step with the coordinator's position, ratchet
    /// it on the latest trade and close the position when it or the
    /// take-profit is hit.
    async fn protect(&mut self, price: Price, snapshot: &MicrostructureSnapshot) {
        self.sync_trailing(snapshot.atr, Some(price));
        let regime = self.regime.unwrap_or(Regime::Range);

        let Some(stop) = self.trailing.as_mut() else {
            return;
        };
        let reason = if stop.is_stop_triggered(price) {
            format!("stop {} hit at {}", stop.stop, price)
        } else if stop.is_take_profit_hit(price) {
            format!("take profit {} hit at {}", stop.take_profit, price)
        } else {
            let before = stop.stop;
            let after = self.stops.trail(stop, regime, price, snapshot.atr);
            if after != before {
                debug!("{} trailing stop {} -> {}", self.symbol, before, after);
            }
            return;
        };

        match self.ctx.coordinator.close_position(&self.symbol, Some(price), &reason).await {
            Ok(CycleResult::Settled { outcome, .. }) => {
                info!("{} protective exit settled: {:?}", self.symbol, outcome);
                self.trailing = None;
            }
            Ok(other) => debug!("{} protective exit: {:?}", self.symbol, other),
            Err(ExecutionError::CycleInFlight(_)) => {
                debug!("{} protective exit waiting on open cycle", self.symbol)
            }
            Err(e) => warn!("{} protective exit failed: {}", self.symbol, e),
        }
    }

    fn sync_trailing(&mut self, atr: Option<Price>, fallback_entry: Option<Price>) {
        let position = self.ctx.coordinator.position(&self.symbol);
        match (&position, &self.trailing) {
            (None, Some(_)) => self.trailing = None,
            (Some(p), Some(t)) if p.side == t.side && p.entry_price == t.entry => {}
            (Some(p), _) => {
                let entry = if p.entry_price.is_zero() {
                    fallback_entry.unwrap_or(p.entry_price)
                } else {
                    p.entry_price
                };
                let regime = self.regime.unwrap_or(Regime::Range);
                let stop = self.stops.open(regime, p.side, entry, atr);
                info!(
                    "{} {:?} protected: stop {} take profit {}",
                    self.symbol, p.side, stop.stop, stop.take_profit
                );
                self.trailing = Some(stop);
            }
            (None, None) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::mock::{
        MockExchange, MockSignalProvider, MockVolatilityProvider, RecordingNotifier,
    };
    use crate::core::events::{Direction, OrderBookLevel, OrderBookSnapshot, Signal, TradeTick};
    use crate::providers::NullAuditSink;
    use crate::risk::CircuitBreaker;
    use crate::types::{PositionSide, Size};
    use rust_decimal::Decimal;

    struct Harness {
        pipeline: InstrumentPipeline,
        exchange: Arc<MockExchange>,
        signals: Arc<MockSignalProvider>,
        volatility: Arc<MockVolatilityProvider>,
        coordinator: Arc<ExecutionCoordinator>,
    }

    fn harness() -> Harness {
        let config = Arc::new(EngineConfig::default());
        let exchange = Arc::new(MockExchange::new(
            Decimal::new(100_000, 0),
            Price::parse("100").unwrap(),
        ));
        let signals = Arc::new(MockSignalProvider::new());
        let volatility = Arc::new(MockVolatilityProvider::new());
        let coordinator = Arc::new(ExecutionCoordinator::new(
            config.execution.clone(),
            exchange.clone(),
            Arc::new(RecordingNotifier::new()),
            Arc::new(NullAuditSink),
            CircuitBreaker::from_config(&config.breaker),
            config.leverage.default,
        ));
        let ctx = PipelineContext {
            config,
            signals: signals.clone(),
            volatility: volatility.clone(),
            exchange: exchange.clone(),
            coordinator: coordinator.clone(),
            paper: None,
        };
        Harness {
            pipeline: InstrumentPipeline::new(Symbol::new("BTCUSDT"), ctx),
            exchange,
            signals,
            volatility,
            coordinator,
        }
    }

    fn book(ts: Timestamp) -> MarketEvent {
        let level = |p: i64, s: i64| OrderBookLevel::new(Price::new(p.into()), Size::new(s.into()));
        MarketEvent::Depth(OrderBookSnapshot::new(
            "BTCUSDT",
            vec![level(99, 30), level(98, 20)],
            vec![level(101, 10), level(102, 10)],
            ts,
        ))
    }

    fn trade(price: i64, ts: Timestamp) -> MarketEvent {
        MarketEvent::Trade(TradeTick::from_buyer_maker(
            "BTCUSDT",
            Price::new(price.into()),
            Size::new(Decimal::ONE),
            false,
            ts,
        ))
    }

    #[tokio::test]
    async fn test_no_volatility_factor_skips_evaluation() {
        let mut h = harness();
        assert!(h.pipeline.handle(book(1_000)).await.is_none());
        assert!(h.pipeline.regime().is_none());
    }

    #[tokio::test]
    async fn test_missing_signal_sizes_flat() {
        let mut h = harness();
        h.volatility.set_factor(&Symbol::new("BTCUSDT"), 1.0);
        let decision = h.pipeline.handle(book(1_000)).await.unwrap();
        assert_eq!(decision.direction, Direction::Flat);
        assert_eq!(h.pipeline.regime(), Some(Regime::Range));
        assert!(h.exchange.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_bullish_signal_opens_and_protects_position() {
        let mut h = harness();
        let symbol = Symbol::new("BTCUSDT");
        h.volatility.set_factor(&symbol, 2.0);
        h.signals.set_signal(&symbol, Signal::new(Direction::Long, 0.6));

        h.pipeline.handle(trade(100, 500)).await;
        let decision = h.pipeline.handle(book(1_000)).await;
        // Trade at 500 ran the first evaluation; the book at 1000 is within the interval
        assert!(decision.is_none());

        let decision = h.pipeline.handle(book(1_600)).await.unwrap();
        assert_eq!(decision.direction, Direction::Long);
        assert!(decision.notional_fraction <= 0.10);

        let position = h.coordinator.position(&symbol).unwrap();
        assert_eq!(position.side, PositionSide::Long);
        let stop = h.pipeline.trailing_stop().unwrap();
        assert!(stop.stop < Price::parse("100").unwrap());
        assert!(stop.take_profit > Price::parse("100").unwrap());
    }

    #[tokio::test]
    async fn test_stop_hit_closes_position() {
        let mut h = harness();
        let symbol = Symbol::new("BTCUSDT");
        h.volatility.set_factor(&symbol, 2.0);
        h.signals.set_signal(&symbol, Signal::new(Direction::Long, 0.6));

        h.pipeline.handle(trade(100, 500)).await;
        assert!(h.coordinator.position(&symbol).is_some());
        let stop = h.pipeline.trailing_stop().unwrap().stop;

        h.signals.clear_signal(&symbol);
        h.exchange.set_fill_price(Price::parse("80").unwrap()).await;
        h.pipeline.handle(trade(80, 700)).await;

        assert!(stop > Price::parse("80").unwrap());
        assert!(h.coordinator.position(&symbol).is_none());
        assert!(h.pipeline.trailing_stop().is_none());
        let orders = h.exchange.orders().await;
        assert_eq!(orders.len(), 2);
        assert!(orders[1].reduce_only);
        assert_eq!(
            h.coordinator.breaker().snapshot(Utc::now()).await.consecutive_losses,
            1
        );
    }

    #[tokio::test]
    async fn test_adverse_move_steps_leverage_down_without_signal() {
        let mut h = harness();
        let symbol = Symbol::new("BTCUSDT");
        h.volatility.set_factor(&symbol, 2.0);
        h.signals.set_signal(&symbol, Signal::new(Direction::Long, 0.6));

        h.pipeline.handle(trade(100, 500)).await;
        assert_eq!(h.coordinator.position(&symbol).unwrap().side, PositionSide::Long);
        assert!(h.exchange.leverage_calls().await.is_empty());

        h.signals.clear_signal(&symbol);
        let decision = h.pipeline.handle(trade(97, 1_600)).await.unwrap();
        assert_eq!(decision.direction, Direction::Flat);
        assert_eq!(decision.leverage, 3);

        assert_eq!(h.exchange.leverage_calls().await, vec![(symbol.clone(), 3)]);
        assert_eq!(h.coordinator.instrument(&symbol).unwrap().leverage, 3);
        assert_eq!(h.coordinator.position(&symbol).unwrap().side, PositionSide::Long);
        assert_eq!(h.exchange.orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_strong_bearish_regime_vetoes_long() {
        let mut h = harness();
        let symbol = Symbol::new("BTCUSDT");
        h.volatility.set_factor(&symbol, 0.3);
        h.signals.set_signal(&symbol, Signal::new(Direction::Long, 0.9));

        let decision = h.pipeline.handle(trade(100, 500)).await.unwrap();
        assert_eq!(h.pipeline.regime(), Some(Regime::StrongBearish));
        assert_eq!(decision.direction, Direction::Flat);
        assert!(h.exchange.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_when_route_dropped() {
        let h = harness();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = h.pipeline.spawn(rx);
        tx.send(book(1_000)).unwrap();
        drop(tx);
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
