use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{info, warn};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::connectors::DryRunExchange;
use crate::error::{ConfigError, FeedError};
use crate::execution::{ExecutionCoordinator, ExecutionMode};
use crate::feed::{Connector, FeedMultiplexer, RouteFactory, WebSocketConnector};
use crate::pipeline::{InstrumentPipeline, PipelineContext};
use crate::providers::{AuditSink, ExchangeClient, Notifier, SignalProvider, VolatilityProvider};
use crate::risk::CircuitBreaker;
use crate::types::Symbol;

const PIPELINE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// External collaborators the engine trades through
#[derive(Clone)]
pub struct Collaborators {
    pub signals: Arc<dyn SignalProvider>,
    pub volatility: Arc<dyn VolatilityProvider>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub notifier: Arc<dyn Notifier>,
    pub audit: Arc<dyn AuditSink>,
}

/// Feed multiplexer, per-instrument pipelines and the shared coordinator
pub struct TradingEngine {
    config: Arc<EngineConfig>,
    coordinator: Arc<ExecutionCoordinator>,
    multiplexer: FeedMultiplexer,
    pipelines: Arc<DashMap<Symbol, JoinHandle<()>>>,
    paper: Option<Arc<DryRunExchange>>,
}

impl TradingEngine {
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        collaborators: Collaborators,
    ) -> Result<Self, ConfigError> {
        Self::build(config, connector, collaborators, None)
    }

    /// Engine streaming over WebSocket, with the connect timeout taken from
    /// `config.feed`
    pub fn with_websocket(config: EngineConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        let connector = Arc::new(WebSocketConnector::from(&config.feed));
        Self::new(config, connector, collaborators)
    }

    /// Engine trading against an in-process paper account whose marks follow
    /// the live feed.
    pub fn paper(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        signals: Arc<dyn SignalProvider>,
        volatility: Arc<dyn VolatilityProvider>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
        starting_equity: Decimal,
    ) -> Result<Self, ConfigError> {
        let paper = Arc::new(DryRunExchange::new(starting_equity, config.leverage.max));
        let collaborators = Collaborators {
            signals,
            volatility,
            exchange: paper.clone(),
            notifier,
            audit,
        };
        Self::build(config, connector, collaborators, Some(paper))
    }

    fn build(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        collaborators: Collaborators,
        paper: Option<Arc<DryRunExchange>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        let coordinator = Arc::new(ExecutionCoordinator::new(
            config.execution.clone(),
            collaborators.exchange.clone(),
            collaborators.notifier.clone(),
            collaborators.audit.clone(),
            CircuitBreaker::from_config(&config.breaker),
            config.leverage.default,
        ));

        let ctx = PipelineContext {
            config: config.clone(),
            signals: collaborators.signals,
            volatility: collaborators.volatility,
            exchange: collaborators.exchange,
            coordinator: coordinator.clone(),
            paper: paper.clone(),
        };
        let pipelines = Arc::new(DashMap::new());
        let factory = pipeline_factory(ctx, pipelines.clone());
        let multiplexer = FeedMultiplexer::new(
            config.feed.clone(),
            config.feed.depth_levels,
            connector,
            factory,
        );

        Ok(Self {
            config,
            coordinator,
            multiplexer,
            pipelines,
            paper,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        &self.coordinator
    }

    /// Paper account, when built with [`TradingEngine::paper`]
    pub fn paper_account(&self) -> Option<&Arc<DryRunExchange>> {
        self.paper.as_ref()
    }

    pub fn multiplexer(&self) -> &FeedMultiplexer {
        &self.multiplexer
    }

    pub fn subscriptions(&self) -> Vec<Symbol> {
        self.multiplexer.subscriptions()
    }

    pub async fn set_mode(&self, mode: ExecutionMode) {
        self.coordinator.set_mode(mode).await;
    }

    /// Adopt exchange positions, then subscribe every symbol
    pub async fn start(&self, symbols: &[Symbol]) -> Result<(), FeedError> {
        for symbol in symbols {
            self.coordinator.ensure_instrument(symbol);
        }
        if let Err(e) = self.coordinator.sync_positions().await {
            warn!("Starting without exchange positions: {}", e);
        }
        for symbol in symbols {
            self.multiplexer.subscribe(symbol)?;
        }
        info!(
            "Engine started on {} instruments ({} mode)",
            symbols.len(),
            self.coordinator.mode().await
        );
        Ok(())
    }

    /// Switch the traded set without disturbing instruments kept in it
    pub async fn rotate(&self, symbols: &[Symbol]) -> Result<(), FeedError> {
        for symbol in symbols {
            self.coordinator.ensure_instrument(symbol);
        }
        self.multiplexer.rotate(symbols).await?;
        let active = self.multiplexer.subscriptions();
        let dropped: Vec<Symbol> = self
            .pipelines
            .iter()
            .map(|e| e.key().clone())
            .filter(|s| !active.contains(s))
            .collect();
        for symbol in dropped {
            self.drain(&symbol).await;
        }
        Ok(())
    }

    /// Close every stream and wait for the pipelines to finish
    pub async fn shutdown(&self) {
        self.multiplexer.shutdown().await;
        let symbols: Vec<Symbol> = self.pipelines.iter().map(|e| e.key().clone()).collect();
        for symbol in symbols {
            self.drain(&symbol).await;
        }
        info!("Engine stopped");
    }

    async fn drain(&self, symbol: &Symbol) {
        let Some((_, handle)) = self.pipelines.remove(symbol) else {
            return;
        };
        match tokio::time::timeout(PIPELINE_DRAIN_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} pipeline ended abnormally: {}", symbol, e),
            Err(_) => warn!("{} pipeline did not drain in time", symbol),
        }
    }
}

/// Route factory spawning one pipeline per newly subscribed instrument
fn pipeline_factory(
    ctx: PipelineContext,
    pipelines: Arc<DashMap<Symbol, JoinHandle<()>>>,
) -> RouteFactory {
    Arc::new(move |symbol: &Symbol| {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = InstrumentPipeline::new(symbol.clone(), ctx.clone()).spawn(rx);
        if let Some(previous) = pipelines.insert(symbol.clone(), handle) {
            previous.abort();
        }
        tx
    })
}
