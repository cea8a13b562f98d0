use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedSender;

use crate::config::FeedConfig;
use crate::connectors::binance;
use crate::core::events::{MarketEvent, Timestamp};
use crate::error::FeedError;
use crate::feed::connection::{ConnectionStatus, StreamConfig, StreamConnection, StreamMessage};
use crate::feed::transport::Connector;
use crate::feed::Topic;
use crate::types::Symbol;

/// Creates the inbound queue of a fresh instrument pipeline.
///
/// Dropping the returned sender must be enough for the pipeline to wind down.
pub type RouteFactory = Arc<dyn Fn(&Symbol) -> UnboundedSender<MarketEvent> + Send + Sync>;

struct InstrumentFeed {
    depth: StreamConnection,
    trade: StreamConnection,
}

/// Owns the depth and trade connections of every subscribed instrument and
/// routes decoded events to that instrument's pipeline.
///
/// Each connection runs on its own task, so a failing instrument never stalls
/// the others.
pub struct FeedMultiplexer {
    config: FeedConfig,
    /// Levels kept per side after decoding
    book_depth: usize,
    connector: Arc<dyn Connector>,
    factory: RouteFactory,
    routes: Arc<DashMap<Symbol, UnboundedSender<MarketEvent>>>,
    feeds: DashMap<Symbol, InstrumentFeed>,
}

impl FeedMultiplexer {
    pub fn new(
        config: FeedConfig,
        book_depth: usize,
        connector: Arc<dyn Connector>,
        factory: RouteFactory,
    ) -> Self {
        Self {
            config,
            book_depth,
            connector,
            factory,
            routes: Arc::new(DashMap::new()),
            feeds: DashMap::new(),
        }
    }

    /// Open both topics for `symbol`. Returns false if already subscribed.
    pub fn subscribe(&self, symbol: &Symbol) -> Result<bool, FeedError> {
        if !symbol.is_valid() {
            return Err(FeedError::UnknownInstrument(symbol.clone()));
        }
        if self.feeds.contains_key(symbol) {
            return Ok(false);
        }

        self.routes.insert(symbol.clone(), (self.factory)(symbol));
        let feed = InstrumentFeed {
            depth: self.open_topic(symbol, Topic::Depth),
            trade: self.open_topic(symbol, Topic::Trade),
        };
        self.feeds.insert(symbol.clone(), feed);
        info!("Subscribed {}", symbol);
        Ok(true)
    }

    /// Close both topics and drop the route, which ends the pipeline.
    /// Returns false if the instrument was not subscribed.
    pub async fn unsubscribe(&self, symbol: &Symbol) -> bool {
        self.routes.remove(symbol);
        match self.feeds.remove(symbol) {
            Some((_, mut feed)) => {
                feed.depth.close().await;
                feed.trade.close().await;
                info!("Unsubscribed {}", symbol);
                true
            }
            None => false,
        }
    }

    /// Converge on `symbols`: open new instruments, tear down dropped ones,
    /// leave the rest untouched.
    pub async fn rotate(&self, symbols: &[Symbol]) -> Result<(), FeedError> {
        let target: HashSet<&Symbol> = symbols.iter().collect();
        let dropped: Vec<Symbol> = self
            .subscriptions()
            .into_iter()
            .filter(|s| !target.contains(s))
            .collect();

        for symbol in symbols {
            self.subscribe(symbol)?;
        }
        for symbol in &dropped {
            self.unsubscribe(symbol).await;
        }
        info!(
            "Rotation complete: {} active, {} dropped",
            self.feeds.len(),
            dropped.len()
        );
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.feeds.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    pub fn is_subscribed(&self, symbol: &Symbol) -> bool {
        self.feeds.contains_key(symbol)
    }

    pub async fn status(&self, symbol: &Symbol, topic: Topic) -> Option<ConnectionStatus> {
        let handle = self.feeds.get(symbol).map(|feed| match topic {
            Topic::Depth => feed.depth.status_handle(),
            Topic::Trade => feed.trade.status_handle(),
        })?;
        let status = *handle.read().await;
        Some(status)
    }

    pub fn reconnect_count(&self, symbol: &Symbol, topic: Topic) -> Option<u64> {
        self.feeds.get(symbol).map(|feed| match topic {
            Topic::Depth => feed.depth.reconnect_count(),
            Topic::Trade => feed.trade.reconnect_count(),
        })
    }

    pub async fn shutdown(&self) {
        for symbol in self.subscriptions() {
            self.unsubscribe(&symbol).await;
        }
    }

    fn open_topic(&self, symbol: &Symbol, topic: Topic) -> StreamConnection {
        let endpoint = binance::endpoint(
            &self.config.ws_base_url,
            symbol,
            topic,
            self.config.depth_levels,
            self.config.depth_update_ms,
        );
        let mut connection = StreamConnection::new(
            endpoint,
            self.connector.clone(),
            StreamConfig::from(&self.config),
        );
        connection.on_message(route_handler(
            symbol.clone(),
            self.book_depth,
            self.routes.clone(),
        ));
        connection.open();
        connection
    }
}

/// Decode, drop out-of-order trades within a connection lifetime, and forward
fn route_handler(
    symbol: Symbol,
    book_depth: usize,
    routes: Arc<DashMap<Symbol, UnboundedSender<MarketEvent>>>,
) -> impl FnMut(StreamMessage) + Send + 'static {
    let mut last_trade: Option<(u64, Timestamp)> = None;

    move |msg: StreamMessage| {
        let event = match binance::decode(&msg.payload, &symbol, book_depth, msg.received_at) {
            Ok(event) => event,
            Err(e) => {
                debug!("Skipping {} message: {}", symbol, e);
                return;
            }
        };

        if let MarketEvent::Trade(tick) = &event {
            if let Some((epoch, ts)) = last_trade {
                if epoch == msg.epoch && tick.timestamp < ts {
                    debug!(
                        "Dropping out-of-order {} trade ({} < {})",
                        symbol, tick.timestamp, ts
                    );
                    return;
                }
            }
            last_trade = Some((msg.epoch, tick.timestamp));
        }

        match routes.get(event.symbol()) {
            Some(route) => {
                if route.send(event).is_err() {
                    warn!("Pipeline for {} has stopped", symbol);
                }
            }
            None => debug!("No route for {}", event.symbol()),
        }
    }
}
