//! Paper trading account: market orders fill at the last seen price and
//! nothing leaves the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{info, warn};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::core::events::{MarketEvent, OrderAck, OrderRequest, OrderStatus, OrderType};
use crate::error::ExchangeError;
use crate::providers::ExchangeClient;
use crate::types::{Position, Price, Symbol};

#[derive(Debug, Default)]
struct Account {
    equity: Decimal,
    positions: HashMap<Symbol, Position>,
    fills: Vec<(OrderRequest, OrderAck)>,
}

/// Simulated exchange account
#[derive(Debug)]
pub struct DryRunExchange {
    account: Mutex<Account>,
    marks: DashMap<Symbol, Price>,
    leverage: DashMap<Symbol, u32>,
    max_leverage: u32,
    order_counter: AtomicU64,
    rejections: AtomicU32,
}

impl DryRunExchange {
    pub fn new(starting_equity: Decimal, max_leverage: u32) -> Self {
        Self {
            account: Mutex::new(Account {
                equity: starting_equity,
                ..Account::default()
            }),
            marks: DashMap::new(),
            leverage: DashMap::new(),
            max_leverage,
            order_counter: AtomicU64::new(1),
            rejections: AtomicU32::new(0),
        }
    }

    /// Record the latest traded or mid price used for fills
    pub fn update_price(&self, symbol: &Symbol, price: Price) {
        self.marks.insert(symbol.clone(), price);
    }

    /// Feed a market event into the mark table
    pub fn observe(&self, event: &MarketEvent) {
        match event {
            MarketEvent::Trade(tick) => self.update_price(&tick.symbol, tick.price),
            MarketEvent::Depth(book) => {
                if let Some(mid) = book.mid_price() {
                    self.update_price(&book.symbol, mid);
                }
            }
        }
    }

    /// Reject the next `n` orders
    pub fn reject_next(&self, n: u32) {
        self.rejections.store(n, Ordering::SeqCst);
    }

    pub fn leverage(&self, symbol: &Symbol) -> Option<u32> {
        self.leverage.get(symbol).map(|l| *l)
    }

    pub async fn fill_count(&self) -> usize {
        self.account.lock().await.fills.len()
    }
}

#[async_trait]
impl ExchangeClient for DryRunExchange {
    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, ExchangeError> {
        if order.order_type != OrderType::Market {
            return Err(ExchangeError::Rejected(
                "paper account only fills market orders".to_string(),
            ));
        }
        if order.quantity.is_zero() || order.quantity.is_negative() {
            return Err(ExchangeError::Rejected(format!(
                "invalid quantity {}",
                order.quantity
            )));
        }
        let rejecting = self
            .rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejecting {
            warn!("Paper order for {} rejected by script", order.symbol);
            return Err(ExchangeError::Rejected("scripted rejection".to_string()));
        }

        let price = self
            .marks
            .get(&order.symbol)
            .map(|p| *p)
            .ok_or_else(|| ExchangeError::Rejected(format!("no price for {}", order.symbol)))?;

        let mut account = self.account.lock().await;
        let existing = account.positions.get(&order.symbol).cloned();
        if order.reduce_only
            && existing
                .as_ref()
                .map_or(true, |p| p.side.closing_order_side() != order.side)
        {
            return Err(ExchangeError::Rejected(format!(
                "reduce-only {:?} would increase {} exposure",
                order.side, order.symbol
            )));
        }

        let quantity = match (&existing, order.reduce_only) {
            (Some(position), true) => order.quantity.min(position.size),
            _ => order.quantity,
        };
        let effect = Position::apply_fill(existing.as_ref(), &order.symbol, order.side, quantity, price);
        if let Some(pnl) = effect.realized_pnl {
            account.equity += pnl;
        }
        match effect.position {
            Some(position) => {
                account.positions.insert(order.symbol.clone(), position);
            }
            None => {
                account.positions.remove(&order.symbol);
            }
        }

        let ack = OrderAck {
            order_id: format!("dry_run_{}", self.order_counter.fetch_add(1, Ordering::SeqCst)),
            status: OrderStatus::Filled,
            filled_quantity: quantity,
            average_price: Some(price),
        };
        info!(
            "[dry-run] {} {:?} {} @ {} -> {} (equity {})",
            order.symbol, order.side, quantity, price, ack.order_id, account.equity
        );
        account.fills.push((order, ack.clone()));
        Ok(ack)
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let account = self.account.lock().await;
        let mut positions: Vec<Position> = account.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), ExchangeError> {
        if leverage == 0 || leverage > self.max_leverage {
            return Err(ExchangeError::InvalidLeverage(leverage));
        }
        self.leverage.insert(symbol.clone(), leverage);
        info!("[dry-run] {} leverage {}x", symbol, leverage);
        Ok(())
    }

    async fn get_equity(&self) -> Result<Decimal, ExchangeError> {
        Ok(self.account.lock().await.equity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::OrderSide;
    use crate::types::{PositionSide, Size};

    fn order(side: OrderSide, qty: &str, reduce_only: bool) -> OrderRequest {
        OrderRequest {
            symbol: Symbol::new("BTCUSDT"),
            side,
            quantity: Size::parse(qty).unwrap(),
            order_type: OrderType::Market,
            reduce_only,
            client_order_id: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_rejects_without_price() {
        let exchange = DryRunExchange::new(Decimal::new(1_000, 0), 10);
        let err = exchange
            .place_order(order(OrderSide::Buy, "1", false))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_round_trip_updates_equity() {
        let exchange = DryRunExchange::new(Decimal::new(1_000, 0), 10);
        let symbol = Symbol::new("BTCUSDT");
        exchange.update_price(&symbol, Price::parse("100").unwrap());

        let ack = exchange.place_order(order(OrderSide::Buy, "2", false)).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.order_id, "dry_run_1");
        let positions = exchange.get_positions().await.unwrap();
        assert_eq!(positions[0].side, PositionSide::Long);

        exchange.update_price(&symbol, Price::parse("90").unwrap());
        exchange.place_order(order(OrderSide::Sell, "2", true)).await.unwrap();
        assert!(exchange.get_positions().await.unwrap().is_empty());
        assert_eq!(exchange.get_equity().await.unwrap(), Decimal::new(980, 0));
        assert_eq!(exchange.fill_count().await, 2);
    }

    #[tokio::test]
    async fn test_reduce_only_cannot_open() {
        let exchange = DryRunExchange::new(Decimal::new(1_000, 0), 10);
        exchange.update_price(&Symbol::new("BTCUSDT"), Price::parse("100").unwrap());
        assert!(exchange
            .place_order(order(OrderSide::Sell, "1", true))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_scripted_rejections_and_leverage_bounds() {
        let exchange = DryRunExchange::new(Decimal::new(1_000, 0), 10);
        let symbol = Symbol::new("BTCUSDT");
        exchange.update_price(&symbol, Price::parse("100").unwrap());
        exchange.reject_next(1);
        assert!(exchange.place_order(order(OrderSide::Buy, "1", false)).await.is_err());
        assert!(exchange.place_order(order(OrderSide::Buy, "1", false)).await.is_ok());

        assert!(matches!(
            exchange.set_leverage(&symbol, 20).await,
            Err(ExchangeError::InvalidLeverage(20))
        ));
        exchange.set_leverage(&symbol, 3).await.unwrap();
        assert_eq!(exchange.leverage(&symbol), Some(3));
    }
}
