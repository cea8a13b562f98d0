use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::BreakerConfig;
use crate::core::events::TradeOutcome;

/// Loss streak and halt deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub consecutive_losses: u32,
    pub halted_until: Option<DateTime<Utc>>,
}

impl CircuitBreakerState {
    pub fn is_halted(&self, now: DateTime<Utc>) -> bool {
        self.halted_until.map_or(false, |until| now < until)
    }
}

/// Process-wide consecutive-loss breaker.
///
/// Armed -> Halted when the loss streak reaches the threshold; Halted -> Armed
/// once the cool-down has elapsed, with the streak cleared. Clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<Mutex<CircuitBreakerState>>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: std::time::Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CircuitBreakerState::default())),
            threshold: threshold.max(1),
            cooldown: Duration::from_std(cooldown).unwrap_or_else(|_| Duration::seconds(60)),
        }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(config.loss_threshold, config.cooldown())
    }

    /// Count a closed trade. A loss extends the streak, anything else resets it.
    pub async fn record_outcome(
        &self,
        outcome: &TradeOutcome,
        now: DateTime<Utc>,
    ) -> CircuitBreakerState {
        let mut state = self.state.lock().await;
        Self::rearm_if_expired(&mut state, now);

        if !outcome.is_loss() {
            if state.consecutive_losses > 0 {
                info!(
                    "Loss streak reset by {} (pnl {})",
                    outcome.symbol, outcome.realized_pnl
                );
            }
            state.consecutive_losses = 0;
            return *state;
        }

        state.consecutive_losses += 1;
        info!(
            "Loss on {} (pnl {}), streak {}/{}",
            outcome.symbol, outcome.realized_pnl, state.consecutive_losses, self.threshold
        );

        if state.consecutive_losses >= self.threshold && !state.is_halted(now) {
            let until = now + self.cooldown;
            state.halted_until = Some(until);
            warn!(
                "Circuit breaker halted after {} consecutive losses until {}",
                state.consecutive_losses, until
            );
        }
        *state
    }

    /// Current state, re-arming first if the cool-down has passed
    pub async fn snapshot(&self, now: DateTime<Utc>) -> CircuitBreakerState {
        let mut state = self.state.lock().await;
        Self::rearm_if_expired(&mut state, now);
        *state
    }

    pub async fn is_halted(&self, now: DateTime<Utc>) -> bool {
        self.snapshot(now).await.is_halted(now)
    }

    pub async fn reset(&self) {
        *self.state.lock().await = CircuitBreakerState::default();
    }

    fn rearm_if_expired(state: &mut CircuitBreakerState, now: DateTime<Utc>) {
        if let Some(until) = state.halted_until {
            if now >= until {
                info!("Circuit breaker re-armed");
                *state = CircuitBreakerState::default();
            }
        }
    }
}
