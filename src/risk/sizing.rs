use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SizingConfig;
use crate::core::events::{Direction, Signal};
use crate::regime::{MicrostructureBias, Regime};
use crate::risk::circuit_breaker::CircuitBreakerState;
use crate::risk::stops::StopController;
use crate::types::{PositionSide, Price, Symbol};

/// Bounded order intent for one instrument. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSizingDecision {
    pub id: Uuid,
    pub symbol: Symbol,
    pub direction: Direction,
    /// Fraction of equity to commit, in [0, max_notional_fraction]
    pub notional_fraction: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub leverage: u32,
    pub confidence: f64,
    pub regime: Regime,
    pub reference_price: Option<Price>,
    pub timestamp: DateTime<Utc>,
}

impl PositionSizingDecision {
    pub fn is_flat(&self) -> bool {
        self.direction == Direction::Flat
    }
}

/// Everything the sizing engine looks at for one evaluation
#[derive(Debug, Clone)]
pub struct SizingRequest {
    pub symbol: Symbol,
    pub signal: Option<Signal>,
    pub regime: Regime,
    pub bias: MicrostructureBias,
    pub spoof_suspected: bool,
    pub equity: Option<Decimal>,
    /// Realised per-bar volatility of the instrument
    pub volatility: Option<f64>,
    pub recent_volume: Option<Decimal>,
    pub reference_volume: Option<Decimal>,
    pub reference_price: Option<Price>,
    pub atr: Option<Price>,
    pub leverage: u32,
    pub breaker: CircuitBreakerState,
    pub now: DateTime<Utc>,
}

/// Turns signal, regime and liquidity into a capped fraction of equity.
/// Deterministic for a given request apart from the decision id.
#[derive(Debug, Clone)]
pub struct RiskSizingEngine {
    config: SizingConfig,
    stops: StopController,
}

impl RiskSizingEngine {
    pub fn new(config: SizingConfig, stops: StopController) -> Self {
        Self { config, stops }
    }

    /// Kelly fraction `w - (1 - w) / r`, clamped to [0, kelly_cap]
    pub fn kelly_fraction(&self, win_rate: f64) -> f64 {
        let rr = self.config.risk_reward_ratio;
        let f = win_rate - (1.0 - win_rate) / rr;
        if f.is_finite() {
            f.clamp(0.0, self.config.kelly_cap)
        } else {
            0.0
        }
    }

    /// Regime multiplier for a trade in `direction`
    pub fn regime_multiplier(&self, regime: Regime, direction: Direction) -> f64 {
        if regime.is_aligned_with(direction) {
            if regime.is_strong() {
                self.config.strong_multiplier
            } else {
                self.config.weak_multiplier
            }
        } else {
            self.config.range_multiplier
        }
    }

    /// No Long in StrongBearish, no Short in StrongBullish
    pub fn is_vetoed(regime: Regime, direction: Direction) -> bool {
        matches!(
            (regime, direction),
            (Regime::StrongBearish, Direction::Long) | (Regime::StrongBullish, Direction::Short)
        )
    }

    fn weight(&self, numerator: f64, denominator: f64) -> f64 {
        if !(numerator.is_finite() && denominator.is_finite()) || denominator <= 0.0 {
            return 1.0;
        }
        (numerator / denominator).clamp(self.config.weight_floor, self.config.weight_ceiling)
    }

    pub fn liquidity_weight(&self, recent: Option<Decimal>, reference: Option<Decimal>) -> f64 {
        match (recent.and_then(|r| r.to_f64()), reference.and_then(|r| r.to_f64())) {
            (Some(recent), Some(reference)) => self.weight(recent, reference),
            _ => 1.0,
        }
    }

    pub fn volatility_weight(&self, volatility: Option<f64>) -> f64 {
        match volatility {
            Some(vol) if vol > 0.0 => self.weight(self.config.target_volatility, vol),
            _ => 1.0,
        }
    }

    pub fn size(&self, request: &SizingRequest) -> PositionSizingDecision {
        let symbol = &request.symbol;

        if request.breaker.is_halted(request.now) {
            info!("{} sizing skipped: circuit breaker halted", symbol);
            return self.flat(request, 0.0);
        }
        let Some(signal) = request.signal else {
            warn!("{} sizing skipped: no signal", symbol);
            return self.flat(request, 0.0);
        };
        if !signal.is_valid() || signal.direction == Direction::Flat {
            debug!("{} sizing: flat or invalid signal {:?}", symbol, signal);
            return self.flat(request, signal.confidence);
        }
        match request.equity {
            Some(equity) if equity > Decimal::ZERO => {}
            _ => {
                warn!("{} sizing skipped: equity unavailable", symbol);
                return self.flat(request, signal.confidence);
            }
        }

        let direction = signal.direction;
        if Self::is_vetoed(request.regime, direction) {
            info!(
                "{} {:?} vetoed in {} regime",
                symbol, direction, request.regime
            );
            return self.flat(request, signal.confidence);
        }

        let mut fraction = self.kelly_fraction(signal.confidence);
        fraction *= self.regime_multiplier(request.regime, direction);
        fraction *= self.liquidity_weight(request.recent_volume, request.reference_volume);
        fraction *= self.volatility_weight(request.volatility);

        if request.spoof_suspected {
            fraction *= self.config.spoof_damping;
        }
        if request.regime.is_weak() && !request.bias.confirms(direction) {
            fraction *= self.config.unconfirmed_damping;
        }

        let fraction = self.round(fraction.clamp(0.0, self.config.max_notional_fraction));
        if fraction <= 0.0 {
            debug!("{} sizing: zero Kelly fraction", symbol);
            return self.flat(request, signal.confidence);
        }

        let (stop_loss_pct, take_profit_pct) = match (
            PositionSide::from_direction(direction),
            request.reference_price,
        ) {
            (Some(side), Some(price)) => {
                self.stops
                    .protective_pcts(request.regime, side, price, request.atr)
            }
            _ => {
                let stop = self.stops.fallback_stop_pct(request.regime);
                (stop, stop * self.config.risk_reward_ratio)
            }
        };

        PositionSizingDecision {
            id: Uuid::new_v4(),
            symbol: symbol.clone(),
            direction,
            notional_fraction: fraction,
            stop_loss_pct: self.round(stop_loss_pct),
            take_profit_pct: self.round(take_profit_pct),
            leverage: request.leverage,
            confidence: self.round(signal.confidence),
            regime: request.regime,
            reference_price: request.reference_price,
            timestamp: request.now,
        }
    }

    fn flat(&self, request: &SizingRequest, confidence: f64) -> PositionSizingDecision {
        PositionSizingDecision {
            id: Uuid::new_v4(),
            symbol: request.symbol.clone(),
            direction: Direction::Flat,
            notional_fraction: 0.0,
            stop_loss_pct: 0.0,
            take_profit_pct: 0.0,
            leverage: request.leverage,
            confidence: self.round(confidence),
            regime: request.regime,
            reference_price: request.reference_price,
            timestamp: request.now,
        }
    }

    fn round(&self, value: f64) -> f64 {
        Decimal::from_f64(value)
            .map(|d| d.round_dp(self.config.decision_precision))
            .and_then(|d| d.to_f64())
            .unwrap_or(0.0)
    }
}
