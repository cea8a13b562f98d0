use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::StopConfig;
use crate::regime::Regime;
use crate::types::{PositionSide, Price};

fn dec(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

/// Protective levels of one open position. The stop only ever moves in the
/// position's favour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailingStop {
    pub side: PositionSide,
    pub entry: Price,
    pub stop: Price,
    pub take_profit: Price,
}

impl TrailingStop {
    pub fn is_stop_triggered(&self, price: Price) -> bool {
        match self.side {
            PositionSide::Long => price <= self.stop,
            PositionSide::Short => price >= self.stop,
        }
    }

    pub fn is_take_profit_hit(&self, price: Price) -> bool {
        match self.side {
            PositionSide::Long => price >= self.take_profit,
            PositionSide::Short => price <= self.take_profit,
        }
    }

    /// Either protective level reached
    pub fn is_triggered(&self, price: Price) -> bool {
        self.is_stop_triggered(price) || self.is_take_profit_hit(price)
    }
}

/// ATR-based stop-loss and take-profit placement per regime
#[derive(Debug, Clone)]
pub struct StopController {
    config: StopConfig,
    risk_reward: f64,
}

impl StopController {
    pub fn new(config: StopConfig, risk_reward: f64) -> Self {
        Self {
            config,
            risk_reward,
        }
    }

    /// ATR multiple for the stop: widest for strong aligned trends
    pub fn stop_multiple(&self, regime: Regime, side: PositionSide) -> f64 {
        if regime.is_aligned_with(side.direction()) {
            if regime.is_strong() {
                self.config.strong_stop_atr
            } else {
                self.config.weak_stop_atr
            }
        } else {
            self.config.range_stop_atr
        }
    }

    pub fn take_profit_multiple(&self, regime: Regime, side: PositionSide) -> f64 {
        if regime.is_aligned_with(side.direction()) {
            if regime.is_strong() {
                self.config.strong_take_profit_atr
            } else {
                self.config.weak_take_profit_atr
            }
        } else {
            self.config.range_take_profit_atr
        }
    }

    /// Stop distance used while no ATR is available, as a fraction of price
    pub fn fallback_stop_pct(&self, regime: Regime) -> f64 {
        self.config.fallback_stop_pct[regime.rank()]
    }

    /// Stop and take-profit distances as fractions of `price`
    pub fn protective_pcts(
        &self,
        regime: Regime,
        side: PositionSide,
        price: Price,
        atr: Option<Price>,
    ) -> (f64, f64) {
        match atr.filter(|a| !a.is_zero()).zip((!price.is_zero()).then_some(price)) {
            Some((atr, price)) => {
                let ratio = (atr.value() / price.value()).to_f64().unwrap_or(0.0);
                (
                    ratio * self.stop_multiple(regime, side),
                    ratio * self.take_profit_multiple(regime, side),
                )
            }
            None => {
                let stop = self.fallback_stop_pct(regime);
                (stop, stop * self.risk_reward)
            }
        }
    }

    /// Initial levels for a position opened at `entry`
    pub fn open(&self, regime: Regime, side: PositionSide, entry: Price, atr: Option<Price>) -> TrailingStop {
        let (stop, take_profit) = match atr.filter(|a| !a.is_zero()) {
            Some(atr) => {
                let stop_distance = atr * dec(self.stop_multiple(regime, side));
                let profit_distance = atr * dec(self.take_profit_multiple(regime, side));
                match side {
                    PositionSide::Long => (entry - stop_distance, entry + profit_distance),
                    PositionSide::Short => (entry + stop_distance, entry - profit_distance),
                }
            }
            None => {
                let stop_pct = dec(self.fallback_stop_pct(regime));
                let profit_pct = stop_pct * dec(self.risk_reward);
                match side {
                    PositionSide::Long => (
                        entry * (Decimal::ONE - stop_pct),
                        entry * (Decimal::ONE + profit_pct),
                    ),
                    PositionSide::Short => (
                        entry * (Decimal::ONE + stop_pct),
                        entry * (Decimal::ONE - profit_pct),
                    ),
                }
            }
        };
        TrailingStop {
            side,
            entry,
            stop,
            take_profit,
        }
    }

    /// Ratchet the stop for the latest price and return it.
    ///
    /// The candidate is the regime-scaled distance from entry, tightened to at
    /// most `max_trail_atr` ATRs from the current price. It is adopted only if
    /// it improves on the current stop.
    pub fn trail(
        &self,
        stop: &mut TrailingStop,
        regime: Regime,
        current: Price,
        atr: Option<Price>,
    ) -> Price {
        let candidate = match atr.filter(|a| !a.is_zero()) {
            Some(atr) => {
                let from_entry = atr * dec(self.stop_multiple(regime, stop.side));
                let from_current = atr * dec(self.config.max_trail_atr);
                match stop.side {
                    PositionSide::Long => (stop.entry - from_entry).max(current - from_current),
                    PositionSide::Short => (stop.entry + from_entry).min(current + from_current),
                }
            }
            None => {
                let pct = dec(self.fallback_stop_pct(regime));
                match stop.side {
                    PositionSide::Long => current * (Decimal::ONE - pct),
                    PositionSide::Short => current * (Decimal::ONE + pct),
                }
            }
        };

        stop.stop = match stop.side {
            PositionSide::Long => stop.stop.max(candidate),
            PositionSide::Short => stop.stop.min(candidate),
        };
        stop.stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn px(v: i64) -> Price {
        Price::new(Decimal::from(v))
    }

    fn controller() -> StopController {
        StopController::new(StopConfig::default(), 2.0)
    }

    #[test]
    fn test_multiples_by_regime() {
        let c = controller();
        assert_eq!(c.stop_multiple(Regime::StrongBullish, PositionSide::Long), 4.0);
        assert_eq!(c.stop_multiple(Regime::WeakBullish, PositionSide::Long), 3.0);
        assert_eq!(c.stop_multiple(Regime::Range, PositionSide::Long), 2.0);
        assert_eq!(c.stop_multiple(Regime::StrongBullish, PositionSide::Short), 2.0);
        assert_eq!(c.take_profit_multiple(Regime::StrongBearish, PositionSide::Short), 6.0);
        assert_eq!(c.take_profit_multiple(Regime::Range, PositionSide::Short), 3.0);
    }

    #[test]
    fn test_open_long_with_atr() {
        let stop = controller().open(Regime::StrongBullish, PositionSide::Long, px(1000), Some(px(10)));
        assert_eq!(stop.stop, px(960));
        assert_eq!(stop.take_profit, px(1060));
        assert!(stop.is_stop_triggered(px(960)));
        assert!(stop.is_take_profit_hit(px(1061)));
        assert!(!stop.is_triggered(px(1000)));
    }

    #[test]
    fn test_fallback_without_atr() {
        let c = controller();
        let (stop, tp) = c.protective_pcts(Regime::Range, PositionSide::Short, px(100), None);
        assert_eq!(stop, 0.02);
        assert_eq!(tp, 0.04);
        assert_eq!(c.fallback_stop_pct(Regime::StrongBearish), 0.005);
    }

    #[test]
    fn test_long_stop_ratchets_up_and_never_down() {
        let c = controller();
        let atr = Some(px(10));
        let mut stop = c.open(Regime::StrongBullish, PositionSide::Long, px(1000), atr);

        // Current - 2 ATR dominates once price has risen
        assert_eq!(c.trail(&mut stop, Regime::StrongBullish, px(1050), atr), px(1030));
        assert_eq!(c.trail(&mut stop, Regime::StrongBullish, px(1040), atr), px(1030));
        assert_eq!(c.trail(&mut stop, Regime::Range, px(1100), atr), px(1080));
    }

    #[test]
    fn test_short_stop_ratchets_down() {
        let c = controller();
        let atr = Some(px(10));
        let mut stop = c.open(Regime::StrongBearish, PositionSide::Short, px(1000), atr);
        assert_eq!(stop.stop, px(1040));
        assert_eq!(c.trail(&mut stop, Regime::StrongBearish, px(950), atr), px(970));
        assert_eq!(c.trail(&mut stop, Regime::StrongBearish, px(990), atr), px(970));
    }
}
