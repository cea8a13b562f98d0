use log::debug;

use crate::config::LeverageConfig;
use crate::regime::Regime;
use crate::types::{Position, Price};

/// Steps account leverage up in aligned trends and down on adverse moves,
/// one step per evaluation at most.
#[derive(Debug, Clone, Default)]
pub struct LeverageManager {
    config: LeverageConfig,
}

impl LeverageManager {
    pub fn new(config: LeverageConfig) -> Self {
        Self { config }
    }

    pub fn default_leverage(&self) -> u32 {
        self.config.default
    }

    /// Next leverage given the open position, the regime and the mark price.
    ///
    /// Without a position the configured default applies. A losing position or
    /// a regime running against it steps down; a non-losing position aligned
    /// with a trending regime steps up. Anything else holds.
    pub fn evaluate(
        &self,
        current: u32,
        position: Option<&Position>,
        regime: Regime,
        mark: Option<Price>,
    ) -> u32 {
        let LeverageConfig { min, max, step, .. } = self.config;
        let current = current.clamp(min, max);

        let Some(position) = position else {
            return self.config.default;
        };

        let direction = position.side.direction();
        let losing = mark.map_or(false, |m| position.is_losing(m));
        let next = if losing || regime.is_counter_to(direction) {
            current.saturating_sub(step).max(min)
        } else if regime.is_aligned_with(direction) {
            current.saturating_add(step).min(max)
        } else {
            current
        };

        if next != current {
            debug!(
                "{} leverage {} -> {} ({:?} position, {} regime, losing={})",
                position.symbol, current, next, direction, regime, losing
            );
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PositionSide, Size, Symbol};

    fn position(side: PositionSide) -> Position {
        Position::new(
            Symbol::new("BTCUSDT"),
            side,
            Size::parse("1").unwrap(),
            Price::parse("100").unwrap(),
        )
    }

    fn px(s: &str) -> Option<Price> {
        Some(Price::parse(s).unwrap())
    }

    #[test]
    fn test_default_without_position() {
        let manager = LeverageManager::default();
        assert_eq!(manager.evaluate(9, None, Regime::StrongBullish, None), 5);
    }

    #[test]
    fn test_aligned_trend_steps_up_to_ceiling() {
        let manager = LeverageManager::default();
        let long = position(PositionSide::Long);
        assert_eq!(manager.evaluate(5, Some(&long), Regime::WeakBullish, px("101")), 7);
        assert_eq!(manager.evaluate(9, Some(&long), Regime::StrongBullish, px("101")), 10);
        assert_eq!(manager.evaluate(10, Some(&long), Regime::StrongBullish, px("101")), 10);
    }

    #[test]
    fn test_adverse_steps_down_to_floor() {
        let manager = LeverageManager::default();
        let long = position(PositionSide::Long);
        // Losing despite an aligned regime
        assert_eq!(manager.evaluate(5, Some(&long), Regime::StrongBullish, px("99")), 3);
        // Regime reversal
        assert_eq!(manager.evaluate(2, Some(&long), Regime::WeakBearish, px("101")), 1);
        assert_eq!(manager.evaluate(1, Some(&long), Regime::StrongBearish, px("101")), 1);
    }

    #[test]
    fn test_range_holds() {
        let manager = LeverageManager::default();
        let short = position(PositionSide::Short);
        assert_eq!(manager.evaluate(6, Some(&short), Regime::Range, px("99")), 6);
    }
}
