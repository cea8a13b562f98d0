use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::RegimeConfig;
use crate::core::events::Direction;
use crate::detectors::MicrostructureSnapshot;

/// Discrete market regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    StrongBullish,
    WeakBullish,
    Range,
    WeakBearish,
    StrongBearish,
}

impl Regime {
    pub const ALL: [Regime; 5] = [
        Regime::StrongBullish,
        Regime::WeakBullish,
        Regime::Range,
        Regime::WeakBearish,
        Regime::StrongBearish,
    ];

    pub fn is_strong(&self) -> bool {
        matches!(self, Regime::StrongBullish | Regime::StrongBearish)
    }

    pub fn is_weak(&self) -> bool {
        matches!(self, Regime::WeakBullish | Regime::WeakBearish)
    }

    pub fn is_trending(&self) -> bool {
        !matches!(self, Regime::Range)
    }

    /// Direction the regime favours; Flat for Range
    pub fn trend(&self) -> Direction {
        match self {
            Regime::StrongBullish | Regime::WeakBullish => Direction::Long,
            Regime::Range => Direction::Flat,
            Regime::WeakBearish | Regime::StrongBearish => Direction::Short,
        }
    }

    /// Trending regime pointing the same way as `direction`
    pub fn is_aligned_with(&self, direction: Direction) -> bool {
        direction != Direction::Flat && self.trend() == direction
    }

    /// Trending regime pointing against `direction`
    pub fn is_counter_to(&self, direction: Direction) -> bool {
        direction != Direction::Flat && self.is_trending() && self.trend() != direction
    }

    /// Position in strongest-bull-first order
    pub fn rank(&self) -> usize {
        match self {
            Regime::StrongBullish => 0,
            Regime::WeakBullish => 1,
            Regime::Range => 2,
            Regime::WeakBearish => 3,
            Regime::StrongBearish => 4,
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Regime::StrongBullish => "strong_bullish",
            Regime::WeakBullish => "weak_bullish",
            Regime::Range => "range",
            Regime::WeakBearish => "weak_bearish",
            Regime::StrongBearish => "strong_bearish",
        };
        write!(f, "{}", name)
    }
}

/// Classifier inputs for one instrument at one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeInputs {
    pub imbalance: Option<f64>,
    pub intensity: Option<f64>,
    pub obv: Decimal,
    pub volatility_factor: f64,
}

impl RegimeInputs {
    pub fn from_snapshot(snapshot: &MicrostructureSnapshot, volatility_factor: f64) -> Self {
        Self {
            imbalance: snapshot.primary_imbalance(),
            intensity: snapshot.intensity,
            obv: snapshot.obv,
            volatility_factor,
        }
    }
}

/// Whether microstructure agrees with a trade direction.
/// Advisory only; it never changes the regime label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MicrostructureBias {
    pub confirms_long: bool,
    pub confirms_short: bool,
}

impl MicrostructureBias {
    pub fn confirms(&self, direction: Direction) -> bool {
        match direction {
            Direction::Long => self.confirms_long,
            Direction::Short => self.confirms_short,
            Direction::Flat => false,
        }
    }
}

/// Stateless regime classification. The volatility factor alone decides the
/// label; identical inputs always give identical output.
#[derive(Debug, Clone, Default)]
pub struct RegimeClassifier {
    config: RegimeConfig,
}

impl RegimeClassifier {
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, inputs: &RegimeInputs) -> Regime {
        let v = inputs.volatility_factor;
        let c = &self.config;
        if !v.is_finite() {
            return Regime::Range;
        }
        if v > c.strong_bullish_above {
            Regime::StrongBullish
        } else if v >= c.weak_bullish_from {
            Regime::WeakBullish
        } else if v >= c.range_from {
            Regime::Range
        } else if v >= c.weak_bearish_from {
            Regime::WeakBearish
        } else {
            Regime::StrongBearish
        }
    }

    /// Directional confirmation from imbalance, intensity and OBV sign.
    /// Strong regimes need less evidence than weak ones; Range uses the weak thresholds.
    pub fn bias(&self, regime: Regime, inputs: &RegimeInputs) -> MicrostructureBias {
        let (min_imbalance, min_intensity) = if regime.is_strong() {
            (self.config.strong_imbalance, self.config.strong_intensity)
        } else {
            (self.config.weak_imbalance, self.config.weak_intensity)
        };
        let (Some(imbalance), Some(intensity)) = (inputs.imbalance, inputs.intensity) else {
            return MicrostructureBias::default();
        };

        MicrostructureBias {
            confirms_long: imbalance > min_imbalance
                && intensity > min_intensity
                && inputs.obv >= Decimal::ZERO,
            confirms_short: imbalance < -min_imbalance
                && intensity < -min_intensity
                && inputs.obv <= Decimal::ZERO,
        }
    }
}
