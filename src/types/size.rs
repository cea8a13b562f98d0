use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::types::Price;

/// Quantity resting at a level or traded in a tick, kept distinct from Price
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Size(pub Decimal);

impl Size {
    pub const ZERO: Size = Size(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn parse(s: &str) -> Result<Self, rust_decimal::Error> {
        Decimal::from_str(s.trim()).map(Self)
    }

    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn from_f64(value: f64) -> Option<Self> {
        Decimal::from_f64(value).map(Self)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Truncate towards zero onto the exchange quantity grid so an order never
    /// exceeds the size it was sized for.
    pub fn round_down_to_step(&self, step: Size) -> Self {
        if step.0.is_zero() {
            return *self;
        }
        let steps = (self.0 / step.0).round_dp_with_strategy(0, RoundingStrategy::ToZero);
        Self(steps * step.0)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Size {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Size::parse(s)
    }
}

impl Serialize for Size {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Size::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl std::ops::Add for Size {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}

impl std::ops::Sub for Size {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self(self.0 - other.0)
    }
}

// Notional value of a quantity at a price
impl std::ops::Mul<Price> for Size {
    type Output = Decimal;

    fn mul(self, rhs: Price) -> Decimal {
        self.0 * rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_down_to_step() {
        let size = Size::parse("0.01239").unwrap();
        let step = Size::parse("0.001").unwrap();
        assert_eq!(size.round_down_to_step(step), Size::parse("0.012").unwrap());
    }

    #[test]
    fn test_notional() {
        let size = Size::parse("2").unwrap();
        let price = Price::parse("100.5").unwrap();
        assert_eq!(size * price, Decimal::new(2010, 1));
    }

    #[test]
    fn test_size_serialization() {
        let size = Size::parse("1.500").unwrap();
        let json = serde_json::to_string(&size).unwrap();
        assert_eq!(json, "\"1.500\"");
        assert_eq!(serde_json::from_str::<Size>(&json).unwrap(), size);
    }
}
