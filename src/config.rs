use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::execution::ExecutionMode;

/// Market data connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub ws_base_url: String,
    /// Levels requested per side on the depth topic
    pub depth_levels: usize,
    pub depth_update_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub keepalive_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "wss://fstream.binance.com/ws".to_string(),
            depth_levels: 20,
            depth_update_ms: 100,
            reconnect_backoff_ms: 5_000,
            keepalive_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl FeedConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Shared parameters for every per-instrument detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Depths at which imbalance is reported
    pub imbalance_depths: Vec<usize>,
    /// Snapshots retained in the sliding window
    pub snapshot_window: usize,
    /// Ticks retained in the sliding window
    pub trade_window: usize,
    pub iceberg_window: usize,
    pub iceberg_ratio: f64,
    /// A step counts as replenishment when the level shrinks by less than this fraction of itself
    pub iceberg_shrink_fraction: f64,
    pub spoof_cancel_ms: u64,
    pub spoof_size_multiple: f64,
    /// How long a flagged spoof keeps the book under suspicion
    pub spoof_memory_ms: u64,
    pub intensity_window: usize,
    pub flow_intervals_secs: Vec<u64>,
    pub atr_bar_secs: u64,
    pub atr_period: usize,
    pub volatility_bars: usize,
    pub large_trade_size: f64,
    pub volume_spike_multiple: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            imbalance_depths: vec![5, 20],
            snapshot_window: 50,
            trade_window: 500,
            iceberg_window: 10,
            iceberg_ratio: 0.6,
            iceberg_shrink_fraction: 0.2,
            spoof_cancel_ms: 500,
            spoof_size_multiple: 5.0,
            spoof_memory_ms: 5_000,
            intensity_window: 10,
            flow_intervals_secs: vec![60, 300, 900],
            atr_bar_secs: 60,
            atr_period: 14,
            volatility_bars: 30,
            large_trade_size: 50.0,
            volume_spike_multiple: 2.0,
        }
    }
}

/// Volatility-factor boundaries and advisory microstructure thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    pub strong_bullish_above: f64,
    pub weak_bullish_from: f64,
    pub range_from: f64,
    pub weak_bearish_from: f64,
    pub strong_imbalance: f64,
    pub strong_intensity: f64,
    pub weak_imbalance: f64,
    pub weak_intensity: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            strong_bullish_above: 1.5,
            weak_bullish_from: 1.2,
            range_from: 0.8,
            weak_bearish_from: 0.5,
            strong_imbalance: 0.1,
            strong_intensity: 0.05,
            weak_imbalance: 0.2,
            weak_intensity: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub kelly_cap: f64,
    pub max_notional_fraction: f64,
    pub risk_reward_ratio: f64,
    pub strong_multiplier: f64,
    pub weak_multiplier: f64,
    pub range_multiplier: f64,
    pub weight_floor: f64,
    pub weight_ceiling: f64,
    /// Realised per-bar volatility at which the volatility weight is 1.0
    pub target_volatility: f64,
    pub spoof_damping: f64,
    pub unconfirmed_damping: f64,
    /// Decimal places kept on decision fractions and percentages
    pub decision_precision: u32,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            kelly_cap: 0.3,
            max_notional_fraction: 0.10,
            risk_reward_ratio: 2.0,
            strong_multiplier: 1.5,
            weak_multiplier: 1.2,
            range_multiplier: 0.5,
            weight_floor: 0.5,
            weight_ceiling: 2.0,
            target_volatility: 0.002,
            spoof_damping: 0.5,
            unconfirmed_damping: 0.75,
            decision_precision: 8,
        }
    }
}

/// ATR multiples per regime for trailing stops and take-profit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    pub range_stop_atr: f64,
    pub weak_stop_atr: f64,
    pub strong_stop_atr: f64,
    pub range_take_profit_atr: f64,
    pub weak_take_profit_atr: f64,
    pub strong_take_profit_atr: f64,
    /// Hard bound on trailing distance from the current price
    pub max_trail_atr: f64,
    /// Stop percentages used before an ATR is available, strongest bull first
    pub fallback_stop_pct: [f64; 5],
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            range_stop_atr: 2.0,
            weak_stop_atr: 3.0,
            strong_stop_atr: 4.0,
            range_take_profit_atr: 3.0,
            weak_take_profit_atr: 5.0,
            strong_take_profit_atr: 6.0,
            max_trail_atr: 2.0,
            fallback_stop_pct: [0.05, 0.03, 0.02, 0.01, 0.005],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeverageConfig {
    pub min: u32,
    pub max: u32,
    pub step: u32,
    pub default: u32,
}

impl Default for LeverageConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 10,
            step: 2,
            default: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub loss_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            loss_threshold: 3,
            cooldown_secs: 60,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,
    pub max_submit_attempts: u32,
    pub retry_delay_ms: u64,
    pub submit_timeout_ms: u64,
    /// How long an acknowledged but unfilled order may hold its cycle before
    /// the position is reconciled from the exchange
    pub await_fill_timeout_ms: u64,
    /// Hybrid mode submits automatically above this confidence
    pub hybrid_confidence: f64,
    /// Minimum spacing between sizing evaluations per instrument
    pub evaluation_interval_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Automatic,
            max_submit_attempts: 3,
            retry_delay_ms: 1_000,
            submit_timeout_ms: 5_000,
            await_fill_timeout_ms: 30_000,
            hybrid_confidence: 0.8,
            evaluation_interval_ms: 1_000,
        }
    }
}

impl ExecutionConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn await_fill_timeout(&self) -> Duration {
        Duration::from_millis(self.await_fill_timeout_ms)
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }
}

/// Fully resolved engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub feed: FeedConfig,
    pub detectors: DetectorConfig,
    pub regime: RegimeConfig,
    pub sizing: SizingConfig,
    pub stops: StopConfig,
    pub leverage: LeverageConfig,
    pub breaker: BreakerConfig,
    pub execution: ExecutionConfig,
}

impl EngineConfig {
    /// Resolve defaults, then an optional file, then `CRYPTO_REGIME__SECTION__KEY`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("CRYPTO_REGIME")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let resolved: EngineConfig = builder.build()?.try_deserialize()?;
        resolved.validate()?;
        Ok(resolved)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detectors;
        if d.imbalance_depths.is_empty() || d.imbalance_depths.contains(&0) {
            return invalid("detectors.imbalance_depths must be non-empty and non-zero");
        }
        if d.snapshot_window < d.iceberg_window || d.iceberg_window < 2 {
            return invalid("detectors.iceberg_window must be >= 2 and <= snapshot_window");
        }
        if d.trade_window == 0 || d.intensity_window == 0 || d.atr_period == 0 {
            return invalid("detector windows must be non-zero");
        }
        if !(0.0..=1.0).contains(&d.iceberg_ratio) || !(0.0..1.0).contains(&d.iceberg_shrink_fraction)
        {
            return invalid("detectors.iceberg_ratio / iceberg_shrink_fraction out of range");
        }
        if d.spoof_size_multiple <= 0.0 || d.volume_spike_multiple <= 0.0 {
            return invalid("detector multiples must be positive");
        }
        if d.flow_intervals_secs.is_empty() || d.flow_intervals_secs.contains(&0) || d.atr_bar_secs == 0
        {
            return invalid("flow intervals and ATR bar length must be positive");
        }

        let r = &self.regime;
        if !(r.weak_bearish_from < r.range_from
            && r.range_from < r.weak_bullish_from
            && r.weak_bullish_from <= r.strong_bullish_above)
        {
            return invalid("regime boundaries must be increasing");
        }

        let s = &self.sizing;
        if !(0.0..=1.0).contains(&s.kelly_cap) || !(0.0..=1.0).contains(&s.max_notional_fraction) {
            return invalid("sizing caps must lie in [0, 1]");
        }
        if s.risk_reward_ratio <= 0.0 || s.weight_floor <= 0.0 || s.weight_floor > s.weight_ceiling {
            return invalid("sizing weights / risk-reward ratio invalid");
        }

        let l = &self.leverage;
        if l.min == 0 || l.min > l.max || l.step == 0 || !(l.min..=l.max).contains(&l.default) {
            return invalid("leverage bounds must satisfy 1 <= min <= default <= max, step > 0");
        }

        if self.breaker.loss_threshold == 0 {
            return invalid("breaker.loss_threshold must be positive");
        }
        if self.execution.max_submit_attempts == 0 {
            return invalid("execution.max_submit_attempts must be positive");
        }
        if self.execution.submit_timeout_ms == 0 || self.execution.await_fill_timeout_ms == 0 {
            return invalid("execution timeouts must be positive");
        }
        if self.feed.depth_levels == 0 {
            return invalid("feed.depth_levels must be positive");
        }
        if self.feed.connect_timeout_ms == 0 {
            return invalid("feed.connect_timeout_ms must be positive");
        }
        Ok(())
    }
}

fn invalid<T>(msg: &str) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(msg.to_string()))
}
