pub mod circuit_breaker;
pub mod leverage;
pub mod sizing;
pub mod stops;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState};
pub use leverage::LeverageManager;
pub use sizing::{PositionSizingDecision, RiskSizingEngine, SizingRequest};
pub use stops::{StopController, TrailingStop};
