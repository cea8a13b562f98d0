pub mod binance;
pub mod dry_run;
pub mod mock;

pub use binance::{decode, endpoint, BinanceMessage};
pub use dry_run::DryRunExchange;
pub use mock::{
    MockExchange, MockSignalProvider, MockVolatilityProvider, RecordingAuditSink,
    RecordingNotifier, ScriptedConnector, ScriptedSession,
};
