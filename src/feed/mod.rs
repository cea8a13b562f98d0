pub mod connection;
pub mod multiplexer;
pub mod transport;

pub use connection::{ConnectionStatus, StreamConfig, StreamConnection, StreamMessage};
pub use multiplexer::{FeedMultiplexer, RouteFactory};
pub use transport::{Connector, DuplexChannel, Frame, WebSocketConnector};

/// Stream topic subscribed per instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Depth,
    Trade,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Depth, Topic::Trade];
}
