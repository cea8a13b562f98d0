use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::debug;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::FeedConfig;
use crate::error::FeedError;

/// Transport-level frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// One established duplex channel.
///
/// `recv` must be cancel safe: the connection loop races it against the
/// keepalive timer and the shutdown signal.
#[async_trait]
pub trait DuplexChannel: Send {
    /// Next inbound frame, `None` once the peer has gone away
    async fn recv(&mut self) -> Option<Result<Frame, FeedError>>;

    async fn send(&mut self, frame: Frame) -> Result<(), FeedError>;
}

/// Opens duplex channels to stream endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn DuplexChannel>, FeedError>;
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl From<&FeedConfig> for WebSocketConnector {
    fn from(config: &FeedConfig) -> Self {
        Self::new(config.connect_timeout())
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::from(&FeedConfig::default())
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn DuplexChannel>, FeedError> {
        let connect_err = |reason: String| FeedError::Connect {
            endpoint: endpoint.to_string(),
            reason,
        };

        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(endpoint))
            .await
            .map_err(|_| connect_err(format!("timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| connect_err(e.to_string()))?;

        debug!("WebSocket handshake complete: {}", endpoint);
        Ok(Box::new(WebSocketChannel { stream }))
    }
}

struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl DuplexChannel for WebSocketChannel {
    async fn recv(&mut self) -> Option<Result<Frame, FeedError>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(Message::Text(text)) => Frame::Text(text),
                Ok(Message::Binary(data)) => Frame::Binary(data),
                Ok(Message::Ping(data)) => Frame::Ping(data),
                Ok(Message::Pong(data)) => Frame::Pong(data),
                Ok(Message::Close(_)) => Frame::Close,
                // Raw frames are never surfaced when reading
                Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(FeedError::Transport(e.to_string()))),
            };
            return Some(Ok(frame));
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), FeedError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_timeout_from_feed_config() {
        let config = FeedConfig {
            connect_timeout_ms: 2_500,
            ..FeedConfig::default()
        };
        let connector = WebSocketConnector::from(&config);
        assert_eq!(connector.connect_timeout(), Duration::from_millis(2_500));
        assert_eq!(WebSocketConnector::default().connect_timeout(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_to_connect() {
        let connector = WebSocketConnector::new(Duration::from_millis(200));
        let result = connector.connect("ws://127.0.0.1:1/ws").await;
        assert!(matches!(result, Err(FeedError::Connect { .. })));
    }
}
