use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::FeedConfig;
use crate::core::events::Timestamp;
use crate::error::FeedError;
use crate::feed::transport::{Connector, DuplexChannel, Frame};

/// Lifecycle of a stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Inbound payload tagged with the connection lifetime it arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Incremented on every successful (re)connect, starting at 1
    pub epoch: u64,
    pub payload: String,
    /// Local receive time in milliseconds
    pub received_at: Timestamp,
}

pub type MessageHandler = Box<dyn FnMut(StreamMessage) + Send>;

/// Timing parameters of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub reconnect_backoff: Duration,
    pub keepalive_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::from(&FeedConfig::default())
    }
}

impl From<&FeedConfig> for StreamConfig {
    fn from(config: &FeedConfig) -> Self {
        Self {
            reconnect_backoff: config.reconnect_backoff(),
            keepalive_interval: config.keepalive_interval(),
            pong_timeout: config.pong_timeout(),
        }
    }
}

/// Resilient duplex connection to one stream endpoint.
///
/// After `open` a background task keeps the channel alive: it answers pings,
/// sends keepalive pings and reconnects after a fixed backoff whenever the
/// channel errors, closes, or misses a pong. Retries never stop until `close`.
pub struct StreamConnection {
    endpoint: String,
    connector: Arc<dyn Connector>,
    config: StreamConfig,
    handler: Option<MessageHandler>,
    status: Arc<RwLock<ConnectionStatus>>,
    reconnects: Arc<AtomicU64>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

enum SessionEnd {
    Closed,
    Shutdown,
}

impl StreamConnection {
    pub fn new(endpoint: impl Into<String>, connector: Arc<dyn Connector>, config: StreamConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            connector,
            config,
            handler: None,
            status: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            reconnects: Arc::new(AtomicU64::new(0)),
            shutdown: None,
            task: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Install the message handler; it is called once per message in arrival order.
    /// Must be set before `open`.
    pub fn on_message<F>(&mut self, handler: F)
    where
        F: FnMut(StreamMessage) + Send + 'static,
    {
        self.handler = Some(Box::new(handler));
    }

    /// Start the connection task. Opening twice is a no-op.
    pub fn open(&mut self) {
        if self.task.is_some() {
            return;
        }

        let handler = self.handler.take().unwrap_or_else(|| {
            warn!("No message handler set for {}, messages will be discarded", self.endpoint);
            Box::new(|_| {})
        });
        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(tx);

        let worker = ConnectionWorker {
            endpoint: self.endpoint.clone(),
            connector: self.connector.clone(),
            config: self.config,
            handler,
            status: self.status.clone(),
            reconnects: self.reconnects.clone(),
            shutdown: rx,
        };
        self.task = Some(tokio::spawn(worker.run()));
    }

    /// Stop the task, unblocking any pending read, and wait for it to exit
    pub async fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Connection task for {} ended abnormally: {}", self.endpoint, e);
            }
        }
        *self.status.write().await = ConnectionStatus::Closed;
    }

    pub async fn status(&self) -> ConnectionStatus {
        *self.status.read().await
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub(crate) fn status_handle(&self) -> Arc<RwLock<ConnectionStatus>> {
        self.status.clone()
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
    }
}

struct ConnectionWorker {
    endpoint: String,
    connector: Arc<dyn Connector>,
    config: StreamConfig,
    handler: MessageHandler,
    status: Arc<RwLock<ConnectionStatus>>,
    reconnects: Arc<AtomicU64>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionWorker {
    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run(mut self) {
        // Owned handle: the handler is not Sync, so `&self` must not live across awaits
        let status = self.status.clone();
        let mut epoch = 0u64;

        loop {
            if self.stopping() {
                break;
            }
            let next = if epoch == 0 && self.reconnect_count() == 0 {
                ConnectionStatus::Connecting
            } else {
                ConnectionStatus::Reconnecting
            };
            *status.write().await = next;

            let connected = tokio::select! {
                result = self.connector.connect(&self.endpoint) => result,
                _ = self.shutdown.changed() => break,
            };

            match connected {
                Ok(channel) => {
                    epoch += 1;
                    *status.write().await = ConnectionStatus::Connected;
                    info!("Connected to {} (epoch {})", self.endpoint, epoch);

                    match self.drive(channel, epoch).await {
                        Ok(SessionEnd::Shutdown) => break,
                        Ok(SessionEnd::Closed) => info!("Stream {} closed by peer", self.endpoint),
                        Err(e) => warn!("Stream {} failed: {}", self.endpoint, e),
                    }
                }
                Err(e) => warn!("Connect to {} failed: {}", self.endpoint, e),
            }

            let attempt = self.reconnects.fetch_add(1, Ordering::Relaxed) + 1;
            *status.write().await = ConnectionStatus::Reconnecting;
            info!(
                "Reconnecting to {} in {:?} (attempt {})",
                self.endpoint, self.config.reconnect_backoff, attempt
            );

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        *status.write().await = ConnectionStatus::Closed;
        debug!("Connection task for {} exited", self.endpoint);
    }

    fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    async fn drive(
        &mut self,
        mut channel: Box<dyn DuplexChannel>,
        epoch: u64,
    ) -> Result<SessionEnd, FeedError> {
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        // The first tick completes immediately
        keepalive.tick().await;
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let deadline = pong_deadline;
            tokio::select! {
                frame = channel.recv() => match frame {
                    Some(Ok(Frame::Text(payload))) => self.deliver(epoch, payload),
                    Some(Ok(Frame::Binary(data))) => match String::from_utf8(data) {
                        Ok(payload) => self.deliver(epoch, payload),
                        Err(_) => debug!("Dropping non UTF-8 frame from {}", self.endpoint),
                    },
                    Some(Ok(Frame::Ping(data))) => channel.send(Frame::Pong(data)).await?,
                    Some(Ok(Frame::Pong(_))) => pong_deadline = None,
                    Some(Ok(Frame::Close)) | None => return Ok(SessionEnd::Closed),
                    Some(Err(e)) => return Err(e),
                },
                _ = keepalive.tick() => {
                    if pong_deadline.is_none() {
                        channel.send(Frame::Ping(Vec::new())).await?;
                        pong_deadline = Some(Instant::now() + self.config.pong_timeout);
                        debug!("Sent keepalive ping to {}", self.endpoint);
                    }
                }
                _ = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    return Err(FeedError::KeepaliveTimeout(self.config.pong_timeout));
                }
                _ = self.shutdown.changed() => {
                    let _ = channel.send(Frame::Close).await;
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    fn deliver(&mut self, epoch: u64, payload: String) {
        let received_at = chrono::Utc::now().timestamp_millis().max(0) as u64;
        (self.handler)(StreamMessage {
            epoch,
            payload,
            received_at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::mock::{ScriptedConnector, ScriptedSession};
    use std::sync::Mutex;

    fn fast_config() -> StreamConfig {
        StreamConfig {
            reconnect_backoff: Duration::from_millis(20),
            keepalive_interval: Duration::from_millis(40),
            pong_timeout: Duration::from_millis(30),
        }
    }

    #[test]
    fn test_worker_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let (_tx, rx) = watch::channel(false);
        let worker = ConnectionWorker {
            endpoint: "ws://test/send".to_string(),
            connector: Arc::new(ScriptedConnector::new()),
            config: fast_config(),
            handler: Box::new(|_| {}),
            status: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            reconnects: Arc::new(AtomicU64::new(0)),
            shutdown: rx,
        };
        let run = worker.run();
        assert_send(&run);
    }

    #[tokio::test]
    async fn test_messages_delivered_in_order() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.push_session(
            "ws://test/a",
            ScriptedSession::new(vec![Frame::Text("1".into()), Frame::Text("2".into())]).hold_open(),
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut conn = StreamConnection::new("ws://test/a", connector.clone(), fast_config());
        conn.on_message(move |msg| sink.lock().unwrap().push((msg.epoch, msg.payload)));
        conn.open();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.status().await, ConnectionStatus::Connected);
        conn.close().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, "1".to_string()), (1, "2".to_string())]
        );
        assert_eq!(conn.status().await, ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_reconnects_after_peer_close() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.push_session("ws://test/b", ScriptedSession::new(vec![Frame::Text("a".into())]));
        connector.push_session(
            "ws://test/b",
            ScriptedSession::new(vec![Frame::Text("b".into())]).auto_pong(),
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut conn = StreamConnection::new("ws://test/b", connector.clone(), fast_config());
        conn.on_message(move |msg| sink.lock().unwrap().push(msg.epoch));
        conn.open();

        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.close().await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert!(conn.reconnect_count() >= 1);
        assert_eq!(connector.connect_attempts("ws://test/b"), 2);
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let connector = Arc::new(ScriptedConnector::new());
        let session = ScriptedSession::new(vec![Frame::Ping(vec![7])]).hold_open();
        let sent = session.sent_frames();
        connector.push_session("ws://test/c", session);

        let mut conn = StreamConnection::new("ws://test/c", connector, fast_config());
        conn.on_message(|_| {});
        conn.open();
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close().await;

        assert!(sent.lock().unwrap().contains(&Frame::Pong(vec![7])));
    }

    #[tokio::test]
    async fn test_missing_pong_triggers_reconnect() {
        let connector = Arc::new(ScriptedConnector::new());
        // Silent peer: never answers the keepalive ping
        connector.push_session("ws://test/d", ScriptedSession::new(vec![]).hold_open());
        connector.push_session(
            "ws://test/d",
            ScriptedSession::new(vec![]).hold_open().auto_pong(),
        );

        let mut conn = StreamConnection::new("ws://test/d", connector.clone(), fast_config());
        conn.on_message(|_| {});
        conn.open();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(conn.reconnect_count(), 1);
        assert_eq!(conn.status().await, ConnectionStatus::Connected);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_close_interrupts_backoff() {
        let connector = Arc::new(ScriptedConnector::new());
        let config = StreamConfig {
            reconnect_backoff: Duration::from_secs(60),
            ..fast_config()
        };
        let mut conn = StreamConnection::new("ws://test/none", connector, config);
        conn.on_message(|_| {});
        conn.open();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.status().await, ConnectionStatus::Reconnecting);

        tokio::time::timeout(Duration::from_secs(1), conn.close())
            .await
            .unwrap();
        assert_eq!(conn.status().await, ConnectionStatus::Closed);
    }
}
