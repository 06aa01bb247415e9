//! Connection handling for xAP
//!
//! A [`Connection`] owns a receive socket, a send socket and the heartbeat
//! timer. All of its state lives on one worker task; the handle talks to it
//! over a command queue and observes it through a watch channel.
//!
//! - Heartbeats go out at once on connect, then whenever the adaptive period
//!   elapses
//! - Hearing our own heartbeat makes the connection alive
//! - Missing the echo of a heartbeat marks the connection lost
//! - Messages and heartbeats from the network are reported as events

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, Span};

use super::events::{event_queue, EventSender};
use super::{
    ConnectionConfig, DatagramSocket, EventReceiver, Liveness, LivenessChange, Scheduler, SocketFactory, Ticker,
    TokioScheduler, UdpSockets, TICK,
};
use crate::protocol::{
    build_header, build_heartbeat, parse_blocks, parse_heartbeat_fields, Block, HeartbeatClass,
    HeartbeatFields, Message, Routing, ValidationError, WireFormat, HEADER_BLOCK_NAME,
    HEARTBEAT_BLOCK_NAME,
};

/// Largest datagram we accept
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Pause after the first failed receive, doubled per consecutive failure
const RECV_ERROR_BACKOFF_MIN: Duration = Duration::from_millis(10);
const RECV_ERROR_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Invalid message: {0}")]
    Validation(#[from] ValidationError),

    #[error("A message needs at least one payload block")]
    EmptyPayload,

    #[error("Connection worker stopped")]
    WorkerStopped,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No sockets open
    Disconnected,
    /// Sockets are being bound
    Binding,
    /// Bound, but our own heartbeat has not been heard yet
    Connected,
    /// Our latest heartbeat was heard
    Alive,
    /// Was alive, then a heartbeat went unheard
    LostConnection,
}

impl ConnectionState {
    /// Whether sockets are open and sends are accepted
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Alive | ConnectionState::LostConnection
        )
    }
}

/// Events emitted by a connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Our own heartbeat was heard (first time, or after a loss)
    Connected,
    /// `disconnect` completed
    Disconnected,
    /// A heartbeat of ours went unheard
    LostConnection,
    /// A message with a valid header and at least one payload block
    Message { message: Message, from: SocketAddr },
    /// A valid heartbeat, ours or another device's
    Heartbeat {
        heartbeat: HeartbeatFields,
        from: SocketAddr,
    },
    /// Unusable datagram or socket failure
    Error {
        raw: Bytes,
        from: Option<SocketAddr>,
        reason: String,
    },
}

impl ConnectionEvent {
    /// Connected, LostConnection and Disconnected
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::Connected | ConnectionEvent::LostConnection | ConnectionEvent::Disconnected
        )
    }
}

enum Command {
    Send {
        payload: Bytes,
        reply: oneshot::Sender<ConnectionResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<ConnectionResult<()>>,
    },
}

struct WorkerHandle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// An xAP network connection
pub struct Connection {
    config: ConnectionConfig,
    scheduler: Arc<dyn Scheduler>,
    sockets: Arc<dyn SocketFactory>,
    span: Span,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    event_tx: EventSender,
    event_rx: Option<EventReceiver>,
    local_addr: Option<SocketAddr>,
    worker: Option<WorkerHandle>,
}

impl Connection {
    /// Create a connection using UDP sockets and the tokio clock
    pub fn new(config: ConnectionConfig) -> Self {
        let (event_tx, event_rx) = event_queue();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let span = tracing::info_span!("xap", source = %config.source);

        Self {
            config,
            scheduler: Arc::new(TokioScheduler),
            sockets: Arc::new(UdpSockets),
            span,
            state_tx: Arc::new(state_tx),
            state_rx,
            event_tx,
            event_rx: Some(event_rx),
            local_addr: None,
            worker: None,
        }
    }

    /// Use another tick source for heartbeats
    pub fn with_scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Arc::new(scheduler);
        self
    }

    /// Use another socket implementation
    pub fn with_sockets(mut self, sockets: impl SocketFactory + 'static) -> Self {
        self.sockets = Arc::new(sockets);
        self
    }

    /// Span all of this connection's logging is recorded under
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<EventReceiver> {
        let events = self.event_rx.take()?;
        events.mark_taken();
        Some(events)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Get the current state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver that sees every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.worker.is_some()
    }

    /// Whether our latest heartbeat was heard
    pub fn is_alive(&self) -> bool {
        self.state() == ConnectionState::Alive
    }

    /// Address the receive socket is bound to, while connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the sockets, send the first heartbeat and start the timer
    pub async fn connect(&mut self) -> ConnectionResult<()> {
        if self.worker.is_some() {
            return Err(ConnectionError::AlreadyConnected);
        }

        self.state_tx.send_replace(ConnectionState::Binding);
        match self.open().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(parent: &self.span, "Connect failed: {}", e);
                self.state_tx.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn open(&mut self) -> ConnectionResult<()> {
        let bind_addr = self.config.rx_bind_addr();
        let rx = self
            .sockets
            .bind_receiver(bind_addr)
            .await
            .map_err(|source| ConnectionError::Bind { addr: bind_addr, source })?;
        let tx = self
            .sockets
            .bind_sender(self.config.tx_address)
            .await
            .map_err(|source| ConnectionError::Bind {
                addr: SocketAddr::new(self.config.tx_address, 0),
                source,
            })?;

        let local = rx.local_addr()?;
        // In loopback mode we send to our own ephemeral port.
        let tx_port = if self.config.loopback {
            local.port()
        } else {
            self.config.port
        };
        let target = SocketAddr::new(self.config.tx_address, tx_port);

        tracing::info!(parent: &self.span, "Listening on {}, sending to {}", local, target);

        let (commands, command_rx) = mpsc::channel(64);
        let worker = Worker {
            uid: self.config.uid.clone(),
            source: self.config.source_string(),
            interval: self.config.hb_interval,
            rx,
            tx,
            target,
            rx_port: local.port(),
            liveness: Liveness::new(self.config.heartbeat_interval(), self.config.hb_backoff),
            ticker: self.scheduler.schedule_repeating(TICK),
            commands: command_rx,
            events: self.event_tx.clone(),
            state: self.state_tx.clone(),
            recv_failures: 0,
        };

        self.state_tx.send_replace(ConnectionState::Connected);
        self.local_addr = Some(local);
        let task = tokio::spawn(worker.run().instrument(self.span.clone()));
        self.worker = Some(WorkerHandle { commands, task });
        Ok(())
    }

    /// Stop heartbeats, announce that we stopped, and close the sockets.
    ///
    /// The connection is torn down even if the final heartbeat cannot be
    /// sent; that send error is returned.
    pub async fn disconnect(&mut self) -> ConnectionResult<()> {
        let worker = self.worker.take().ok_or(ConnectionError::NotConnected)?;

        let (reply, reply_rx) = oneshot::channel();
        let result = match worker.commands.send(Command::Disconnect { reply }).await {
            Ok(()) => reply_rx.await.unwrap_or(Err(ConnectionError::WorkerStopped)),
            Err(_) => Err(ConnectionError::WorkerStopped),
        };
        if let Err(e) = worker.task.await {
            tracing::error!(parent: &self.span, "Connection worker failed: {}", e);
        }

        self.local_addr = None;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        tracing::info!(parent: &self.span, "Disconnected");
        self.event_tx.emit(ConnectionEvent::Disconnected);
        result
    }

    /// Send raw text as one datagram
    pub async fn send(&self, text: &str) -> ConnectionResult<()> {
        let worker = self.worker.as_ref().ok_or(ConnectionError::NotConnected)?;

        let (reply, reply_rx) = oneshot::channel();
        let payload = Bytes::copy_from_slice(text.as_bytes());
        worker
            .commands
            .send(Command::Send { payload, reply })
            .await
            .map_err(|_| ConnectionError::WorkerStopped)?;
        reply_rx.await.map_err(|_| ConnectionError::WorkerStopped)?
    }

    /// Send a prepared message
    pub async fn send_message(&self, message: &Message) -> ConnectionResult<()> {
        self.send(&message.to_wire()).await
    }

    /// Send one payload block under a header built from our uid and source
    pub async fn send_block(&self, class: &str, block: Block, routing: &Routing) -> ConnectionResult<()> {
        self.send_blocks(class, vec![block], routing).await
    }

    /// Send payload blocks under a header built from our uid and source
    pub async fn send_blocks(
        &self,
        class: &str,
        blocks: Vec<Block>,
        routing: &Routing,
    ) -> ConnectionResult<()> {
        if self.worker.is_none() {
            return Err(ConnectionError::NotConnected);
        }

        let mut blocks = blocks.into_iter();
        let first = blocks.next().ok_or(ConnectionError::EmptyPayload)?;
        let header = build_header(class, &self.config.uid, &self.config.source_string(), routing);

        let mut message = Message::new(header, first)?;
        for block in blocks {
            message.push(block);
        }
        self.send_message(&message).await
    }
}

fn recv_error_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    (RECV_ERROR_BACKOFF_MIN * (1u32 << shift)).min(RECV_ERROR_BACKOFF_MAX)
}

/// Owns the sockets and all mutable connection state
struct Worker {
    uid: String,
    source: String,
    interval: u32,
    rx: Arc<dyn DatagramSocket>,
    tx: Arc<dyn DatagramSocket>,
    target: SocketAddr,
    rx_port: u16,
    liveness: Liveness,
    ticker: Ticker,
    commands: mpsc::Receiver<Command>,
    events: EventSender,
    state: Arc<watch::Sender<ConnectionState>>,
    recv_failures: u32,
}

impl Worker {
    async fn run(mut self) {
        self.send_alive_heartbeat().await;

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    match command {
                        Some(Command::Send { payload, reply }) => {
                            let _ = reply.send(self.transmit(&payload).await);
                        }
                        Some(Command::Disconnect { reply }) => {
                            self.ticker.cancel();
                            let _ = reply.send(self.send_heartbeat(HeartbeatClass::Stopped).await);
                            break;
                        }
                        // Handle dropped without disconnecting
                        None => {
                            self.ticker.cancel();
                            break;
                        }
                    }
                }

                Some(()) = self.ticker.tick() => {
                    if self.liveness.tick() {
                        self.send_alive_heartbeat().await;
                    }
                }

                result = self.rx.recv_from(&mut buf) => {
                    match result {
                        Ok((n, from)) => {
                            self.recv_failures = 0;
                            self.handle_datagram(&buf[..n], from);
                        }
                        Err(e) => {
                            self.recv_failures = self.recv_failures.saturating_add(1);
                            let pause = recv_error_backoff(self.recv_failures);
                            tracing::warn!("Receive error: {}, retrying in {:?}", e, pause);
                            self.emit(ConnectionEvent::Error {
                                raw: Bytes::new(),
                                from: None,
                                reason: e.to_string(),
                            });
                            sleep(pause).await;
                        }
                    }
                }
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        self.events.emit(event);
    }

    fn report_error(&self, data: &[u8], from: SocketAddr, reason: String) {
        tracing::debug!("Rejected datagram from {}: {}", from, reason);
        self.emit(ConnectionEvent::Error {
            raw: Bytes::copy_from_slice(data),
            from: Some(from),
            reason,
        });
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let text = String::from_utf8_lossy(data);
        tracing::trace!("Received from {}: {:?}", from, text);

        let blocks = parse_blocks(&text);
        let Some(first) = blocks.first() else {
            return self.report_error(data, from, "no xAP blocks found".to_string());
        };
        let first_name = first.name().to_ascii_lowercase();

        if first_name == HEARTBEAT_BLOCK_NAME {
            match parse_heartbeat_fields(first) {
                Ok(heartbeat) => self.handle_heartbeat(heartbeat, from),
                Err(e) => self.report_error(data, from, format!("invalid heartbeat: {}", e)),
            }
        } else if first_name == HEADER_BLOCK_NAME && blocks.len() > 1 {
            let mut blocks = blocks.into_iter();
            let (Some(header), Some(body)) = (blocks.next(), blocks.next()) else {
                return;
            };
            match Message::new(header, body) {
                Ok(mut message) => {
                    for block in blocks {
                        message.push(block);
                    }
                    message.set_original_text(text.into_owned());
                    tracing::debug!("Message from {}, class {}", message.source(), message.class());
                    self.emit(ConnectionEvent::Message { message, from });
                }
                Err(e) => self.report_error(data, from, format!("invalid header: {}", e)),
            }
        } else if first_name == HEADER_BLOCK_NAME {
            self.report_error(data, from, "header with no body".to_string());
        } else {
            self.report_error(data, from, format!("unexpected block '{}'", first.name()));
        }
    }

    fn handle_heartbeat(&mut self, heartbeat: HeartbeatFields, from: SocketAddr) {
        tracing::debug!("Heartbeat from {}, uid {}", heartbeat.source, heartbeat.uid);

        if let Some(LivenessChange::Connected) = self.liveness.heartbeat_heard(&heartbeat.uid) {
            tracing::info!("Own heartbeat heard, connection alive");
            self.state.send_replace(ConnectionState::Alive);
            self.emit(ConnectionEvent::Connected);
        }

        self.emit(ConnectionEvent::Heartbeat { heartbeat, from });
    }

    async fn send_alive_heartbeat(&mut self) {
        if let Some(LivenessChange::Lost) = self.liveness.heartbeat_sent(&self.uid) {
            tracing::warn!("Own heartbeat not heard, connection lost");
            self.state.send_replace(ConnectionState::LostConnection);
            self.emit(ConnectionEvent::LostConnection);
        }

        if let Err(e) = self.send_heartbeat(HeartbeatClass::Alive).await {
            tracing::warn!("Heartbeat send failed: {}", e);
            self.emit(ConnectionEvent::Error {
                raw: Bytes::new(),
                from: None,
                reason: e.to_string(),
            });
        }
        tracing::debug!("Next heartbeat in {:?}", self.liveness.period());
    }

    async fn send_heartbeat(&self, class: HeartbeatClass) -> ConnectionResult<()> {
        let heartbeat = build_heartbeat(class, &self.uid, &self.source, self.interval, Some(self.rx_port));
        self.transmit(heartbeat.to_wire().as_bytes()).await
    }

    async fn transmit(&self, payload: &[u8]) -> ConnectionResult<()> {
        tracing::trace!("Sending {} bytes to {}", payload.len(), self.target);
        self.tx.send_to(payload, self.target).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceAddress;
    use crate::network::ManualScheduler;
    use async_trait::async_trait;
    use tokio_test::assert_err;

    /// Sends succeed, every receive fails
    struct BrokenSocket;

    #[async_trait]
    impl DatagramSocket for BrokenSocket {
        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 3639)))
        }

        async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
            Ok(buf.len())
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
        }
    }

    struct BrokenSockets;

    #[async_trait]
    impl SocketFactory for BrokenSockets {
        async fn bind_receiver(&self, _addr: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>> {
            Ok(Arc::new(BrokenSocket))
        }

        async fn bind_sender(&self, _target: std::net::IpAddr) -> io::Result<Arc<dyn DatagramSocket>> {
            Ok(Arc::new(BrokenSocket))
        }
    }

    fn test_connection() -> Connection {
        let config = ConnectionConfig::new(SourceAddress::new("xfx", "unit-test", "connection"))
            .with_loopback(true);
        Connection::new(config)
    }

    #[tokio::test]
    async fn test_new_connection_is_disconnected() {
        let mut conn = test_connection();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_connected());
        assert!(!conn.is_alive());
        assert!(conn.local_addr().is_none());
        assert!(conn.take_event_receiver().is_some());
        assert!(conn.take_event_receiver().is_none());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let mut conn = test_connection();
        let block = Block::new("test.block", [("key", "value")]).unwrap();

        assert!(matches!(conn.send("text").await, Err(ConnectionError::NotConnected)));
        assert!(matches!(
            conn.send_block("class", block, &Routing::default()).await,
            Err(ConnectionError::NotConnected)
        ));
        assert!(matches!(conn.disconnect().await, Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let mut conn = test_connection().with_scheduler(ManualScheduler::new());
        conn.connect().await.unwrap();
        assert!(conn.is_connected());
        assert!(conn.state().is_connected());
        assert!(matches!(conn.connect().await, Err(ConnectionError::AlreadyConnected)));
        conn.disconnect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_empty_payload_rejected() {
        let mut conn = test_connection().with_scheduler(ManualScheduler::new());
        conn.connect().await.unwrap();
        assert!(matches!(
            conn.send_blocks("class", Vec::new(), &Routing::default()).await,
            Err(ConnectionError::EmptyPayload)
        ));
        assert_err!(conn.send_blocks("", vec![Block::new("b", [("k", "v")]).unwrap()], &Routing::default()).await);
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_returns_to_disconnected() {
        let taken = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = ConnectionConfig::new(SourceAddress::default());
        config.port = taken.local_addr().unwrap().port();

        let mut conn = Connection::new(config);
        assert!(matches!(conn.connect().await, Err(ConnectionError::Bind { .. })));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_recv_error_backoff_grows_to_cap() {
        assert_eq!(recv_error_backoff(1), Duration::from_millis(10));
        assert_eq!(recv_error_backoff(2), Duration::from_millis(20));
        assert_eq!(recv_error_backoff(4), Duration::from_millis(80));
        assert_eq!(recv_error_backoff(8), RECV_ERROR_BACKOFF_MAX);
        assert_eq!(recv_error_backoff(u32::MAX), RECV_ERROR_BACKOFF_MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_receive_is_paced() {
        let mut conn = test_connection()
            .with_scheduler(ManualScheduler::new())
            .with_sockets(BrokenSockets);
        let mut events = conn.take_event_receiver().unwrap();
        conn.connect().await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        conn.disconnect().await.unwrap();

        let mut errors = 0;
        let mut disconnected = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ConnectionEvent::Error { from, reason, .. } => {
                    assert_eq!(from, None);
                    assert!(reason.contains("reset by peer"));
                    errors += 1;
                }
                ConnectionEvent::Disconnected => disconnected = true,
                other => panic!("unexpected event {:?}", other),
            }
        }
        // Failures at 0, 10, 30, 70, 150, 310, 630 and 1270 ms.
        assert!((3..=12).contains(&errors), "{} receive errors in 2s", errors);
        assert!(disconnected);
    }
}
