//! Persistent, self-reconnecting channel to the remote executor.
//!
//! One background task owns the WebSocket. Every successful handshake gets a
//! fresh connection id; inbound events are tagged with it so the consumer can
//! drop anything from a connection that has since been superseded.

pub mod protocol;

pub use protocol::{InboundMessage, ProtocolError};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::session::Command;

/// Channel error types.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("not connected")]
    NotConnected,
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
}

/// Delay before each reconnect attempt. Attempts never stop.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    /// Same delay every time
    Fixed(Duration),
    /// Doubles per consecutive failed attempt up to `max`, with up to 10% jitter
    Backoff { initial: Duration, max: Duration },
}

impl ReconnectPolicy {
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(3000);
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

    /// Delay after `failures` consecutive failed connects (0 after a clean drop).
    pub fn delay(&self, failures: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Backoff { initial, max } => {
                let base = initial.saturating_mul(1 << failures.min(16)).min(*max);
                let spread = base.as_millis() as u64 / 10;
                let jitter = if spread > 0 {
                    rand::random::<u64>() % (spread + 1)
                } else {
                    0
                };
                base + Duration::from_millis(jitter)
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Backoff {
            initial: Self::DEFAULT_DELAY,
            max: Self::DEFAULT_MAX_DELAY,
        }
    }
}

/// An inbound event and the connection it arrived on.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub connection: u64,
    pub message: InboundMessage,
}

#[derive(Default)]
struct Link {
    /// Incremented on every start/stop; a task only acts while its run is current
    run: u64,
    connection: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct Shared {
    state: watch::Sender<ChannelState>,
    link: Mutex<Link>,
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, run: u64, state: ChannelState) -> bool {
        let link = self.link();
        if link.run != run {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    fn open(&self, run: u64, outbound: mpsc::UnboundedSender<String>) -> Option<u64> {
        let mut link = self.link();
        if link.run != run {
            return None;
        }
        link.connection += 1;
        link.outbound = Some(outbound);
        self.state.send_replace(ChannelState::Open);
        Some(link.connection)
    }

    fn close(&self, run: u64, connection: u64) {
        let mut link = self.link();
        if link.run != run || link.connection != connection {
            return;
        }
        link.outbound = None;
        self.state.send_replace(ChannelState::Disconnected);
    }

    fn restart(&self) -> u64 {
        let mut link = self.link();
        link.run += 1;
        link.connection += 1;
        link.outbound = None;
        self.state.send_replace(ChannelState::Disconnected);
        link.run
    }
}

/// Owns the logical connection: connect, send, receive, reconnect.
pub struct ChannelManager {
    url: String,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<Delivery>,
    task: Option<JoinHandle<()>>,
}

impl ChannelManager {
    /// Create a stopped channel and the receiver its deliveries arrive on.
    pub fn new(url: &str, policy: ReconnectPolicy) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (inbound, deliveries) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let channel = Self {
            url: url.to_string(),
            policy,
            shared: Arc::new(Shared {
                state,
                link: Mutex::new(Link::default()),
            }),
            inbound,
            task: None,
        };
        (channel, deliveries)
    }

    /// Start connecting in the background. No-op if already started.
    pub fn start(&mut self) {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let run = self.shared.restart();
        self.task = Some(tokio::spawn(run_channel(
            self.url.clone(),
            self.policy.clone(),
            run,
            self.shared.clone(),
            self.inbound.clone(),
        )));
    }

    /// Disconnect now and cancel any pending reconnect.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.shared.restart();
        tracing::info!("Channel: stopped");
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Id of the newest connection instance.
    pub fn connection_id(&self) -> u64 {
        self.shared.link().connection
    }

    /// Whether a delivery from `connection` may still be applied.
    pub fn is_current(&self, connection: u64) -> bool {
        self.connection_id() == connection
    }

    /// Queue a command on the open connection.
    pub fn send(&self, command: &Command) -> Result<(), ChannelError> {
        let link = self.shared.link();
        let outbound = match (&link.outbound, self.state()) {
            (Some(outbound), ChannelState::Open) => outbound,
            _ => return Err(ChannelError::NotConnected),
        };
        let frame = protocol::encode(command)?;
        outbound.send(frame).map_err(|_| ChannelError::NotConnected)
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Connect, serve, and reconnect until stopped or the consumer goes away.
async fn run_channel(
    url: String,
    policy: ReconnectPolicy,
    run: u64,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<Delivery>,
) {
    let mut failures: u32 = 0;

    loop {
        if !shared.transition(run, ChannelState::Connecting) {
            break;
        }
        tracing::info!("Channel: connecting to {}", url);

        match connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                failures = 0;
                match serve_connection(ws, run, &shared, &inbound).await {
                    Ok(()) => tracing::info!("Channel: connection closed"),
                    Err(e) => tracing::warn!("Channel: connection lost: {}", e),
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                tracing::warn!("Channel: connect to {} failed: {}", url, e);
                shared.transition(run, ChannelState::Disconnected);
            }
        }

        if inbound.is_closed() {
            tracing::info!("Channel: no consumer left, not reconnecting");
            break;
        }
        let delay = policy.delay(failures);
        tracing::info!("Channel: reconnecting in {}ms", delay.as_millis());
        tokio::time::sleep(delay).await;
    }
}

async fn serve_connection(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    run: u64,
    shared: &Shared,
    inbound: &mpsc::UnboundedSender<Delivery>,
) -> Result<(), ChannelError> {
    let (mut sink, mut stream) = ws.split();
    let (outbound, mut frames) = mpsc::unbounded_channel::<String>();
    let Some(connection) = shared.open(run, outbound) else {
        return Ok(());
    };
    tracing::info!("Channel: connected (connection {})", connection);

    let result = loop {
        tokio::select! {
            frame = frames.recv() => {
                // The sender is dropped when the channel is stopped
                let Some(text) = frame else { break Ok(()) };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    break Err(e.into());
                }
            }
            msg = stream.next() => match msg {
                None => break Ok(()),
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(Message::Text(text))) => deliver(connection, &text, inbound),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => deliver(connection, text, inbound),
                    Err(_) => tracing::warn!("Channel: dropped non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) => break Ok(()),
                Some(Ok(_)) => {}
            }
        }
    };

    shared.close(run, connection);
    result
}

/// Decode and forward one frame. Malformed frames are logged and dropped.
fn deliver(connection: u64, text: &str, inbound: &mpsc::UnboundedSender<Delivery>) {
    match protocol::decode(text) {
        Ok(Some(message)) => {
            if inbound.send(Delivery { connection, message }).is_err() {
                tracing::debug!("Channel: delivery dropped, consumer gone");
            }
        }
        Ok(None) => tracing::debug!("Channel: ignoring event without output, error or end time"),
        Err(e) => tracing::warn!("Channel: dropped frame: {}", e),
    }
}
