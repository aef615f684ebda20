//! Transport connection with status tracking, heartbeat, and auto-reconnect.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use tether_shared::{ControlFrame, TransportError};

use crate::config::ConnectionConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Status of a transport connection.
///
/// Transitions are `Connecting -> Connected -> (Disconnected | Error) ->
/// Connecting` on retry, or terminal `Disconnected` on explicit close or
/// after the reconnect cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Registered payload subscriber on a connection.
struct Subscriber {
    id: String,
    channel: String,
    callback: Arc<dyn Fn(Value) + Send + Sync>,
}

/// Handle returned by [`WsConnection::on_status_change`]; removes the
/// listener when consumed.
pub struct StatusListener {
    inner: Arc<Inner>,
    id: u64,
}

impl StatusListener {
    /// Remove the listener from the connection.
    pub fn unsubscribe(self) {
        self.inner
            .status_listeners
            .lock()
            .expect("status listener registry poisoned")
            .retain(|(id, _)| *id != self.id);
    }
}

struct Inner {
    url: String,
    config: ConnectionConfig,
    status: Mutex<ConnectionStatus>,
    /// Awaitable mirror of `status` for callers that want to wait for a
    /// transition instead of polling.
    status_tx: tokio::sync::watch::Sender<ConnectionStatus>,
    status_listeners: Mutex<Vec<(u64, Arc<dyn Fn(ConnectionStatus) + Send + Sync>)>>,
    next_listener_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
    /// Sender into the write task of the current socket session; `None`
    /// while not connected.
    wire: Mutex<Option<UnboundedSender<Message>>>,
    /// Set by `disconnect()`; suppresses any further reconnect.
    closed: AtomicBool,
    /// Serializes handshake attempts so concurrent callers and the internal
    /// retry loop never race a duplicate socket.
    connect_lock: tokio::sync::Mutex<()>,
    reconnect_attempts: AtomicU32,
}

impl Inner {
    fn status(&self) -> ConnectionStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    fn set_status(&self, next: ConnectionStatus) {
        {
            let mut status = self.status.lock().expect("status lock poisoned");
            if *status == next {
                return;
            }
            *status = next;
        }
        let _ = self.status_tx.send_replace(next);
        let listeners: Vec<_> = self
            .status_listeners
            .lock()
            .expect("status listener registry poisoned")
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(next))).is_err() {
                crate::log_error!("status listener panicked on {} -> {:?}", self.url, next);
            }
        }
    }

    fn send_raw(&self, message: Message) -> bool {
        let wire = self.wire.lock().expect("wire lock poisoned");
        match wire.as_ref() {
            Some(tx) => tx.unbounded_send(message).is_ok(),
            None => false,
        }
    }

    /// One serialized handshake attempt. Used by both the public `connect`
    /// and the internal retry loop.
    async fn establish(self: &Arc<Self>) -> Result<(), TransportError> {
        let _guard = self.connect_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.status().is_connected() {
            return Ok(());
        }
        self.set_status(ConnectionStatus::Connecting);
        match connect_async(self.url.as_str()).await {
            Ok((stream, _response)) => {
                self.install(stream);
                Ok(())
            }
            Err(e) => {
                self.set_status(ConnectionStatus::Error);
                Err(TransportError::Handshake(e.to_string()))
            }
        }
    }

    /// Wire up a freshly opened socket: write task, heartbeat, read loop,
    /// and re-announcement of registered subscribers.
    fn install(self: &Arc<Self>, stream: WsStream) {
        if self.closed.load(Ordering::SeqCst) {
            self.set_status(ConnectionStatus::Disconnected);
            return;
        }

        let (sink, read) = stream.split();
        let (tx, rx) = unbounded::<Message>();
        {
            let mut wire = self.wire.lock().expect("wire lock poisoned");
            *wire = Some(tx.clone());
        }
        self.reconnect_attempts.store(0, Ordering::SeqCst);

        tokio::spawn(write_loop(sink, rx));
        tokio::spawn(heartbeat_loop(
            tx,
            self.config.heartbeat_interval,
            self.url.clone(),
        ));

        self.set_status(ConnectionStatus::Connected);
        self.announce_subscribers();

        let inner = self.clone();
        tokio::spawn(async move {
            inner.read_loop(read).await;
        });
    }

    /// Send a wire-level subscribe frame for every registered subscriber.
    /// Runs once per successful (re)connect.
    fn announce_subscribers(&self) {
        let frames: Vec<ControlFrame> = self
            .subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .iter()
            .map(|sub| ControlFrame::Subscribe {
                channel: sub.channel.clone(),
                id: sub.id.clone(),
            })
            .collect();
        for frame in frames {
            let _ = self.send_raw(Message::Text(frame.to_wire().into()));
        }
    }

    async fn read_loop(self: Arc<Self>, mut read: SplitStream<WsStream>) {
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => self.handle_text(text.as_str()),
                Ok(Message::Close(_)) => break,
                // ws-level ping/pong is answered by tungstenite itself
                Ok(_) => {}
                Err(e) => {
                    crate::log_error!("read error on {}: {}", self.url, e);
                    break;
                }
            }
        }

        {
            let mut wire = self.wire.lock().expect("wire lock poisoned");
            wire.take();
        }

        if self.closed.load(Ordering::SeqCst) {
            self.set_status(ConnectionStatus::Disconnected);
            return;
        }

        crate::log_warn!("connection to {} closed unexpectedly", self.url);
        // Move off `Connected` before retrying: the retry loop and any
        // concurrent `connect` caller treat a `Connected` status as "someone
        // else already re-established the session" and bail out.
        self.set_status(ConnectionStatus::Error);
        self.reconnect_loop().await;
    }

    /// Exponential-backoff retry after an unexpected close. Gives up after
    /// `max_reconnect_attempts` consecutive failures.
    async fn reconnect_loop(self: Arc<Self>) {
        let max = self.config.max_reconnect_attempts;
        loop {
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > max {
                crate::log_warn!("giving up on {} after {} reconnect attempts", self.url, max);
                self.set_status(ConnectionStatus::Disconnected);
                return;
            }
            let delay = self.config.delay_for_attempt(attempt);
            crate::log_info!(
                "reconnecting to {} in {:?} (attempt {}/{})",
                self.url,
                delay,
                attempt,
                max
            );
            tokio::time::sleep(delay).await;
            if self.closed.load(Ordering::SeqCst) || self.status().is_connected() {
                return;
            }
            match self.establish().await {
                Ok(()) => return,
                Err(e) => {
                    crate::log_error!("reconnect attempt {} to {} failed: {}", attempt, self.url, e);
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                crate::log_warn!("dropping malformed frame from {}: {}", self.url, e);
                return;
            }
        };

        if let Some(frame) = ControlFrame::from_value(&value) {
            match frame {
                ControlFrame::Pong => crate::log_debug!("heartbeat pong from {}", self.url),
                ControlFrame::Ping => {
                    let _ = self.send_raw(Message::Text(ControlFrame::Pong.to_wire().into()));
                }
                other => crate::log_debug!("ignoring control frame from server: {:?}", other),
            }
            return;
        }

        self.dispatch(value);
    }

    /// Deliver a payload to every subscriber in registration order. A
    /// panicking callback is logged and must not break dispatch to the rest.
    fn dispatch(&self, value: Value) {
        let targets: Vec<(String, Arc<dyn Fn(Value) + Send + Sync>)> = self
            .subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .iter()
            .map(|sub| (sub.id.clone(), sub.callback.clone()))
            .collect();
        for (id, callback) in targets {
            let payload = value.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                crate::log_error!("subscriber {} panicked handling a frame from {}", id, self.url);
            }
        }
    }
}

/// A managed WebSocket connection to a single endpoint.
#[derive(Clone)]
pub struct WsConnection {
    inner: Arc<Inner>,
}

impl WsConnection {
    /// Create a connection in the `Disconnected` state; call
    /// [`WsConnection::connect`] to open it.
    pub fn new(url: impl Into<String>, config: ConnectionConfig) -> Self {
        let (status_tx, _status_rx) = tokio::sync::watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                config,
                status: Mutex::new(ConnectionStatus::Disconnected),
                status_tx,
                status_listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
                wire: Mutex::new(None),
                closed: AtomicBool::new(false),
                connect_lock: tokio::sync::Mutex::new(()),
                reconnect_attempts: AtomicU32::new(0),
            }),
        }
    }

    /// Endpoint URL this connection targets.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Open the socket, resolving once the handshake completes. Starts the
    /// heartbeat on success. A failed handshake leaves status `Error` and
    /// does not retry; retries only follow unexpected closes of an
    /// established connection.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        self.inner.establish().await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    /// Number of reconnect attempts made since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Serialize and write a payload if connected; otherwise a logged no-op.
    /// Sends are best-effort while reconnecting and never error.
    pub fn send(&self, payload: &Value) {
        if !self.status().is_connected() {
            crate::log_warn!("dropping send to {}: not connected", self.inner.url);
            return;
        }
        match serde_json::to_string(payload) {
            Ok(json) => {
                if !self.inner.send_raw(Message::Text(json.into())) {
                    crate::log_warn!("dropping send to {}: session is shutting down", self.inner.url);
                }
            }
            Err(e) => crate::log_error!("failed to serialize payload for {}: {}", self.inner.url, e),
        }
    }

    /// Send a control frame if connected; best-effort like [`Self::send`].
    pub(crate) fn send_frame(&self, frame: &ControlFrame) {
        if !self.status().is_connected() {
            crate::log_debug!("dropping control frame to {}: not connected", self.inner.url);
            return;
        }
        let _ = self.inner.send_raw(Message::Text(frame.to_wire().into()));
    }

    /// Register a payload subscriber on a logical channel, returning its id.
    /// If the connection is up, a wire-level subscribe frame announces the
    /// interest immediately; otherwise it is announced on the next connect.
    pub fn subscribe(
        &self,
        channel: &str,
        callback: impl Fn(Value) + Send + Sync + 'static,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.inner
            .subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .push(Subscriber {
                id: id.clone(),
                channel: channel.to_string(),
                callback: Arc::new(callback),
            });
        self.send_frame(&ControlFrame::Subscribe {
            channel: channel.to_string(),
            id: id.clone(),
        });
        id
    }

    /// Remove a subscriber; withdraws the wire-level interest if connected.
    pub fn unsubscribe(&self, id: &str) {
        let channel = {
            let mut subscribers = self
                .inner
                .subscribers
                .lock()
                .expect("subscriber registry poisoned");
            let position = subscribers.iter().position(|sub| sub.id == id);
            position.map(|index| subscribers.remove(index).channel)
        };
        if let Some(channel) = channel {
            self.send_frame(&ControlFrame::Unsubscribe {
                channel,
                id: id.to_string(),
            });
        }
    }

    /// Register a status listener, invoked synchronously on every
    /// transition. The returned handle removes it again.
    pub fn on_status_change(
        &self,
        listener: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> StatusListener {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .status_listeners
            .lock()
            .expect("status listener registry poisoned")
            .push((id, Arc::new(listener)));
        StatusListener {
            inner: self.inner.clone(),
            id,
        }
    }

    /// Wait until the connection reaches the given status.
    pub async fn wait_for_status(&self, target: ConnectionStatus) {
        let mut rx = self.inner.status_tx.subscribe();
        loop {
            if *rx.borrow() == target {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Close the socket with a normal-closure code and cancel all timers.
    /// Terminal: no reconnect follows until `connect` is called again.
    pub fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        {
            let mut wire = self.inner.wire.lock().expect("wire lock poisoned");
            if let Some(tx) = wire.take() {
                let _ = tx.unbounded_send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                })));
            }
        }
        self.inner.set_status(ConnectionStatus::Disconnected);
    }

    /// Whether two handles refer to the same underlying connection.
    pub fn same_connection(&self, other: &WsConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: UnboundedReceiver<Message>) {
    while let Some(message) = rx.next().await {
        let is_close = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() {
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Sends an application-level ping every `interval` while the session is
/// alive. Pong replies are consumed by the read loop. Absence of a pong does
/// not trigger a reconnect; close detection is transport-level.
async fn heartbeat_loop(
    tx: UnboundedSender<Message>,
    interval: std::time::Duration,
    url: String,
) {
    loop {
        tokio::time::sleep(interval).await;
        crate::log_debug!("heartbeat ping to {}", url);
        if tx
            .unbounded_send(Message::Text(ControlFrame::Ping.to_wire().into()))
            .is_err()
        {
            return;
        }
    }
}
