//! Socket.IO v4 client over a plain websocket: just enough of the Engine.IO
//! framing to connect a namespace, answer pings and exchange events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Url;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use wallet_bridge_core::{
    BridgeError, ListenerId, SocketAnyHandler, SocketChannelPort, SocketConnectorPort,
    SocketHandler, SocketQuery,
};

use crate::socket_listeners::SocketListenerSet;

const ENGINE_PATH: &str = "/socket.io/";

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Value),
    Close,
    Ping,
    Pong,
    Connect { namespace: String, data: Value },
    Disconnect { namespace: String },
    Event {
        namespace: String,
        event: String,
        data: Value,
    },
    ConnectError { namespace: String, data: Value },
    Unsupported(String),
}

fn split_namespace(body: &str) -> (String, &str) {
    if let Some(rest) = body.strip_prefix('/') {
        match rest.find(',') {
            Some(comma) => (format!("/{}", &rest[..comma]), &rest[comma + 1..]),
            None => (body.to_owned(), ""),
        }
    } else {
        ("/".to_owned(), body)
    }
}

fn parse_json(raw: &str) -> Result<Value, BridgeError> {
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(raw)
        .map_err(|e| BridgeError::Transport(format!("socket.io payload decode failed: {e}")))
}

pub fn decode(text: &str) -> Result<Packet, BridgeError> {
    let mut chars = text.chars();
    let engine = chars
        .next()
        .ok_or_else(|| BridgeError::Transport("empty engine.io packet".to_owned()))?;
    let rest = chars.as_str();
    match engine {
        '0' => Ok(Packet::Open(parse_json(rest)?)),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => {
            let mut inner = rest.chars();
            let kind = inner
                .next()
                .ok_or_else(|| BridgeError::Transport("empty socket.io packet".to_owned()))?;
            let (namespace, body) = split_namespace(inner.as_str());
            // Acknowledgement ids precede the payload; they are not used here.
            let body = body.trim_start_matches(|c: char| c.is_ascii_digit());
            match kind {
                '0' => Ok(Packet::Connect {
                    namespace,
                    data: parse_json(body)?,
                }),
                '1' => Ok(Packet::Disconnect { namespace }),
                '2' => {
                    let args = parse_json(body)?;
                    let event = args
                        .get(0)
                        .and_then(Value::as_str)
                        .ok_or_else(|| BridgeError::Transport("socket.io event without name".to_owned()))?
                        .to_owned();
                    let data = args.get(1).cloned().unwrap_or(Value::Null);
                    Ok(Packet::Event {
                        namespace,
                        event,
                        data,
                    })
                }
                '4' => Ok(Packet::ConnectError {
                    namespace,
                    data: parse_json(body)?,
                }),
                _ => Ok(Packet::Unsupported(text.to_owned())),
            }
        }
        _ => Ok(Packet::Unsupported(text.to_owned())),
    }
}

fn namespace_prefix(namespace: &str) -> String {
    if namespace == "/" {
        String::new()
    } else {
        format!("{namespace},")
    }
}

pub fn encode_connect(namespace: &str) -> String {
    format!("40{}", namespace_prefix(namespace))
}

pub fn encode_disconnect(namespace: &str) -> String {
    format!("41{}", namespace_prefix(namespace))
}

pub fn encode_event(namespace: &str, event: &str, data: &Value) -> String {
    format!("42{}{}", namespace_prefix(namespace), json!([event, data]))
}

/// Engine endpoint plus namespace for a server URL such as
/// `wss://api.ethermail.io/events`.
pub fn handshake_url(server: &str, query: &SocketQuery) -> Result<(String, String), BridgeError> {
    let mut url = Url::parse(server)
        .map_err(|e| BridgeError::Validation(format!("invalid websocket server url: {e}")))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(BridgeError::Validation(format!(
                "unsupported websocket scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| BridgeError::Validation("cannot set websocket scheme".to_owned()))?;
    let namespace = match url.path().trim_end_matches('/') {
        "" => "/".to_owned(),
        path => path.to_owned(),
    };
    url.set_path(ENGINE_PATH);
    url.query_pairs_mut()
        .clear()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket")
        .append_pair("token", &query.token)
        .append_pair("deviceId", &query.device_id);
    Ok((url.to_string(), namespace))
}

pub(crate) enum Outbound {
    Text(String),
    Close,
}

/// Delay before each redial after the transport drops: doubles from
/// `initial` up to `max`, and starts over once a namespace connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1_000),
            max: Duration::from_millis(5_000),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// How one websocket session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// The client asked to close; do not redial.
    Closed,
    /// The transport failed; `connected` tells whether the namespace had
    /// connected on it.
    Dropped { connected: bool },
}

/// Client end of a Socket.IO connection that outlives individual
/// websockets. A driver task owns the current websocket, feeds frames
/// through `handle_text` and `gate`, and redials after a drop.
pub struct SocketIoChannel {
    namespace: String,
    listeners: SocketListenerSet,
    client_id: Mutex<Option<String>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Emits issued while the namespace is not connected.
    buffered: Mutex<Vec<String>>,
    /// Set by `disconnect` or a namespace refusal; nothing redials after.
    closed: AtomicBool,
}

impl std::fmt::Debug for SocketIoChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketIoChannel")
            .field("namespace", &self.namespace)
            .field("listeners", &self.listeners)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl SocketIoChannel {
    pub(crate) fn open(
        namespace: String,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            namespace,
            listeners: SocketListenerSet::default(),
            client_id: Mutex::new(None),
            outbound: tx,
            buffered: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        (channel, rx)
    }

    /// Outbound frames wait for the namespace handshake; a disconnect
    /// frame always passes.
    pub(crate) fn gate(&self, text: String) -> Option<String> {
        if self.is_connected() || text.starts_with("41") {
            return Some(text);
        }
        if let Ok(mut g) = self.buffered.lock() {
            g.push(text);
        }
        None
    }

    /// Applies one inbound frame; returns the frames to answer with,
    /// followed by anything buffered once the namespace is connected.
    pub(crate) fn handle_text(&self, text: &str) -> Vec<String> {
        let mut replies = self.apply(text);
        if self.is_connected() {
            if let Ok(mut g) = self.buffered.lock() {
                replies.append(&mut g);
            }
        }
        replies
    }

    pub(crate) fn fail_connect(&self, reason: &str) {
        warn!(reason, "socket.io websocket connect failed");
        self.listeners
            .dispatch("connect_error", &json!({ "message": reason }));
    }

    /// The current websocket is gone. Listeners and buffered emits stay for
    /// the next one.
    pub(crate) fn transport_closed(&self) -> bool {
        let connected = self.is_connected();
        if connected {
            self.mark_disconnected();
        }
        connected
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn apply(&self, text: &str) -> Vec<String> {
        let packet = match decode(text) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "dropping malformed socket.io frame");
                return Vec::new();
            }
        };
        match packet {
            Packet::Open(_) => return vec![encode_connect(&self.namespace)],
            Packet::Ping => return vec!["3".to_owned()],
            Packet::Connect { namespace, data } if namespace == self.namespace => {
                let sid = data.get("sid").and_then(Value::as_str).unwrap_or_default();
                if let Ok(mut g) = self.client_id.lock() {
                    *g = Some(sid.to_owned());
                }
                self.listeners.dispatch("connect", &Value::Null);
            }
            Packet::ConnectError { namespace, data } if namespace == self.namespace => {
                warn!(%data, "socket.io namespace refused the connection");
                self.closed.store(true, Ordering::SeqCst);
                self.listeners.dispatch("connect_error", &data);
            }
            Packet::Event {
                namespace,
                event,
                data,
            } if namespace == self.namespace => {
                debug!(event = %event, "socket.io event");
                self.listeners.dispatch(&event, &data);
            }
            Packet::Disconnect { namespace } if namespace == self.namespace => {
                info!("socket.io server disconnected the namespace");
                self.transport_closed();
            }
            Packet::Close => {
                self.transport_closed();
            }
            _ => {}
        }
        Vec::new()
    }

    fn mark_disconnected(&self) {
        if let Ok(mut g) = self.client_id.lock() {
            *g = None;
        }
        self.listeners.dispatch("disconnect", &Value::Null);
    }

    fn is_connected(&self) -> bool {
        self.client_id.lock().map(|g| g.is_some()).unwrap_or(false)
    }
}

/// Dials until the channel is closed, backing off between attempts.
#[cfg(not(target_arch = "wasm32"))]
async fn drive(
    url: String,
    channel: Arc<SocketIoChannel>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    policy: ReconnectPolicy,
) {
    use tokio_tungstenite::connect_async;

    let mut attempt = 0u32;
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => match run_session(ws, &channel, &mut outbound).await {
                SessionEnd::Closed => break,
                SessionEnd::Dropped { connected } => {
                    if connected {
                        attempt = 0;
                    }
                }
            },
            Err(e) => channel.fail_connect(&e.to_string()),
        }
        if channel.is_closed() {
            break;
        }
        let delay = policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        info!(attempt, ?delay, "socket.io reconnecting");
        if !back_off(tokio::time::sleep(delay), &channel, &mut outbound).await {
            break;
        }
    }
    channel.transport_closed();
    debug!(namespace = %channel.namespace, "socket.io driver stopped");
}

/// Waits for `sleep` while parking emits in the channel buffer. False when
/// the client closed the channel meanwhile.
pub(crate) async fn back_off(
    sleep: impl std::future::Future<Output = ()>,
    channel: &SocketIoChannel,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> bool {
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            biased;
            () = &mut sleep => return !channel.is_closed(),
            frame = outbound.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    // Only a disconnect frame passes the gate here, with no
                    // websocket to carry it.
                    let _ = channel.gate(text);
                }
                Some(Outbound::Close) | None => return false,
            },
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
async fn run_session<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    channel: &SocketIoChannel,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::protocol::Message;

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(Outbound::Text(text)) => {
                    let Some(text) = channel.gate(text) else {
                        continue;
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(error = %e, "socket.io send failed");
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    channel.transport_closed();
                    return SessionEnd::Closed;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let mut failed = false;
                    for reply in channel.handle_text(&text) {
                        if let Err(e) = sink.send(Message::Text(reply)).await {
                            warn!(error = %e, "socket.io send failed");
                            failed = true;
                            break;
                        }
                    }
                    if failed {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "socket.io server closed the connection");
                    break;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "socket.io websocket error");
                    break;
                }
                None => break,
                _ => {}
            }
        }
    }
    SessionEnd::Dropped {
        connected: channel.transport_closed(),
    }
}

impl SocketChannelPort for SocketIoChannel {
    fn id(&self) -> Option<String> {
        self.client_id.lock().ok().and_then(|g| g.clone())
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Disconnected);
        }
        self.outbound
            .send(Outbound::Text(encode_event(&self.namespace, event, &payload)))
            .map_err(|_| BridgeError::Disconnected)
    }

    fn on(&self, event: &str, handler: SocketHandler) -> ListenerId {
        self.listeners.on(event, handler)
    }

    fn once(&self, event: &str, handler: SocketHandler) -> ListenerId {
        self.listeners.once(event, handler)
    }

    fn on_any(&self, handler: SocketAnyHandler) -> ListenerId {
        self.listeners.on_any(handler)
    }

    fn off(&self, id: ListenerId) -> bool {
        self.listeners.off(id)
    }

    fn remove_all_listeners(&self) {
        self.listeners.clear();
    }

    fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .outbound
            .send(Outbound::Text(encode_disconnect(&self.namespace)));
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Opens Socket.IO connections on the ambient tokio runtime.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Debug, Clone, Default)]
pub struct SocketIoConnector {
    policy: ReconnectPolicy,
}

#[cfg(not(target_arch = "wasm32"))]
impl SocketIoConnector {
    pub fn with_policy(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl SocketConnectorPort for SocketIoConnector {
    fn connect(
        &self,
        url: &str,
        query: &SocketQuery,
    ) -> Result<Arc<dyn SocketChannelPort>, BridgeError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BridgeError::Transport(format!("socket.io needs a tokio runtime: {e}")))?;
        let (endpoint, namespace) = handshake_url(url, query)?;
        let (channel, rx) = SocketIoChannel::open(namespace);
        info!(namespace = %channel.namespace, "opening socket.io connection");
        runtime.spawn(drive(endpoint, Arc::clone(&channel), rx, self.policy));
        Ok(channel as Arc<dyn SocketChannelPort>)
    }
}
