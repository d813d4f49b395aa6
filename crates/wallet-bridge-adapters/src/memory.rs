//! In-process hosts: a shared message source standing in for the window and
//! a socket hub standing in for the events server.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use wallet_bridge_core::{
    BridgeError, FrameHandler, FrameMessage, ListenerId, MessageSourcePort, SocketAnyHandler,
    SocketChannelPort, SocketConnectorPort, SocketHandler, SocketQuery,
};

use crate::socket_listeners::SocketListenerSet;

/// Produces the parent's answers to a posted message.
pub type FrameResponder = Arc<dyn Fn(&Value) -> Vec<FrameMessage> + Send + Sync>;

#[derive(Default)]
struct SourceState {
    next_id: ListenerId,
    listeners: Vec<(ListenerId, FrameHandler)>,
    posted: Vec<Value>,
    responder: Option<FrameResponder>,
}

/// Window-like message source shared by every listener on the page.
#[derive(Clone, Default)]
pub struct MemoryMessageSource {
    state: Arc<Mutex<SourceState>>,
}

impl std::fmt::Debug for MemoryMessageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMessageSource")
            .field("listeners", &self.listener_count())
            .field("posted", &self.posted().len())
            .finish()
    }
}

impl MemoryMessageSource {
    /// Answers every post synchronously through `responder`.
    pub fn with_responder(responder: FrameResponder) -> Self {
        let source = Self::default();
        if let Ok(mut g) = source.state.lock() {
            g.responder = Some(responder);
        }
        source
    }

    /// Delivers a message to every listener, in registration order.
    pub fn deliver(&self, origin: &str, data: Value) -> usize {
        let handlers: Vec<FrameHandler> = match self.state.lock() {
            Ok(g) => g.listeners.iter().map(|(_, h)| Arc::clone(h)).collect(),
            Err(_) => return 0,
        };
        let message = FrameMessage {
            origin: origin.to_owned(),
            data,
        };
        for handler in &handlers {
            handler(&message);
        }
        handlers.len()
    }

    pub fn posted(&self) -> Vec<Value> {
        self.state
            .lock()
            .map(|g| g.posted.clone())
            .unwrap_or_default()
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().map(|g| g.listeners.len()).unwrap_or(0)
    }
}

impl MessageSourcePort for MemoryMessageSource {
    fn add_listener(&self, handler: FrameHandler) -> ListenerId {
        let Ok(mut g) = self.state.lock() else {
            return 0;
        };
        g.next_id = g.next_id.saturating_add(1);
        let id = g.next_id;
        g.listeners.push((id, handler));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let Ok(mut g) = self.state.lock() else {
            return false;
        };
        let before = g.listeners.len();
        g.listeners.retain(|(listener_id, _)| *listener_id != id);
        g.listeners.len() != before
    }

    fn post_to_parent(&self, message: Value) -> Result<(), BridgeError> {
        let responder = {
            let mut g = self
                .state
                .lock()
                .map_err(|e| BridgeError::Transport(format!("message source lock poisoned: {e}")))?;
            g.posted.push(message.clone());
            g.responder.clone()
        };
        if let Some(responder) = responder {
            for reply in responder(&message) {
                self.deliver(&reply.origin, reply.data);
            }
        }
        Ok(())
    }
}

/// Produces server pushes in answer to a client emit.
pub type SocketResponder = Arc<dyn Fn(&str, &Value) -> Vec<(String, Value)> + Send + Sync>;

#[derive(Default)]
struct SocketState {
    client_id: Option<String>,
    emitted: Vec<(String, Value)>,
    disconnected: bool,
    responder: Option<SocketResponder>,
}

/// Client end of an in-process socket; the test drives the server side.
#[derive(Default)]
pub struct MemorySocket {
    state: Mutex<SocketState>,
    listeners: SocketListenerSet,
}

impl std::fmt::Debug for MemorySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySocket")
            .field("listeners", &self.listeners)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

impl MemorySocket {
    /// Marks the channel connected and raises `connect`.
    pub fn server_connect(&self, client_id: &str) {
        if let Ok(mut g) = self.state.lock() {
            g.client_id = Some(client_id.to_owned());
        }
        self.listeners.dispatch("connect", &Value::Null);
    }

    /// Drops the connection without closing the channel; the client keeps
    /// its listeners and waits for the next `server_connect`.
    pub fn server_disconnect(&self) {
        if let Ok(mut g) = self.state.lock() {
            g.client_id = None;
        }
        self.listeners.dispatch("disconnect", &Value::Null);
    }

    pub fn server_push(&self, event: &str, payload: Value) -> usize {
        debug!(event, "memory socket push");
        self.listeners.dispatch(event, &payload)
    }

    pub fn set_responder(&self, responder: SocketResponder) {
        if let Ok(mut g) = self.state.lock() {
            g.responder = Some(responder);
        }
    }

    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.state
            .lock()
            .map(|g| g.emitted.clone())
            .unwrap_or_default()
    }

    pub fn emitted_on(&self, event: &str) -> Vec<Value> {
        self.emitted()
            .into_iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.lock().map(|g| g.disconnected).unwrap_or(true)
    }
}

impl SocketChannelPort for MemorySocket {
    fn id(&self) -> Option<String> {
        self.state.lock().ok().and_then(|g| g.client_id.clone())
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), BridgeError> {
        let responder = {
            let mut g = self
                .state
                .lock()
                .map_err(|e| BridgeError::Transport(format!("socket lock poisoned: {e}")))?;
            if g.disconnected {
                return Err(BridgeError::Disconnected);
            }
            g.emitted.push((event.to_owned(), payload.clone()));
            g.responder.clone()
        };
        if let Some(responder) = responder {
            for (name, data) in responder(event, &payload) {
                self.listeners.dispatch(&name, &data);
            }
        }
        Ok(())
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
        if let Ok(mut g) = self.state.lock() {
            g.disconnected = true;
            g.client_id = None;
        }
    }
}

/// Connection attempt seen by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConnection {
    pub url: String,
    pub query: SocketQuery,
}

/// Hands out in-process sockets and remembers every connection attempt.
#[derive(Clone, Default)]
pub struct MemorySocketHub {
    state: Arc<Mutex<Vec<(SocketConnection, Arc<MemorySocket>)>>>,
    auto_connect: Option<String>,
}

impl std::fmt::Debug for MemorySocketHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySocketHub")
            .field("connections", &self.connections().len())
            .finish()
    }
}

impl MemorySocketHub {
    /// Sockets handed out already carry `client_id`, as if the handshake
    /// completed before the first send.
    pub fn connected_as(client_id: &str) -> Self {
        Self {
            auto_connect: Some(client_id.to_owned()),
            ..Self::default()
        }
    }

    pub fn connections(&self) -> Vec<SocketConnection> {
        self.state
            .lock()
            .map(|g| g.iter().map(|(c, _)| c.clone()).collect())
            .unwrap_or_default()
    }

    pub fn last_socket(&self) -> Option<Arc<MemorySocket>> {
        self.state
            .lock()
            .ok()
            .and_then(|g| g.last().map(|(_, s)| Arc::clone(s)))
    }
}

impl SocketConnectorPort for MemorySocketHub {
    fn connect(
        &self,
        url: &str,
        query: &SocketQuery,
    ) -> Result<Arc<dyn SocketChannelPort>, BridgeError> {
        let socket = Arc::new(MemorySocket::default());
        if let Some(client_id) = &self.auto_connect {
            if let Ok(mut g) = socket.state.lock() {
                g.client_id = Some(client_id.clone());
            }
        }
        let mut g = self
            .state
            .lock()
            .map_err(|e| BridgeError::Transport(format!("socket hub lock poisoned: {e}")))?;
        g.push((
            SocketConnection {
                url: url.to_owned(),
                query: query.clone(),
            },
            Arc::clone(&socket),
        ));
        Ok(socket as Arc<dyn SocketChannelPort>)
    }
}
