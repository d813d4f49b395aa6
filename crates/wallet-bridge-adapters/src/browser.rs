//! Browser host bindings: the window as message source, local storage for the
//! bearer token, DOM custom events for token errors.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gloo_timers::future::TimeoutFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use wasm_bindgen::closure::Closure;
use wasm_bindgen::{JsCast, JsValue};

use wallet_bridge_core::{
    BridgeError, CallerInfo, EnvironmentDescriptor, FrameHandler, FrameMessage, ListenerId,
    MessageSourcePort, PageContextPort, SignalPort, SocketChannelPort, SocketConnectorPort,
    SocketQuery, TokenErrorKind, TokenStorePort,
};

use crate::socketio::{
    back_off, handshake_url, Outbound, ReconnectPolicy, SessionEnd, SocketIoChannel,
};

pub const TOKEN_ERROR_EVENT: &str = "EtherMailTokenError";

type MessageClosure = Closure<dyn FnMut(web_sys::MessageEvent)>;

thread_local! {
    static MESSAGE_CLOSURES: RefCell<HashMap<ListenerId, MessageClosure>> =
        RefCell::new(HashMap::new());
}

fn window() -> Result<web_sys::Window, BridgeError> {
    web_sys::window().ok_or_else(|| BridgeError::Transport("window is unavailable".to_owned()))
}

fn to_js(value: &Value) -> Result<JsValue, BridgeError> {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(|e| BridgeError::Transport(format!("failed to encode message: {e}")))
}

/// `message` events on the window, posting replies to the parent frame.
#[derive(Debug)]
pub struct WindowMessageSource {
    target_origin: String,
    next_id: AtomicU64,
}

impl WindowMessageSource {
    /// Posts are restricted to `target_origin`, the trusted app url.
    pub fn new(target_origin: impl Into<String>) -> Self {
        Self {
            target_origin: target_origin.into(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl MessageSourcePort for WindowMessageSource {
    fn add_listener(&self, handler: FrameHandler) -> ListenerId {
        let Ok(window) = window() else {
            return 0;
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let closure = MessageClosure::new(move |event: web_sys::MessageEvent| {
            let Ok(data) = serde_wasm_bindgen::from_value::<Value>(event.data()) else {
                return;
            };
            handler(&FrameMessage {
                origin: event.origin(),
                data,
            });
        });
        if let Err(e) =
            window.add_event_listener_with_callback("message", closure.as_ref().unchecked_ref())
        {
            tracing::warn!(error = ?e, "failed to attach message listener");
            return 0;
        }
        MESSAGE_CLOSURES.with(|closures| closures.borrow_mut().insert(id, closure));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let Some(closure) = MESSAGE_CLOSURES.with(|closures| closures.borrow_mut().remove(&id))
        else {
            return false;
        };
        if let Ok(window) = window() {
            let _ = window
                .remove_event_listener_with_callback("message", closure.as_ref().unchecked_ref());
        }
        true
    }

    fn post_to_parent(&self, message: Value) -> Result<(), BridgeError> {
        let parent = window()?
            .parent()
            .map_err(|e| BridgeError::Transport(format!("parent frame lookup failed: {e:?}")))?
            .ok_or_else(|| BridgeError::Transport("no parent frame".to_owned()))?;
        parent
            .post_message(&to_js(&message)?, &self.target_origin)
            .map_err(|e| BridgeError::Transport(format!("postMessage failed: {e:?}")))
    }
}

/// Bearer token in `localStorage` under a fixed key.
#[derive(Debug, Clone)]
pub struct LocalStorageTokenStore {
    key: String,
}

impl LocalStorageTokenStore {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    fn storage(&self) -> Option<web_sys::Storage> {
        window().ok()?.local_storage().ok().flatten()
    }
}

impl TokenStorePort for LocalStorageTokenStore {
    fn load(&self) -> Option<String> {
        self.storage()?.get_item(&self.key).ok().flatten()
    }

    fn store(&self, token: &str) {
        if let Some(storage) = self.storage() {
            let _ = storage.set_item(&self.key, token);
        }
    }

    fn clear(&self) {
        if let Some(storage) = self.storage() {
            let _ = storage.remove_item(&self.key);
        }
    }
}

/// Raises `EtherMailTokenError` with `detail: { type }` on the window.
#[derive(Debug, Clone, Default)]
pub struct WindowSignals;

impl SignalPort for WindowSignals {
    fn dispatch(&self, kind: TokenErrorKind) {
        let Ok(window) = window() else {
            return;
        };
        let Ok(detail) = to_js(&serde_json::json!({ "type": kind })) else {
            return;
        };
        let init = web_sys::CustomEventInit::new();
        init.set_detail(&detail);
        match web_sys::CustomEvent::new_with_event_init_dict(TOKEN_ERROR_EVENT, &init) {
            Ok(event) => {
                let _ = window.dispatch_event(&event);
            }
            Err(e) => tracing::warn!(error = ?e, "failed to build token error event"),
        }
    }
}

/// Caller metadata read from the current document.
#[derive(Debug, Clone, Default)]
pub struct DocumentPageContext;

impl PageContextPort for DocumentPageContext {
    fn caller_info(&self) -> CallerInfo {
        let Ok(window) = window() else {
            return CallerInfo::default();
        };
        let origin = window.location().origin().unwrap_or_default();
        let document = window.document();
        let title = document.as_ref().map(|d| d.title());
        let icon = document
            .and_then(|d| d.query_selector("link[rel=\"icon\"]").ok().flatten())
            .and_then(|link| link.get_attribute("href"));
        CallerInfo::from_page(&origin, title.as_deref(), icon.as_deref())
    }
}

/// One browser `WebSocket` plus the callbacks keeping it wired to the
/// channel. `dropped` fires when the browser closes it.
struct BrowserSession {
    ws: web_sys::WebSocket,
    dropped: mpsc::UnboundedReceiver<()>,
    _callbacks: (MessageClosure, EventClosure, EventClosure),
}

type EventClosure = Closure<dyn FnMut(web_sys::Event)>;

impl BrowserSession {
    fn open(endpoint: &str, channel: &Arc<SocketIoChannel>) -> Result<Self, BridgeError> {
        let ws = web_sys::WebSocket::new(endpoint)
            .map_err(|e| BridgeError::Transport(format!("websocket open failed: {e:?}")))?;

        let inbound = Arc::clone(channel);
        let reply_ws = ws.clone();
        let on_message = MessageClosure::new(move |event: web_sys::MessageEvent| {
            let Some(text) = event.data().as_string() else {
                return;
            };
            for reply in inbound.handle_text(&text) {
                let _ = reply_ws.send_with_str(&reply);
            }
        });
        ws.set_onmessage(Some(on_message.as_ref().unchecked_ref()));

        let errored = Arc::clone(channel);
        let on_error = EventClosure::new(move |_: web_sys::Event| {
            if errored.id().is_none() {
                errored.fail_connect("websocket error");
            }
        });
        ws.set_onerror(Some(on_error.as_ref().unchecked_ref()));

        let (signal, dropped) = mpsc::unbounded_channel();
        let on_close = EventClosure::new(move |_: web_sys::Event| {
            let _ = signal.send(());
        });
        ws.set_onclose(Some(on_close.as_ref().unchecked_ref()));

        Ok(Self {
            ws,
            dropped,
            _callbacks: (on_message, on_error, on_close),
        })
    }

    async fn pump(
        &mut self,
        channel: &SocketIoChannel,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                biased;
                _ = self.dropped.recv() => {
                    return SessionEnd::Dropped {
                        connected: channel.transport_closed(),
                    };
                }
                frame = outbound.recv() => match frame {
                    Some(Outbound::Text(text)) => {
                        if let Some(text) = channel.gate(text) {
                            if let Err(e) = self.ws.send_with_str(&text) {
                                tracing::warn!(error = ?e, "websocket send failed");
                            }
                        }
                    }
                    Some(Outbound::Close) | None => {
                        channel.transport_closed();
                        return SessionEnd::Closed;
                    }
                },
            }
        }
    }

    fn close(self) {
        self.ws.set_onmessage(None);
        self.ws.set_onerror(None);
        self.ws.set_onclose(None);
        let _ = self.ws.close();
    }
}

/// Socket.IO over the browser `WebSocket`, redialing after drops.
#[derive(Debug, Clone, Default)]
pub struct BrowserSocketConnector {
    policy: ReconnectPolicy,
}

impl BrowserSocketConnector {
    pub fn with_policy(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }
}

impl SocketConnectorPort for BrowserSocketConnector {
    fn connect(
        &self,
        url: &str,
        query: &SocketQuery,
    ) -> Result<Arc<dyn SocketChannelPort>, BridgeError> {
        let (endpoint, namespace) = handshake_url(url, query)?;
        let (channel, mut outbound) = SocketIoChannel::open(namespace);
        let first = BrowserSession::open(&endpoint, &channel)?;

        let driver = Arc::clone(&channel);
        let policy = self.policy;
        wasm_bindgen_futures::spawn_local(async move {
            let mut session = Some(first);
            let mut attempt = 0u32;
            loop {
                if let Some(mut current) = session.take() {
                    let end = current.pump(&driver, &mut outbound).await;
                    current.close();
                    match end {
                        SessionEnd::Closed => break,
                        SessionEnd::Dropped { connected: true } => attempt = 0,
                        SessionEnd::Dropped { connected: false } => {}
                    }
                }
                if driver.is_closed() {
                    break;
                }
                let delay = policy.delay(attempt);
                attempt = attempt.saturating_add(1);
                tracing::info!(attempt, ?delay, "socket.io reconnecting");
                let millis = u32::try_from(delay.as_millis()).unwrap_or(u32::MAX);
                if !back_off(TimeoutFuture::new(millis), &driver, &mut outbound).await {
                    break;
                }
                match BrowserSession::open(&endpoint, &driver) {
                    Ok(next) => session = Some(next),
                    Err(e) => driver.fail_connect(&e.to_string()),
                }
            }
            driver.transport_closed();
        });
        Ok(channel as Arc<dyn SocketChannelPort>)
    }
}

/// Current page URL, for `capture_callback_token`.
pub fn page_url() -> Result<String, BridgeError> {
    window()?
        .location()
        .href()
        .map_err(|e| BridgeError::Transport(format!("location lookup failed: {e:?}")))
}

/// Embedded when the parent browsing context is not this window; trusted
/// when the injected provider identifies as the wallet host.
pub fn detect_environment() -> EnvironmentDescriptor {
    let Ok(window) = window() else {
        return EnvironmentDescriptor::top_level();
    };
    let is_embedded = match window.parent() {
        Ok(Some(parent)) => !js_sys::Object::is(&parent, &window),
        _ => false,
    };
    let is_trusted_wallet_host = js_sys::Reflect::get(&window, &JsValue::from_str("ethereum"))
        .ok()
        .filter(|provider| provider.is_object())
        .and_then(|provider| js_sys::Reflect::get(&provider, &JsValue::from_str("isEtherMail")).ok())
        .map(|flag| flag.is_truthy())
        .unwrap_or(false);
    EnvironmentDescriptor {
        is_embedded,
        is_trusted_wallet_host,
    }
}
