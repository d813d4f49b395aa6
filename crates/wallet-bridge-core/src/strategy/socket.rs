use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::domain::{ExternalEvent, ListenerConfig, StrategyKind, TokenErrorKind};
use crate::envelope::RequestEnvelope;
use crate::listeners::{lock, ScopedListeners};
use crate::ports::{
    BridgeError, ListenerId, SessionPort, SignalPort, SocketAnyHandler, SocketChannelPort,
    SocketConnectorPort, SocketHandler, SocketQuery,
};
use crate::strategy::{
    await_completion, classify_reply, present, reply_matches, Completion, ListenerSlot,
    OnceCompletion, ReplyCallback, TransportStrategy,
};

pub const CONNECT: &str = "connect";
pub const CONNECT_ERROR: &str = "connect_error";
pub const DISCONNECT: &str = "disconnect";
pub const TOKEN_ERROR: &str = "token-error";
pub const WALLET_ACTION: &str = "wallet-action";
pub const WALLET_ACTION_RESPONSE: &str = "wallet-action-response";
const ANY_EVENT: &str = "*";

/// Bearer-token authenticated channel to the wallet backend.
///
/// Wallet actions are matched to server acknowledgements last-in-first-out:
/// an ack is assumed to answer the most recently issued action. Two
/// signature-class calls in flight at once can swap results, so callers
/// must serialize them on this transport.
pub struct SocketStrategy {
    shared: Arc<SocketShared>,
}

struct PendingWalletAction {
    ticket: u64,
    sender: Completion,
}

struct SocketShared {
    channel: Mutex<Option<Arc<dyn SocketChannelPort>>>,
    device_id: String,
    session: Arc<dyn SessionPort>,
    signals: Arc<dyn SignalPort>,
    reply_timeout: Option<Duration>,
    client_id: Mutex<Option<String>>,
    listeners: ScopedListeners,
    next_ticket: AtomicU64,
    /// Issued but not yet acknowledged; the last entry is claimed first.
    wallet_requests: Mutex<Vec<PendingWalletAction>>,
    /// Acknowledged, keyed by server message id.
    wallet_responses: Mutex<HashMap<String, PendingWalletAction>>,
}

fn message_key(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl SocketStrategy {
    /// Fails fast when no bearer token is stored.
    pub fn connect(
        connector: &dyn SocketConnectorPort,
        url: &str,
        device_id: String,
        session: Arc<dyn SessionPort>,
        signals: Arc<dyn SignalPort>,
        reply_timeout: Option<Duration>,
    ) -> Result<Self, BridgeError> {
        let token = session.token().ok_or(BridgeError::SessionMissing)?;
        let channel = connector.connect(
            url,
            &SocketQuery {
                token,
                device_id: device_id.clone(),
            },
        )?;
        let shared = Arc::new(SocketShared {
            client_id: Mutex::new(channel.id()),
            channel: Mutex::new(Some(Arc::clone(&channel))),
            device_id,
            session,
            signals,
            reply_timeout,
            listeners: ScopedListeners::default(),
            next_ticket: AtomicU64::new(1),
            wallet_requests: Mutex::new(Vec::new()),
            wallet_responses: Mutex::new(HashMap::new()),
        });
        shared.install_handlers(&channel);
        info!(url, device_id = %shared.device_id, "socket strategy connecting");
        Ok(Self { shared })
    }

    pub async fn send_message(
        &self,
        event_name: &str,
        envelope: &RequestEnvelope,
        wait_for_response: bool,
    ) -> Result<Value, BridgeError> {
        let channel = self.shared.channel()?;
        let payload = envelope.to_wire(&self.shared.device_id, StrategyKind::Socket)?;
        if !wait_for_response {
            channel.emit(event_name, payload)?;
            return serde_json::to_value(envelope)
                .map_err(|e| BridgeError::Validation(format!("envelope serialize failed: {e}")));
        }

        let (tx, rx) = oneshot::channel();
        let completion = OnceCompletion::new(tx);
        let slot = Arc::new(ListenerSlot::default());
        let handler_slot = Arc::clone(&slot);
        let weak = Arc::downgrade(&self.shared);
        let expected = envelope.id;
        let handler: SocketAnyHandler = Arc::new(move |_event: &str, message: &Value| {
            if message.get("id").and_then(Value::as_u64) != Some(expected) {
                return;
            }
            if !handler_slot.fire() {
                return;
            }
            if let (Some(shared), Some(id)) = (weak.upgrade(), handler_slot.take()) {
                shared.detach(id);
            }
            completion.complete(Ok(message.clone()));
        });
        let id = channel.on_any(handler);
        self.shared.listeners.track(ANY_EVENT, id);
        slot.set(id);
        if slot.has_fired() {
            self.shared.detach(id);
        }

        debug!(id = envelope.id, event = event_name, "emitting socket message");
        if let Err(e) = channel.emit(event_name, payload) {
            self.shared.detach(id);
            return Err(e);
        }
        let outcome = await_completion(rx, self.shared.reply_timeout, event_name).await;
        if outcome.is_err() {
            self.shared.detach(id);
        }
        outcome
    }

    pub async fn send_wallet_action(&self, envelope: &RequestEnvelope) -> Result<Value, BridgeError> {
        self.shared.check_permissions()?;
        let channel = self.shared.channel()?;
        let payload = envelope.to_wire(&self.shared.device_id, StrategyKind::Socket)?;

        let (tx, rx) = oneshot::channel();
        let ticket = self.shared.next_ticket.fetch_add(1, Ordering::SeqCst);
        // Queued before the emit so an immediate ack finds it.
        lock(&self.shared.wallet_requests).push(PendingWalletAction { ticket, sender: tx });

        debug!(id = envelope.id, method = %envelope.method, ticket, "emitting wallet action");
        if let Err(e) = channel.emit(WALLET_ACTION, payload) {
            self.shared.forget_wallet_action(ticket);
            return Err(e);
        }
        let outcome = await_completion(rx, self.shared.reply_timeout, WALLET_ACTION).await;
        if let Err(BridgeError::Timeout(_)) = &outcome {
            warn!(ticket, "wallet action timed out");
            self.shared.forget_wallet_action(ticket);
        }
        outcome
    }

    /// Parks the caller until the channel reports a connection.
    async fn wait_for_connect(&self) -> Result<(), BridgeError> {
        let channel = self.shared.channel()?;
        let (tx, rx) = oneshot::channel();
        let completion = OnceCompletion::new(tx);
        let weak = Arc::downgrade(&self.shared);
        let handler: SocketHandler = Arc::new(move |_: &Value| {
            if let Some(shared) = weak.upgrade() {
                shared.record_client_id();
            }
            completion.complete(Ok(Value::Null));
        });
        let id = channel.once(CONNECT, handler);
        self.shared.listeners.track(CONNECT, id);

        if self.shared.is_connected() {
            self.shared.detach(id);
            return Ok(());
        }
        debug!("socket not connected yet, deferring send");
        let outcome = await_completion(rx, self.shared.reply_timeout, CONNECT).await;
        self.shared.detach(id);
        outcome.map(|_| ())
    }

    async fn dispatch(
        &self,
        event: &ExternalEvent,
        envelope: &RequestEnvelope,
    ) -> Result<Value, BridgeError> {
        if event.wait_for_response && event.requires_signature {
            self.send_wallet_action(envelope).await
        } else {
            self.send_message(&event.name, envelope, event.wait_for_response)
                .await
        }
    }
}

impl SocketShared {
    fn channel(&self) -> Result<Arc<dyn SocketChannelPort>, BridgeError> {
        lock(&self.channel).clone().ok_or(BridgeError::Disconnected)
    }

    fn is_connected(&self) -> bool {
        lock(&self.client_id).is_some()
    }

    fn record_client_id(&self) {
        let id = lock(&self.channel).as_ref().and_then(|c| c.id());
        debug!(client_id = ?id, "socket connected");
        *lock(&self.client_id) = id;
    }

    /// Sends issued from here on wait for the next `connect`.
    fn forget_client_id(&self) {
        if lock(&self.client_id).take().is_some() {
            info!("socket dropped, deferring sends until it reconnects");
        }
    }

    fn detach(&self, id: ListenerId) {
        if !self.listeners.untrack(id) {
            return;
        }
        if let Some(channel) = lock(&self.channel).clone() {
            channel.off(id);
        }
    }

    fn check_permissions(&self) -> Result<(), BridgeError> {
        match self.session.claims() {
            Some(claims) if claims.can_write() => Ok(()),
            _ => {
                warn!("session token lacks write permission");
                self.signals.dispatch(TokenErrorKind::Permissions);
                Err(BridgeError::PermissionDenied)
            }
        }
    }

    fn forget_wallet_action(&self, ticket: u64) {
        lock(&self.wallet_requests).retain(|p| p.ticket != ticket);
        lock(&self.wallet_responses).retain(|_, p| p.ticket != ticket);
    }

    fn fail_wallet_actions(&self, error: BridgeError) {
        let queued = std::mem::take(&mut *lock(&self.wallet_requests));
        let filed: Vec<PendingWalletAction> =
            lock(&self.wallet_responses).drain().map(|(_, p)| p).collect();
        for pending in queued.into_iter().chain(filed) {
            let _ = pending.sender.send(Err(error.clone()));
        }
    }

    fn on_wallet_action_ack(&self, data: &Value) {
        let Some(message_id) = message_key(data.get("messageId")) else {
            warn!("wallet-action ack without messageId");
            return;
        };
        let Some(pending) = lock(&self.wallet_requests).pop() else {
            warn!(message_id = %message_id, "wallet-action ack with nothing queued");
            return;
        };
        debug!(message_id = %message_id, ticket = pending.ticket, "wallet action acknowledged");
        lock(&self.wallet_responses).insert(message_id, pending);
    }

    fn on_wallet_action_response(&self, data: &Value) {
        let Some(message_id) = message_key(data.get("messageId")) else {
            return;
        };
        let Some(pending) = lock(&self.wallet_responses).remove(&message_id) else {
            return;
        };
        let outcome = match (present(data, "data"), present(data, "error")) {
            (Some(value), _) => Ok(value),
            (None, Some(error)) => Err(BridgeError::Remote(error)),
            (None, None) => Err(BridgeError::unexpected()),
        };
        let _ = pending.sender.send(outcome);
    }

    fn on_token_error(&self) {
        warn!("socket server rejected the session token");
        self.session.clear();
        self.signals.dispatch(TokenErrorKind::Expired);
        self.fail_wallet_actions(BridgeError::SessionExpired);
    }

    fn install_handlers(self: &Arc<Self>, channel: &Arc<dyn SocketChannelPort>) {
        let handlers: [(&str, fn(&SocketShared, &Value)); 6] = [
            (CONNECT, |shared, _| shared.record_client_id()),
            (DISCONNECT, |shared, _| shared.forget_client_id()),
            (CONNECT_ERROR, |_, error| warn!(%error, "socket connect error")),
            (TOKEN_ERROR, |shared, _| shared.on_token_error()),
            (WALLET_ACTION, SocketShared::on_wallet_action_ack),
            (WALLET_ACTION_RESPONSE, SocketShared::on_wallet_action_response),
        ];
        for (event, route) in handlers {
            let weak = Arc::downgrade(self);
            let id = channel.on(
                event,
                Arc::new(move |data: &Value| {
                    if let Some(shared) = weak.upgrade() {
                        route(&*shared, data);
                    }
                }),
            );
            self.listeners.track(event, id);
        }
    }
}

#[async_trait]
impl TransportStrategy for SocketStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Socket
    }

    async fn emit_external_event(
        &self,
        event: &ExternalEvent,
        envelope: RequestEnvelope,
    ) -> Result<Value, BridgeError> {
        // The session token already names the wallet.
        if event.name == "eth_accounts" {
            return match self.shared.session.claims().and_then(|c| c.wallet) {
                Some(wallet) => Ok(Value::String(wallet)),
                None => Err(BridgeError::SessionMissing),
            };
        }
        if !self.shared.is_connected() {
            self.wait_for_connect().await?;
        }
        self.dispatch(event, &envelope).await
    }

    fn on_external_event(
        &self,
        config: ListenerConfig,
        callback: ReplyCallback,
    ) -> Result<(), BridgeError> {
        let channel = self.shared.channel()?;
        let slot = Arc::new(ListenerSlot::default());
        let handler_slot = Arc::clone(&slot);
        let weak = Arc::downgrade(&self.shared);
        let event = config.name.clone();
        let once = config.once;
        let handler: SocketHandler = Arc::new(move |data: &Value| {
            if !reply_matches(data, &config) {
                return;
            }
            if config.once {
                if !handler_slot.fire() {
                    return;
                }
                if let (Some(shared), Some(id)) = (weak.upgrade(), handler_slot.take()) {
                    shared.detach(id);
                }
            }
            callback(classify_reply(data));
        });
        let id = channel.on(&event, handler);
        self.shared.listeners.track(&event, id);
        slot.set(id);
        if once && slot.has_fired() {
            self.shared.detach(id);
        }
        Ok(())
    }

    fn disconnect(&self) {
        let channel = lock(&self.shared.channel).take();
        let released = self.shared.listeners.drain();
        if let Some(channel) = channel {
            channel.disconnect();
            for (_, id) in &released {
                channel.off(*id);
            }
            channel.remove_all_listeners();
        }
        *lock(&self.shared.client_id) = None;
        self.shared.fail_wallet_actions(BridgeError::Disconnected);
        debug!(released = released.len(), "socket strategy disconnected");
    }

    fn attached_listeners(&self) -> usize {
        self.shared.listeners.count()
    }
}
