use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::domain::{CorrelationKey, ExternalEvent, ListenerConfig, StrategyKind};
use crate::envelope::RequestEnvelope;
use crate::listeners::{lock, ScopedListeners};
use crate::ports::{BridgeError, ClockPort, FrameHandler, FrameMessage, ListenerId, MessageSourcePort};
use crate::strategy::{
    await_completion, classify_reply, completion_callback, reply_matches, ListenerSlot,
    OnceCompletion, ReplyCallback, TransportStrategy,
};

/// `type` of the out-of-band message naming the token a signing reply will use.
pub const ASSOCIATION_TYPE: &str = "iframeSign";
const MESSAGE_EVENT: &str = "message";

/// Posts envelopes to the trusted parent frame and listens on the shared
/// message source.
pub struct FrameStrategy {
    shared: Arc<FrameShared>,
}

struct FrameShared {
    source: Arc<dyn MessageSourcePort>,
    app_url: String,
    trusted_host: bool,
    clock: Arc<dyn ClockPort>,
    reply_timeout: Option<Duration>,
    listeners: ScopedListeners,
    /// Association token -> originating envelope id.
    associations: Mutex<HashMap<String, u64>>,
    connected: AtomicBool,
}

/// Progress of one signature-class request through its two phases.
#[derive(Default)]
struct AssociationWait {
    listener: Mutex<Option<ListenerId>>,
    token: Mutex<Option<String>>,
}

enum PendingReply {
    Plain(ListenerId),
    Signature(Arc<AssociationWait>),
}

pub(crate) fn association_token(data: &Value) -> Option<&str> {
    if data.get("type").and_then(Value::as_str) != Some(ASSOCIATION_TYPE) {
        return None;
    }
    data.get("messageUuid")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
}

impl FrameStrategy {
    pub fn new(
        source: Arc<dyn MessageSourcePort>,
        app_url: impl Into<String>,
        trusted_host: bool,
        clock: Arc<dyn ClockPort>,
        reply_timeout: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(FrameShared {
                source,
                app_url: app_url.into(),
                trusted_host,
                clock,
                reply_timeout,
                listeners: ScopedListeners::default(),
                associations: Mutex::new(HashMap::new()),
                connected: AtomicBool::new(true),
            }),
        }
    }

    pub fn send(&self, envelope: &RequestEnvelope) -> Result<(), BridgeError> {
        self.shared.ensure_connected()?;
        let session_id = self.shared.clock.now_ms()?.to_string();
        let message = envelope.to_wire(&session_id, StrategyKind::Frame)?;
        debug!(id = envelope.id, method = %envelope.method, "posting envelope to parent frame");
        self.shared.source.post_to_parent(message)
    }

    async fn await_reply(
        &self,
        envelope: &RequestEnvelope,
        requires_signature: bool,
    ) -> Result<Value, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let completion = OnceCompletion::new(tx);
        // Listen first; an in-process parent may answer during the post.
        let pending = if requires_signature {
            PendingReply::Signature(self.shared.await_association(
                envelope.id,
                envelope.method.clone(),
                completion,
            ))
        } else {
            PendingReply::Plain(self.shared.listen(
                ListenerConfig::reply(envelope.method.clone(), CorrelationKey::Envelope(envelope.id)),
                completion_callback(completion),
            ))
        };

        if let Err(e) = self.send(envelope) {
            self.shared.abandon(&pending);
            return Err(e);
        }

        let outcome = await_completion(rx, self.shared.reply_timeout, &envelope.method).await;
        if let Err(BridgeError::Timeout(_)) = &outcome {
            warn!(id = envelope.id, method = %envelope.method, "frame reply timed out");
            self.shared.abandon(&pending);
        }
        outcome
    }
}

impl FrameShared {
    fn ensure_connected(&self) -> Result<(), BridgeError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BridgeError::Disconnected)
        }
    }

    fn accepts_origin(&self, origin: &str) -> bool {
        origin == self.app_url || self.trusted_host
    }

    fn attach(&self, handler: FrameHandler) -> ListenerId {
        let id = self.source.add_listener(handler);
        self.listeners.track(MESSAGE_EVENT, id);
        id
    }

    fn detach(&self, id: ListenerId) {
        if self.listeners.untrack(id) {
            self.source.remove_listener(id);
        }
    }

    /// Attaches a filtered listener; `once` listeners detach themselves after
    /// the first qualifying message.
    fn listen(self: &Arc<Self>, config: ListenerConfig, callback: ReplyCallback) -> ListenerId {
        let slot = Arc::new(ListenerSlot::default());
        let weak = Arc::downgrade(self);
        let handler_slot = Arc::clone(&slot);
        let once = config.once;
        let handler: FrameHandler = Arc::new(move |message: &FrameMessage| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if !shared.accepts_origin(&message.origin) {
                return;
            }
            if message.data.get("type").and_then(Value::as_str) == Some(ASSOCIATION_TYPE) {
                return;
            }
            if !reply_matches(&message.data, &config) {
                return;
            }
            if config.once {
                if !handler_slot.fire() {
                    return;
                }
                if let Some(id) = handler_slot.take() {
                    shared.detach(id);
                }
            }
            callback(classify_reply(&message.data));
        });

        let id = self.attach(handler);
        slot.set(id);
        if once && slot.has_fired() {
            if let Some(id) = slot.take() {
                self.detach(id);
            }
        }
        id
    }

    /// Phase one of a signature-class request: wait for the association
    /// message, claim its token, then listen for the reply keyed on it.
    fn await_association(
        self: &Arc<Self>,
        envelope_id: u64,
        name: String,
        completion: Arc<OnceCompletion>,
    ) -> Arc<AssociationWait> {
        let wait = Arc::new(AssociationWait::default());
        let weak = Arc::downgrade(self);
        let handler_wait = Arc::clone(&wait);
        let handler: FrameHandler = Arc::new(move |message: &FrameMessage| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if message.origin != shared.app_url {
                return;
            }
            let Some(token) = association_token(&message.data) else {
                return;
            };
            if !shared.claim_association(token, envelope_id, &handler_wait) {
                return;
            }
            debug!(envelope_id, token, "signature association received");
            if let Some(id) = lock(&handler_wait.listener).take() {
                shared.detach(id);
            }

            let reply_token = token.to_owned();
            let reply_weak: Weak<FrameShared> = Arc::downgrade(&shared);
            let reply_completion = Arc::clone(&completion);
            let callback: ReplyCallback = Arc::new(move |outcome| {
                if let Some(shared) = reply_weak.upgrade() {
                    shared.consume_association(&reply_token);
                }
                reply_completion.complete(outcome);
            });
            let reply_id = shared.listen(
                ListenerConfig::reply(name.clone(), CorrelationKey::Association(token.to_owned())),
                callback,
            );
            *lock(&handler_wait.listener) = Some(reply_id);
        });

        let id = self.attach(handler);
        if lock(&wait.token).is_some() {
            self.detach(id);
        } else {
            lock(&wait.listener).get_or_insert(id);
        }
        wait
    }

    /// Each token is claimed by exactly one pending request.
    fn claim_association(&self, token: &str, envelope_id: u64, wait: &AssociationWait) -> bool {
        let mut token_slot = lock(&wait.token);
        if token_slot.is_some() {
            return false;
        }
        let mut table = lock(&self.associations);
        if table.contains_key(token) {
            return false;
        }
        table.insert(token.to_owned(), envelope_id);
        *token_slot = Some(token.to_owned());
        true
    }

    fn consume_association(&self, token: &str) -> Option<u64> {
        lock(&self.associations).remove(token)
    }

    fn abandon(&self, pending: &PendingReply) {
        match pending {
            PendingReply::Plain(id) => self.detach(*id),
            PendingReply::Signature(wait) => {
                if let Some(id) = lock(&wait.listener).take() {
                    self.detach(id);
                }
                if let Some(token) = lock(&wait.token).as_deref() {
                    self.consume_association(token);
                }
            }
        }
    }
}

#[async_trait]
impl TransportStrategy for FrameStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Frame
    }

    async fn emit_external_event(
        &self,
        event: &ExternalEvent,
        envelope: RequestEnvelope,
    ) -> Result<Value, BridgeError> {
        if !event.wait_for_response {
            self.send(&envelope)?;
            return serde_json::to_value(&envelope)
                .map_err(|e| BridgeError::Validation(format!("envelope serialize failed: {e}")));
        }
        self.await_reply(&envelope, event.requires_signature).await
    }

    fn on_external_event(
        &self,
        config: ListenerConfig,
        callback: ReplyCallback,
    ) -> Result<(), BridgeError> {
        self.shared.ensure_connected()?;
        self.shared.listen(config, callback);
        Ok(())
    }

    fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        let released = self.shared.listeners.drain();
        for (_, id) in &released {
            self.shared.source.remove_listener(*id);
        }
        lock(&self.shared.associations).clear();
        debug!(released = released.len(), "frame strategy disconnected");
    }

    fn attached_listeners(&self) -> usize {
        self.shared.listeners.count()
    }
}
