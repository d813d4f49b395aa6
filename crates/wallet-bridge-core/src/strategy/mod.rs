pub mod frame;
pub mod socket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::domain::{ExternalEvent, ListenerConfig, StrategyKind};
use crate::envelope::RequestEnvelope;
use crate::listeners::lock;
use crate::ports::{BridgeError, ListenerId};

pub use frame::FrameStrategy;
pub use socket::SocketStrategy;

pub type ReplyCallback = Arc<dyn Fn(Result<Value, BridgeError>) + Send + Sync>;

/// One of the two interchangeable transports behind a communicator.
#[async_trait]
pub trait TransportStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Sends the envelope; when `event.wait_for_response` is set, resolves with
    /// the correlated reply, otherwise with the envelope itself.
    async fn emit_external_event(
        &self,
        event: &ExternalEvent,
        envelope: RequestEnvelope,
    ) -> Result<Value, BridgeError>;

    fn on_external_event(
        &self,
        config: ListenerConfig,
        callback: ReplyCallback,
    ) -> Result<(), BridgeError>;

    /// Detaches every listener this instance attached. Safe to call twice.
    fn disconnect(&self);

    fn attached_listeners(&self) -> usize;
}

pub(crate) type Completion = oneshot::Sender<Result<Value, BridgeError>>;

/// Completes a pending call at most once from a shared handler.
pub(crate) struct OnceCompletion(Mutex<Option<Completion>>);

impl OnceCompletion {
    pub(crate) fn new(sender: Completion) -> Arc<Self> {
        Arc::new(Self(Mutex::new(Some(sender))))
    }

    pub(crate) fn complete(&self, outcome: Result<Value, BridgeError>) -> bool {
        match lock(&self.0).take() {
            Some(sender) => sender.send(outcome).is_ok(),
            None => false,
        }
    }
}

/// Id of a self-detaching listener, known only after it was attached.
#[derive(Default)]
pub(crate) struct ListenerSlot {
    id: Mutex<Option<ListenerId>>,
    fired: AtomicBool,
}

impl ListenerSlot {
    pub(crate) fn set(&self, id: ListenerId) {
        *lock(&self.id) = Some(id);
    }

    pub(crate) fn take(&self) -> Option<ListenerId> {
        lock(&self.id).take()
    }

    /// True for the first caller only.
    pub(crate) fn fire(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

pub(crate) fn completion_callback(completion: Arc<OnceCompletion>) -> ReplyCallback {
    Arc::new(move |outcome| {
        completion.complete(outcome);
    })
}

pub(crate) fn reply_request_id(data: &Value) -> Option<&Value> {
    data.get("request")
        .and_then(|r| r.get("id"))
        .filter(|id| !id.is_null())
}

/// Request-id and `type` filter shared by both transports.
pub(crate) fn reply_matches(data: &Value, config: &ListenerConfig) -> bool {
    match (&config.request_id, reply_request_id(data)) {
        (Some(key), Some(id)) if key.matches(id) => {}
        (Some(_), _) => return false,
        (None, Some(_)) => return false,
        (None, None) => {}
    }
    match data.get("type").and_then(Value::as_str) {
        Some(kind) => kind == config.name,
        None => true,
    }
}

pub(crate) fn present(data: &Value, field: &str) -> Option<Value> {
    data.get(field).filter(|v| !v.is_null()).cloned()
}

/// `error` wins, then `data`; a reply with neither is an unexpected error.
pub(crate) fn classify_reply(data: &Value) -> Result<Value, BridgeError> {
    if let Some(error) = present(data, "error") {
        return Err(BridgeError::Remote(error));
    }
    present(data, "data").ok_or_else(BridgeError::unexpected)
}

/// A dropped sender means the strategy was torn down underneath the caller.
pub(crate) async fn await_completion(
    receiver: oneshot::Receiver<Result<Value, BridgeError>>,
    timeout: Option<Duration>,
    waiting_for: &str,
) -> Result<Value, BridgeError> {
    let received = match timeout {
        Some(limit) => race_timeout(receiver, limit)
            .await
            .ok_or_else(|| BridgeError::Timeout(waiting_for.to_owned()))?,
        None => receiver.await,
    };
    received.map_err(|_| BridgeError::Disconnected)?
}

type Received = Result<Result<Value, BridgeError>, oneshot::error::RecvError>;

#[cfg(not(target_arch = "wasm32"))]
async fn race_timeout(
    receiver: oneshot::Receiver<Result<Value, BridgeError>>,
    limit: Duration,
) -> Option<Received> {
    tokio::time::timeout(limit, receiver).await.ok()
}

/// wasm32 has no tokio time driver; the browser timer bounds the wait.
#[cfg(target_arch = "wasm32")]
async fn race_timeout(
    receiver: oneshot::Receiver<Result<Value, BridgeError>>,
    limit: Duration,
) -> Option<Received> {
    use futures_util::future::{select, Either};
    use gloo_timers::future::TimeoutFuture;

    let millis = u32::try_from(limit.as_millis()).unwrap_or(u32::MAX);
    match select(receiver, TimeoutFuture::new(millis)).await {
        Either::Left((received, _)) => Some(received),
        Either::Right(((), _)) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CorrelationKey;
    use serde_json::json;

    #[test]
    fn broadcast_listeners_ignore_correlated_replies() {
        let config = ListenerConfig::broadcast("chainChanged");
        assert!(reply_matches(&json!({"type": "chainChanged", "data": {}}), &config));
        assert!(!reply_matches(
            &json!({"type": "chainChanged", "request": {"id": 7}}),
            &config
        ));
        assert!(!reply_matches(&json!({"type": "accountsChanged"}), &config));
        assert!(reply_matches(&json!({"data": 1}), &config));
    }

    #[test]
    fn correlated_listeners_require_their_own_id() {
        let config = ListenerConfig::reply("eth_accounts", CorrelationKey::Envelope(9));
        assert!(reply_matches(
            &json!({"type": "eth_accounts", "request": {"id": 9}}),
            &config
        ));
        assert!(!reply_matches(
            &json!({"type": "eth_accounts", "request": {"id": 10}}),
            &config
        ));
        assert!(!reply_matches(&json!({"type": "eth_accounts"}), &config));
    }

    #[test]
    fn replies_classify_into_data_or_error() {
        assert_eq!(classify_reply(&json!({"data": "0x1"})).expect("data"), json!("0x1"));
        let err = classify_reply(&json!({"error": {"code": 4001}})).expect_err("error");
        assert_eq!(err.code(), Some(4001));
        let err = classify_reply(&json!({"type": "x"})).expect_err("empty reply");
        assert!(err.to_string().contains("Unexpected error"));
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn bounded_waits_time_out_and_dropped_senders_disconnect() {
        let (_tx, rx) = oneshot::channel();
        let err = await_completion(rx, Some(Duration::from_millis(20)), "eth_accounts")
            .await
            .expect_err("nothing answers");
        assert!(matches!(err, BridgeError::Timeout(ref what) if what == "eth_accounts"));

        let (tx, rx) = oneshot::channel::<Result<Value, BridgeError>>();
        drop(tx);
        let err = await_completion(rx, None, "eth_accounts")
            .await
            .expect_err("sender dropped");
        assert!(matches!(err, BridgeError::Disconnected));

        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(json!("0x1")));
        let value = await_completion(rx, Some(Duration::from_secs(5)), "eth_chainId")
            .await
            .expect("answered in time");
        assert_eq!(value, json!("0x1"));
    }
}
