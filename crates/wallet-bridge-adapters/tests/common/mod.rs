#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};

use wallet_bridge_adapters::{
    MemoryMessageSource, MemorySocketHub, MemoryTokenStore, MonotonicClock, RecordingSignals,
    StaticPageContext, StoredSession,
};
use wallet_bridge_core::{
    BridgeError, ChainRpcPort, EnvironmentDescriptor, FrameMessage, HostBindings,
    MessageSourcePort, ProviderOptions, SocketConnectorPort, SupportedChain, WalletProvider,
};

pub const APP_URL: &str = "https://wallet.example";
pub const SOCKET_URL: &str = "wss://events.wallet.example/events";
pub const DAPP_ORIGIN: &str = "https://dapp.example";
pub const WALLET: &str = "0x1000000000000000000000000000000000000001";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Bearer token signed with a key only the events server would hold.
pub fn make_token(claims: Value) -> String {
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"events-server-secret"),
    )
    .expect("encode token")
}

pub fn write_token() -> String {
    make_token(json!({
        "exp": 4_102_444_800u64,
        "permissions": "write",
        "type": "wallet",
        "wallet": WALLET,
    }))
}

pub fn options() -> ProviderOptions {
    ProviderOptions {
        chain: SupportedChain::Mainnet,
        app_url: APP_URL.to_owned(),
        websocket_server: SOCKET_URL.to_owned(),
        reply_timeout: None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    pub chain: SupportedChain,
    pub method: String,
    pub params: Value,
}

/// Chain reads answered from a fixed table.
#[derive(Clone, Default)]
pub struct RecordingRpc {
    calls: Arc<Mutex<Vec<RpcCall>>>,
    answers: Arc<Mutex<Vec<(String, Value)>>>,
}

impl RecordingRpc {
    pub fn answering(method: &str, result: Value) -> Self {
        let rpc = Self::default();
        rpc.answers
            .lock()
            .expect("answers lock")
            .push((method.to_owned(), result));
        rpc
    }

    pub fn calls(&self) -> Vec<RpcCall> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl ChainRpcPort for RecordingRpc {
    async fn request(
        &self,
        chain: SupportedChain,
        method: &str,
        params: Value,
    ) -> Result<Value, BridgeError> {
        self.calls.lock().expect("calls lock").push(RpcCall {
            chain,
            method: method.to_owned(),
            params,
        });
        self.answers
            .lock()
            .expect("answers lock")
            .iter()
            .find(|(m, _)| m == method)
            .map(|(_, result)| result.clone())
            .ok_or_else(|| BridgeError::Transport(format!("no answer for {method}")))
    }
}

pub struct Hosts {
    pub bindings: HostBindings,
    pub store: MemoryTokenStore,
    pub signals: RecordingSignals,
}

fn hosts(
    source: Option<MemoryMessageSource>,
    hub: Option<MemorySocketHub>,
    store: MemoryTokenStore,
) -> Hosts {
    let signals = RecordingSignals::default();
    let bindings = HostBindings {
        message_source: source.map(|s| Arc::new(s) as Arc<dyn MessageSourcePort>),
        socket_connector: hub.map(|h| Arc::new(h) as Arc<dyn SocketConnectorPort>),
        session: Arc::new(StoredSession::new(Arc::new(store.clone()))),
        signals: Arc::new(signals.clone()),
        page: Arc::new(StaticPageContext::new(
            DAPP_ORIGIN,
            Some("Dapp"),
            Some("/favicon.ico"),
        )),
        clock: Arc::new(MonotonicClock::starting_at(1_739_750_400_000)),
    };
    Hosts {
        bindings,
        store,
        signals,
    }
}

pub fn frame_hosts(source: &MemoryMessageSource) -> Hosts {
    hosts(
        Some(source.clone()),
        None,
        MemoryTokenStore::with_token(write_token()),
    )
}

pub fn socket_hosts(hub: &MemorySocketHub, store: MemoryTokenStore) -> Hosts {
    hosts(None, Some(hub.clone()), store)
}

pub fn frame_provider(
    source: &MemoryMessageSource,
    rpc: RecordingRpc,
    options: ProviderOptions,
) -> (WalletProvider<RecordingRpc>, Hosts) {
    let hosts = frame_hosts(source);
    let provider = WalletProvider::new(
        &EnvironmentDescriptor::embedded(),
        hosts.bindings.clone(),
        rpc,
        options,
    )
    .expect("frame provider");
    (provider, hosts)
}

pub fn socket_provider(
    hub: &MemorySocketHub,
    store: MemoryTokenStore,
) -> (WalletProvider<RecordingRpc>, Hosts) {
    let hosts = socket_hosts(hub, store);
    let provider = WalletProvider::new(
        &EnvironmentDescriptor::top_level(),
        hosts.bindings.clone(),
        RecordingRpc::default(),
        options(),
    )
    .expect("socket provider");
    (provider, hosts)
}

/// Parent reply to a plain request.
pub fn reply_to(posted: &Value, data: Value) -> FrameMessage {
    FrameMessage {
        origin: APP_URL.to_owned(),
        data: json!({
            "type": posted["type"],
            "request": { "id": posted["id"] },
            "data": data,
        }),
    }
}

/// The association message followed by the signed reply keyed on it.
pub fn signed_reply(posted: &Value, token: &str, data: Value) -> Vec<FrameMessage> {
    vec![
        FrameMessage {
            origin: APP_URL.to_owned(),
            data: json!({ "type": "iframeSign", "messageUuid": token }),
        },
        FrameMessage {
            origin: APP_URL.to_owned(),
            data: json!({
                "type": posted["type"],
                "request": { "id": token },
                "data": data,
            }),
        },
    ]
}

/// Collects every payload raised on a provider event.
pub fn record_event<R: ChainRpcPort>(
    provider: &WalletProvider<R>,
    event: &str,
) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    provider
        .on(
            event,
            Arc::new(move |payload: &Value| {
                sink.lock().expect("event lock").push(payload.clone());
            }),
        )
        .expect("subscribe");
    seen
}

pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
