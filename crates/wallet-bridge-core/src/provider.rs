use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::communicator::{Communicator, HostBindings};
use crate::dispatch::{classify, extract_payload, param_at, positional_params, MethodRoute};
use crate::domain::{
    parse_chain_id, EnvironmentDescriptor, ExternalEvent, ProviderEventKind, RequestArguments,
    StrategyKind, SupportedChain,
};
use crate::listeners::{lock, BroadcastCallback, ListenerRegistry};
use crate::ports::{BridgeError, ChainRpcPort, DISCONNECTED_CODE};

pub const DEFAULT_APP_URL: &str = "https://ethermail.io";
pub const DEFAULT_WEBSOCKET_SERVER: &str = "wss://api.ethermail.io/events";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOptions {
    pub chain: SupportedChain,
    /// Origin of the trusted parent frame.
    pub app_url: String,
    pub websocket_server: String,
    /// Bound on every correlated wait; `None` waits indefinitely.
    pub reply_timeout: Option<Duration>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            chain: SupportedChain::default(),
            app_url: DEFAULT_APP_URL.to_owned(),
            websocket_server: DEFAULT_WEBSOCKET_SERVER.to_owned(),
            reply_timeout: None,
        }
    }
}

/// EIP-1193 provider backed by a communicator and a chain RPC client.
pub struct WalletProvider<R: ChainRpcPort> {
    chain: Arc<Mutex<SupportedChain>>,
    communicator: Communicator,
    rpc: R,
    events: Arc<ListenerRegistry>,
}

impl<R: ChainRpcPort> std::fmt::Debug for WalletProvider<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletProvider")
            .field("chain", &self.chain())
            .field("communicator", &self.communicator)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

fn disconnect_descriptor() -> Value {
    json!({
        "code": DISCONNECTED_CODE,
        "message": "Provider Disconnected",
        "shortMessage": "All chains disconnected",
    })
}

impl<R: ChainRpcPort> WalletProvider<R> {
    pub fn new(
        environment: &EnvironmentDescriptor,
        hosts: HostBindings,
        rpc: R,
        options: ProviderOptions,
    ) -> Result<Self, BridgeError> {
        let communicator = Communicator::new(environment, hosts, &options)?;
        let provider = Self {
            chain: Arc::new(Mutex::new(options.chain)),
            communicator,
            rpc,
            events: Arc::new(ListenerRegistry::default()),
        };
        provider.relay_chain_changes();
        provider.events.emit(
            ProviderEventKind::Connect,
            &json!({ "chainId": options.chain.id().to_string() }),
        );
        Ok(provider)
    }

    /// A remote chain switch updates the current chain and is re-raised to
    /// consumers; unsupported ids are dropped.
    fn relay_chain_changes(&self) {
        let chain = Arc::clone(&self.chain);
        let events = Arc::clone(&self.events);
        self.communicator.on(
            ProviderEventKind::ChainChanged,
            Arc::new(move |payload: &Value| {
                let next = parse_chain_id(&payload["chainId"]).and_then(SupportedChain::try_from);
                match next {
                    Ok(next) => {
                        *lock(&chain) = next;
                        events.emit(
                            ProviderEventKind::ChainChanged,
                            &json!({ "chainId": next.id().to_string() }),
                        );
                    }
                    Err(e) => warn!(error = %e, %payload, "ignoring remote chain change"),
                }
            }),
        );
    }

    pub fn chain(&self) -> SupportedChain {
        *lock(&self.chain)
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.communicator.strategy_kind()
    }

    pub async fn request(&self, args: RequestArguments) -> Result<Value, BridgeError> {
        let RequestArguments { method, params } = args;
        let route = classify(&method).ok_or_else(|| {
            warn!(method = %method, "method not implemented");
            BridgeError::NotImplemented(method.clone())
        })?;
        let params = positional_params(params);
        let chain = self.chain();
        debug!(method = %method, ?route, chain = chain.id(), "dispatching request");

        match route {
            MethodRoute::ChainId => Ok(Value::String(chain.hex_id())),
            MethodRoute::Accounts => {
                let account = self
                    .communicator
                    .emit_external_event(&ExternalEvent::request(method.as_str()), Value::Null, chain)
                    .await?;
                Ok(Value::Array(vec![account]))
            }
            MethodRoute::SwitchChain => self.switch_chain(&params).await,
            MethodRoute::ChainRead { announce } => {
                if announce {
                    self.announce(&method, param_at(&params, 0));
                }
                let result = self.rpc.request(chain, &method, params).await?;
                Ok(normalize_read(&method, result))
            }
            MethodRoute::WalletAction {
                payload_index,
                decode_hex,
                announce,
            } => {
                let payload = extract_payload(&params, payload_index, decode_hex);
                if announce {
                    self.announce(&method, payload.clone());
                }
                self.communicator
                    .emit_external_event(&ExternalEvent::signature(method.as_str()), payload, chain)
                    .await
            }
        }
    }

    /// Validates before any wire traffic; commits only after the remote
    /// party answered.
    async fn switch_chain(&self, params: &Value) -> Result<Value, BridgeError> {
        let raw = params
            .get(0)
            .and_then(|p| p.get("chainId"))
            .ok_or_else(|| BridgeError::Validation("missing params[0].chainId".to_owned()))?;
        let target = SupportedChain::try_from(parse_chain_id(raw)?)?;
        self.communicator
            .emit_external_event(
                &ExternalEvent::request("wallet_switchEthereumChain"),
                Value::Array(Vec::new()),
                target,
            )
            .await?;
        *lock(&self.chain) = target;
        debug!(chain = target.id(), "chain switched");
        Ok(Value::Null)
    }

    fn announce(&self, method: &str, data: Value) {
        self.events.emit(
            ProviderEventKind::Message,
            &json!({ "type": method, "data": data }),
        );
    }

    pub fn on(&self, event: &str, callback: BroadcastCallback) -> Result<(), BridgeError> {
        self.events.on(ProviderEventKind::from_str(event)?, callback);
        Ok(())
    }

    pub fn once(&self, event: &str, callback: BroadcastCallback) -> Result<(), BridgeError> {
        self.events.once(ProviderEventKind::from_str(event)?, callback);
        Ok(())
    }

    pub fn remove_all_listeners(&self, event: Option<&str>) -> Result<(), BridgeError> {
        let kind = event.map(ProviderEventKind::from_str).transpose()?;
        self.events.remove_all(kind);
        Ok(())
    }

    pub fn listener_count(&self, event: &str) -> Result<usize, BridgeError> {
        Ok(self.events.listener_count(ProviderEventKind::from_str(event)?))
    }

    /// Safe to call repeatedly; each call raises `disconnect`.
    pub async fn disconnect(&self) {
        self.communicator.disconnect();
        self.events
            .emit(ProviderEventKind::Disconnect, &disconnect_descriptor());
    }
}

/// `eth_getTransactionByHash` replies carry the numeric `type` as `typeHex`;
/// consumers expect the hex form under `type`.
fn normalize_read(method: &str, mut result: Value) -> Value {
    if method != "eth_getTransactionByHash" {
        return result;
    }
    if let Some(obj) = result.as_object_mut() {
        if let Some(type_hex) = obj.get("typeHex").filter(|v| !v.is_null()).cloned() {
            obj.insert("type".to_owned(), type_hex);
        }
    }
    result
}
