use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::domain::{
    select_strategy, EnvironmentDescriptor, ExternalEvent, ListenerConfig, ProviderEventKind,
    StrategyKind, SupportedChain,
};
use crate::envelope::EnvelopeBuilder;
use crate::listeners::{BroadcastCallback, ListenerRegistry};
use crate::ports::{
    BridgeError, ClockPort, MessageSourcePort, PageContextPort, SessionPort, SignalPort,
    SocketConnectorPort,
};
use crate::provider::ProviderOptions;
use crate::strategy::{FrameStrategy, ReplyCallback, SocketStrategy, TransportStrategy};

/// Host capabilities a communicator is built from. Only the binding the
/// selected strategy needs has to be present.
#[derive(Clone)]
pub struct HostBindings {
    pub message_source: Option<Arc<dyn MessageSourcePort>>,
    pub socket_connector: Option<Arc<dyn SocketConnectorPort>>,
    pub session: Arc<dyn SessionPort>,
    pub signals: Arc<dyn SignalPort>,
    pub page: Arc<dyn PageContextPort>,
    pub clock: Arc<dyn ClockPort>,
}

/// One transport strategy plus the internal event surface around it.
pub struct Communicator {
    strategy: Box<dyn TransportStrategy>,
    envelopes: EnvelopeBuilder,
    device_id: String,
    session: Arc<dyn SessionPort>,
    listeners: Arc<ListenerRegistry>,
    disconnected: AtomicBool,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("strategy", &self.strategy.kind())
            .field("device_id", &self.device_id)
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

impl Communicator {
    /// Picks the strategy once from `environment`; a strategy that cannot be
    /// built fails construction.
    pub fn new(
        environment: &EnvironmentDescriptor,
        hosts: HostBindings,
        options: &ProviderOptions,
    ) -> Result<Self, BridgeError> {
        let device_id = uuid::Uuid::new_v4().to_string();
        let kind = select_strategy(environment);
        let strategy: Box<dyn TransportStrategy> = match kind {
            StrategyKind::Frame => {
                let source = hosts.message_source.clone().ok_or_else(|| {
                    BridgeError::Validation("frame strategy requires a message source".to_owned())
                })?;
                Box::new(FrameStrategy::new(
                    source,
                    options.app_url.clone(),
                    environment.is_trusted_wallet_host,
                    Arc::clone(&hosts.clock),
                    options.reply_timeout,
                ))
            }
            StrategyKind::Socket => {
                let connector = hosts.socket_connector.clone().ok_or_else(|| {
                    BridgeError::Validation("socket strategy requires a connector".to_owned())
                })?;
                Box::new(SocketStrategy::connect(
                    connector.as_ref(),
                    &options.websocket_server,
                    device_id.clone(),
                    Arc::clone(&hosts.session),
                    Arc::clone(&hosts.signals),
                    options.reply_timeout,
                )?)
            }
        };
        info!(strategy = %kind, device_id = %device_id, "communicator created");

        let communicator = Self {
            strategy,
            envelopes: EnvelopeBuilder::new(hosts.clock, hosts.page),
            device_id,
            session: hosts.session,
            listeners: Arc::new(ListenerRegistry::default()),
            disconnected: AtomicBool::new(false),
        };
        communicator.initialize()?;
        Ok(communicator)
    }

    /// Relays remote `chainChanged` broadcasts onto the internal surface.
    fn initialize(&self) -> Result<(), BridgeError> {
        let listeners = Arc::clone(&self.listeners);
        let relay: ReplyCallback = Arc::new(move |outcome: Result<Value, BridgeError>| {
            match outcome {
                Ok(data) => {
                    let chain_id = data.get("chainId").cloned().unwrap_or(Value::Null);
                    listeners.emit(ProviderEventKind::ChainChanged, &json!({ "chainId": chain_id }));
                }
                Err(e) => error!(error = %e, "chainChanged broadcast carried an error"),
            }
        });
        self.strategy.on_external_event(
            ListenerConfig::broadcast(ProviderEventKind::ChainChanged.as_str()),
            relay,
        )
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Listeners the strategy holds on its shared source or channel.
    pub fn attached_listeners(&self) -> usize {
        self.strategy.attached_listeners()
    }

    pub fn on(&self, kind: ProviderEventKind, callback: BroadcastCallback) {
        self.listeners.on(kind, callback);
    }

    pub async fn emit_external_event(
        &self,
        event: &ExternalEvent,
        data: Value,
        chain: SupportedChain,
    ) -> Result<Value, BridgeError> {
        if self.is_disconnected() {
            return Err(BridgeError::Disconnected);
        }
        let envelope = self.envelopes.build(&event.name, data, chain)?;
        debug!(
            id = envelope.id,
            event = %event.name,
            wait = event.wait_for_response,
            signature = event.requires_signature,
            "emitting external event"
        );
        match self.strategy.emit_external_event(event, envelope).await {
            Err(BridgeError::SessionMissing) => {
                self.disconnect();
                Err(BridgeError::SessionMissing)
            }
            outcome => outcome,
        }
    }

    pub fn on_external_event(
        &self,
        config: ListenerConfig,
        callback: ReplyCallback,
    ) -> Result<(), BridgeError> {
        if self.is_disconnected() {
            return Err(BridgeError::Disconnected);
        }
        self.strategy.on_external_event(config, callback)
    }

    /// Clears the stored token, tears the strategy down, raises `disconnect`
    /// and then empties the internal registry. Later calls are no-ops.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.clear();
        self.strategy.disconnect();
        self.listeners.emit(ProviderEventKind::Disconnect, &Value::Null);
        self.listeners.remove_all(None);
        info!(device_id = %self.device_id, "communicator disconnected");
    }
}
