pub mod communicator;
pub mod dispatch;
pub mod domain;
pub mod envelope;
pub mod listeners;
pub mod ports;
pub mod provider;
pub mod strategy;

pub use communicator::{Communicator, HostBindings};
pub use dispatch::{classify, MethodRoute, SUPPORTED_METHODS};
pub use domain::{
    select_strategy, CallerInfo, CorrelationKey, EnvironmentDescriptor, ExternalEvent,
    ListenerConfig, Permission, ProviderEventKind, RequestArguments, SessionClaims, SessionKind,
    StrategyKind, SupportedChain, TokenErrorKind,
};
pub use envelope::{EnvelopeBuilder, RequestEnvelope, ENVELOPE_VERSION};
pub use listeners::{BroadcastCallback, ListenerRegistry, ScopedListeners};
pub use ports::{
    BridgeError, ChainRpcPort, ClockPort, FrameHandler, FrameMessage, ListenerId,
    MessageSourcePort, PageContextPort, SessionPort, SignalPort, SocketAnyHandler,
    SocketChannelPort, SocketConnectorPort, SocketHandler, SocketQuery, TokenStorePort,
};
pub use provider::{ProviderOptions, WalletProvider, DEFAULT_APP_URL, DEFAULT_WEBSOCKET_SERVER};
pub use strategy::{FrameStrategy, ReplyCallback, SocketStrategy, TransportStrategy};
