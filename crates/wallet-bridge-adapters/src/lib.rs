pub mod chain_rpc;
pub mod clock;
pub mod config;
pub mod memory;
pub mod page;
pub mod session;
pub mod signals;
pub mod socket_listeners;
pub mod socketio;

#[cfg(target_arch = "wasm32")]
pub mod browser;

pub use chain_rpc::JsonRpcChainClient;
pub use clock::MonotonicClock;
pub use config::BridgeConfig;
pub use memory::{MemoryMessageSource, MemorySocket, MemorySocketHub};
pub use page::StaticPageContext;
pub use session::{capture_callback_token, decode_claims, MemoryTokenStore, StoredSession};
pub use signals::{RecordedSignal, RecordingSignals};
pub use socketio::ReconnectPolicy;

#[cfg(not(target_arch = "wasm32"))]
pub use socketio::SocketIoConnector;

#[cfg(target_arch = "wasm32")]
pub use browser::{
    detect_environment, BrowserSocketConnector, DocumentPageContext, LocalStorageTokenStore,
    WindowMessageSource, WindowSignals,
};
