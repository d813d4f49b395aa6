use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{CallerInfo, SessionClaims, SupportedChain, TokenErrorKind};

pub const UNAUTHORIZED_CODE: i64 = 4100;
pub const UNSUPPORTED_METHOD_CODE: i64 = 4200;
pub const DISCONNECTED_CODE: i64 = 4900;
pub const UNRECOGNIZED_CHAIN_CODE: i64 = 4902;

#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("invalid chain: {0}")]
    InvalidChain(u64),
    #[error("event not supported: {0}")]
    UnsupportedEvent(String),
    #[error("\"{0}\" not implemented")]
    NotImplemented(String),
    #[error("wrong permissions")]
    PermissionDenied,
    #[error("session token missing")]
    SessionMissing,
    #[error("session token expired")]
    SessionExpired,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote error: {0}")]
    Remote(Value),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("communicator disconnected")]
    Disconnected,
    #[error("validation error: {0}")]
    Validation(String),
}

impl BridgeError {
    /// Reply carried neither `data` nor `error`.
    pub fn unexpected() -> Self {
        Self::Remote(serde_json::json!({ "message": "Unexpected error" }))
    }

    /// EIP-1193 / EIP-3326 numeric code, when one applies.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::InvalidChain(_) => Some(UNRECOGNIZED_CHAIN_CODE),
            Self::NotImplemented(_) => Some(UNSUPPORTED_METHOD_CODE),
            Self::PermissionDenied | Self::SessionMissing | Self::SessionExpired => {
                Some(UNAUTHORIZED_CODE)
            }
            Self::Disconnected => Some(DISCONNECTED_CODE),
            Self::Remote(payload) => payload.get("code").and_then(Value::as_i64),
            _ => None,
        }
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidChain(_) | Self::UnsupportedEvent(_) | Self::NotImplemented(_)
        )
    }
}

pub trait ClockPort: Send + Sync {
    fn now_ms(&self) -> Result<u64, BridgeError>;
}

pub trait PageContextPort: Send + Sync {
    fn caller_info(&self) -> CallerInfo;
}

/// Persisted bearer token under a well-known key.
pub trait TokenStorePort: Send + Sync {
    fn load(&self) -> Option<String>;
    fn store(&self, token: &str);
    fn clear(&self);
}

/// Bearer token plus its decoded claims.
pub trait SessionPort: Send + Sync {
    fn token(&self) -> Option<String>;
    fn claims(&self) -> Option<SessionClaims>;
    fn clear(&self);
}

/// Page-wide token error notification.
pub trait SignalPort: Send + Sync {
    fn dispatch(&self, kind: TokenErrorKind);
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait ChainRpcPort: Send + Sync {
    async fn request(
        &self,
        chain: SupportedChain,
        method: &str,
        params: Value,
    ) -> Result<Value, BridgeError>;
}

pub type ListenerId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct FrameMessage {
    pub origin: String,
    pub data: Value,
}

pub type FrameHandler = Arc<dyn Fn(&FrameMessage) + Send + Sync>;

/// The page-level message source shared with unrelated code (the window).
pub trait MessageSourcePort: Send + Sync {
    fn add_listener(&self, handler: FrameHandler) -> ListenerId;
    fn remove_listener(&self, id: ListenerId) -> bool;
    fn post_to_parent(&self, message: Value) -> Result<(), BridgeError>;
}

pub type SocketHandler = Arc<dyn Fn(&Value) + Send + Sync>;
pub type SocketAnyHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketQuery {
    pub token: String,
    pub device_id: String,
}

pub trait SocketChannelPort: Send + Sync {
    /// Server-assigned client id, set once connected.
    fn id(&self) -> Option<String>;
    fn emit(&self, event: &str, payload: Value) -> Result<(), BridgeError>;
    fn on(&self, event: &str, handler: SocketHandler) -> ListenerId;
    fn once(&self, event: &str, handler: SocketHandler) -> ListenerId;
    /// Catch-all for inbound application events.
    fn on_any(&self, handler: SocketAnyHandler) -> ListenerId;
    fn off(&self, id: ListenerId) -> bool;
    fn remove_all_listeners(&self);
    fn disconnect(&self);
}

pub trait SocketConnectorPort: Send + Sync {
    fn connect(
        &self,
        url: &str,
        query: &SocketQuery,
    ) -> Result<Arc<dyn SocketChannelPort>, BridgeError>;
}
