use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::ports::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub enum SupportedChain {
    Mainnet,
    Polygon,
    Sepolia,
}

impl SupportedChain {
    pub const ALL: [SupportedChain; 3] = [Self::Mainnet, Self::Polygon, Self::Sepolia];

    pub fn id(self) -> u64 {
        match self {
            Self::Mainnet => 1,
            Self::Polygon => 137,
            Self::Sepolia => 11_155_111,
        }
    }

    pub fn from_id(id: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|chain| chain.id() == id)
    }

    pub fn hex_id(self) -> String {
        format!("0x{:x}", self.id())
    }
}

impl Default for SupportedChain {
    fn default() -> Self {
        Self::Mainnet
    }
}

impl From<SupportedChain> for u64 {
    fn from(chain: SupportedChain) -> Self {
        chain.id()
    }
}

impl TryFrom<u64> for SupportedChain {
    type Error = BridgeError;

    fn try_from(id: u64) -> Result<Self, Self::Error> {
        Self::from_id(id).ok_or(BridgeError::InvalidChain(id))
    }
}

impl fmt::Display for SupportedChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Accepts a JSON number, a decimal string or a `0x` hex string.
pub fn parse_chain_id(value: &Value) -> Result<u64, BridgeError> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    let s = value
        .as_str()
        .ok_or_else(|| BridgeError::Validation("chain id must be string or number".to_owned()))?;
    parse_chain_id_str(s)
}

pub fn parse_chain_id_str(raw: &str) -> Result<u64, BridgeError> {
    let raw = raw.trim();
    if raw.starts_with("0x") || raw.starts_with("0X") {
        u64::from_str_radix(&raw[2..], 16)
            .map_err(|e| BridgeError::Validation(format!("invalid hex chain id: {e}")))
    } else {
        raw.parse()
            .map_err(|e| BridgeError::Validation(format!("invalid chain id: {e}")))
    }
}

/// Names a consumer may subscribe to on the provider; the communicator raises
/// `Disconnect` and `ChainChanged` internally under the same names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderEventKind {
    Connect,
    Disconnect,
    ChainChanged,
    AccountsChanged,
    Message,
}

impl ProviderEventKind {
    pub const ALL: [ProviderEventKind; 5] = [
        Self::Connect,
        Self::Disconnect,
        Self::ChainChanged,
        Self::AccountsChanged,
        Self::Message,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::ChainChanged => "chainChanged",
            Self::AccountsChanged => "accountsChanged",
            Self::Message => "message",
        }
    }
}

impl FromStr for ProviderEventKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| BridgeError::UnsupportedEvent(s.to_owned()))
    }
}

impl fmt::Display for ProviderEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    #[serde(rename = "iframe")]
    Frame,
    #[serde(rename = "ws")]
    Socket,
}

impl StrategyKind {
    /// Value of the `bridge` field on outbound wire messages.
    pub fn bridge_tag(self) -> &'static str {
        match self {
            Self::Frame => "iframe",
            Self::Socket => "ws",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.bridge_tag())
    }
}

/// What the host page looks like at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnvironmentDescriptor {
    /// The document's parent browsing context differs from itself.
    pub is_embedded: bool,
    /// The host self-identifies as the trusted wallet host.
    pub is_trusted_wallet_host: bool,
}

impl EnvironmentDescriptor {
    pub fn top_level() -> Self {
        Self::default()
    }

    pub fn embedded() -> Self {
        Self {
            is_embedded: true,
            is_trusted_wallet_host: false,
        }
    }
}

pub fn select_strategy(environment: &EnvironmentDescriptor) -> StrategyKind {
    if environment.is_embedded || environment.is_trusted_wallet_host {
        StrategyKind::Frame
    } else {
        StrategyKind::Socket
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    None,
    Read,
    Write,
}

/// A claim of an unexpected shape reads as absent instead of voiding the
/// whole token.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(serde_json::from_value(Value::deserialize(deserializer)?).ok())
}

/// Missing or unrecognized grants read as `Permission::None`.
fn lenient_permission<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Permission, D::Error> {
    Ok(lenient(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Sso,
    Wallet,
}

/// Decoded bearer token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    #[serde(default)]
    pub exp: u64,
    #[serde(default)]
    pub iat: u64,
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub sub: String,
    #[serde(default, deserialize_with = "lenient_permission")]
    pub permissions: Permission,
    #[serde(rename = "type", default, deserialize_with = "lenient")]
    pub kind: Option<SessionKind>,
    #[serde(default, deserialize_with = "lenient")]
    pub origin: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub address: Option<String>,
    /// Taken as issued; `eth_accounts` returns it unchanged.
    #[serde(default, deserialize_with = "lenient")]
    pub wallet: Option<String>,
    #[serde(rename = "ethermail_verified", default)]
    pub verified: bool,
}

impl SessionClaims {
    pub fn can_write(&self) -> bool {
        self.permissions == Permission::Write
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenErrorKind {
    Permissions,
    Expired,
}

/// Human-readable identity of the page issuing requests.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallerInfo {
    pub name: String,
    pub origin: String,
    pub icon: String,
}

impl CallerInfo {
    /// Name falls back to the origin; a relative icon href is resolved against it.
    pub fn from_page(origin: &str, title: Option<&str>, icon_href: Option<&str>) -> Self {
        let name = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(origin)
            .to_owned();
        let icon = match icon_href {
            Some(href) if href.contains("://") => href.to_owned(),
            Some(href) => format!("{origin}{href}"),
            None => String::new(),
        };
        Self {
            name,
            origin: origin.to_owned(),
            icon,
        }
    }
}

/// A request pushed through a communicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalEvent {
    pub name: String,
    pub wait_for_response: bool,
    pub requires_signature: bool,
}

impl ExternalEvent {
    pub fn request(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            wait_for_response: true,
            requires_signature: false,
        }
    }

    pub fn signature(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            wait_for_response: true,
            requires_signature: true,
        }
    }
}

/// How a reply is tied back to its request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    Envelope(u64),
    Association(String),
}

impl CorrelationKey {
    pub fn matches(&self, reply_id: &Value) -> bool {
        match self {
            Self::Envelope(id) => {
                reply_id.as_u64() == Some(*id)
                    || reply_id.as_str().and_then(|s| s.parse::<u64>().ok()) == Some(*id)
            }
            Self::Association(token) => reply_id.as_str() == Some(token.as_str()),
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Envelope(id) => write!(f, "{id}"),
            Self::Association(token) => f.write_str(token),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub name: String,
    pub once: bool,
    pub request_id: Option<CorrelationKey>,
}

impl ListenerConfig {
    /// Persistent listener for remote-originated broadcasts.
    pub fn broadcast(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            once: false,
            request_id: None,
        }
    }

    pub fn reply(name: impl Into<String>, key: CorrelationKey) -> Self {
        Self {
            name: name.into(),
            once: true,
            request_id: Some(key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestArguments {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RequestArguments {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn bare(method: impl Into<String>) -> Self {
        Self::new(method, Value::Array(Vec::new()))
    }
}
