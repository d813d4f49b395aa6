use std::time::Duration;

use wallet_bridge_core::{
    BridgeError, ProviderOptions, SupportedChain, DEFAULT_APP_URL, DEFAULT_WEBSOCKET_SERVER,
};

pub const DEFAULT_TOKEN_STORAGE_KEY: &str = "ethermail_token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub app_url: String,
    pub websocket_server: String,
    pub chain_id: u64,
    /// Overrides the public endpoint list for `chain_id`.
    pub rpc_url: Option<String>,
    pub rpc_timeout_ms: u64,
    pub reply_timeout_ms: Option<u64>,
    pub token_storage_key: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            app_url: DEFAULT_APP_URL.to_owned(),
            websocket_server: DEFAULT_WEBSOCKET_SERVER.to_owned(),
            chain_id: SupportedChain::Mainnet.id(),
            rpc_url: None,
            rpc_timeout_ms: 15_000,
            reply_timeout_ms: None,
            token_storage_key: DEFAULT_TOKEN_STORAGE_KEY.to_owned(),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Result<Option<u64>, BridgeError> {
    env_string(name)
        .map(|raw| {
            raw.parse::<u64>()
                .map_err(|e| BridgeError::Validation(format!("{name} must be an integer: {e}")))
        })
        .transpose()
}

impl BridgeConfig {
    /// Defaults overridden by `WALLET_BRIDGE_*` variables.
    pub fn from_env() -> Result<Self, BridgeError> {
        let mut config = Self::default();
        if let Some(url) = env_string("WALLET_BRIDGE_APP_URL") {
            config.app_url = url;
        }
        if let Some(url) = env_string("WALLET_BRIDGE_WEBSOCKET_SERVER") {
            config.websocket_server = url;
        }
        if let Some(chain_id) = env_u64("WALLET_BRIDGE_CHAIN_ID")? {
            config.chain_id = chain_id;
        }
        config.rpc_url = env_string("WALLET_BRIDGE_RPC_URL");
        if let Some(ms) = env_u64("WALLET_BRIDGE_RPC_TIMEOUT_MS")? {
            config.rpc_timeout_ms = ms;
        }
        config.reply_timeout_ms = env_u64("WALLET_BRIDGE_REPLY_TIMEOUT_MS")?;
        if let Some(key) = env_string("WALLET_BRIDGE_TOKEN_STORAGE_KEY") {
            config.token_storage_key = key;
        }
        Ok(config)
    }

    pub fn chain(&self) -> Result<SupportedChain, BridgeError> {
        SupportedChain::try_from(self.chain_id)
    }

    pub fn provider_options(&self) -> Result<ProviderOptions, BridgeError> {
        Ok(ProviderOptions {
            chain: self.chain()?,
            app_url: self.app_url.clone(),
            websocket_server: self.websocket_server.clone(),
            reply_timeout: self.reply_timeout_ms.map(Duration::from_millis),
        })
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}
