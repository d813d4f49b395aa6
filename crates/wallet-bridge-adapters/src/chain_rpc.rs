use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use wallet_bridge_core::domain::parse_chain_id;
use wallet_bridge_core::{BridgeError, ChainRpcPort, SupportedChain};

use crate::BridgeConfig;

/// Public endpoints tried in order when no URL is configured for a chain.
pub fn public_endpoints(chain: SupportedChain) -> Vec<String> {
    let urls: &[&str] = match chain {
        SupportedChain::Mainnet => &[
            "https://eth.merkle.io",
            "https://eth.llamarpc.com",
            "https://eth.drpc.org",
        ],
        SupportedChain::Polygon => &[
            "https://polygon-rpc.com",
            "https://polygon-pokt.nodies.app",
            "https://polygon-bor-rpc.publicnode.com",
        ],
        SupportedChain::Sepolia => &[
            "https://sepolia.drpc.org",
            "https://ethereum-sepolia-rpc.publicnode.com",
            "https://eth-sepolia.public.blastapi.io",
        ],
    };
    urls.iter().map(|u| (*u).to_owned()).collect()
}

/// JSON-RPC read path. A configured URL serves the default chain; other
/// chains use the first public endpoint that reports the expected chain id.
#[derive(Debug)]
pub struct JsonRpcChainClient {
    client: reqwest::Client,
    default_chain: SupportedChain,
    default_url: Option<String>,
    endpoints: HashMap<SupportedChain, Vec<String>>,
    resolved: Mutex<HashMap<SupportedChain, String>>,
    next_id: AtomicU64,
}

impl JsonRpcChainClient {
    pub fn new(config: &BridgeConfig) -> Result<Self, BridgeError> {
        #[cfg(not(target_arch = "wasm32"))]
        let client = reqwest::Client::builder()
            .timeout(config.rpc_timeout())
            .build()
            .map_err(|e| BridgeError::Transport(format!("failed to build rpc client: {e}")))?;
        #[cfg(target_arch = "wasm32")]
        let client = reqwest::Client::new();

        Ok(Self {
            client,
            default_chain: config.chain()?,
            default_url: config.rpc_url.clone(),
            endpoints: SupportedChain::ALL
                .into_iter()
                .map(|chain| (chain, public_endpoints(chain)))
                .collect(),
            resolved: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Replaces the public candidates for `chain`.
    pub fn with_endpoints(mut self, chain: SupportedChain, urls: Vec<String>) -> Self {
        self.endpoints.insert(chain, urls);
        self
    }

    pub fn resolved_url(&self, chain: SupportedChain) -> Option<String> {
        self.resolved.lock().ok()?.get(&chain).cloned()
    }

    async fn call(&self, url: &str, method: &str, params: Value) -> Result<Value, BridgeError> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::SeqCst),
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BridgeError::Transport(format!("rpc request failed: {e}")))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| BridgeError::Transport(format!("rpc json decode failed: {e}")))?;
        if !status.is_success() {
            return Err(BridgeError::Transport(format!("rpc status {status}: {body}")));
        }
        if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
            return Err(BridgeError::Remote(err.clone()));
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| BridgeError::Transport(format!("rpc response missing result: {body}")))
    }

    async fn reports_chain(&self, url: &str, chain: SupportedChain) -> bool {
        match self.call(url, "eth_chainId", Value::Array(Vec::new())).await {
            Ok(reported) => parse_chain_id(&reported).ok() == Some(chain.id()),
            Err(e) => {
                debug!(url, error = %e, "rpc endpoint chain check failed");
                false
            }
        }
    }

    async fn resolve_url(&self, chain: SupportedChain) -> Result<String, BridgeError> {
        if chain == self.default_chain {
            if let Some(url) = &self.default_url {
                return Ok(url.clone());
            }
        }
        if let Some(url) = self.resolved_url(chain) {
            return Ok(url);
        }
        let candidates = self.endpoints.get(&chain).cloned().unwrap_or_default();
        for url in candidates {
            if self.reports_chain(&url, chain).await {
                debug!(chain = chain.id(), url = %url, "rpc endpoint selected");
                if let Ok(mut g) = self.resolved.lock() {
                    g.insert(chain, url.clone());
                }
                return Ok(url);
            }
        }
        Err(BridgeError::Transport(format!(
            "no reachable rpc endpoint for chain {chain}"
        )))
    }

    fn forget(&self, chain: SupportedChain) {
        if let Ok(mut g) = self.resolved.lock() {
            g.remove(&chain);
        }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl ChainRpcPort for JsonRpcChainClient {
    async fn request(
        &self,
        chain: SupportedChain,
        method: &str,
        params: Value,
    ) -> Result<Value, BridgeError> {
        let url = self.resolve_url(chain).await?;
        let outcome = self.call(&url, method, params).await;
        if let Err(BridgeError::Transport(reason)) = &outcome {
            warn!(chain = chain.id(), method, reason = %reason, "rpc endpoint failed, dropping cached url");
            self.forget(chain);
        }
        outcome
    }
}
