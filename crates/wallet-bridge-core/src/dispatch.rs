//! Method classification: the single table deciding where each EIP-1193
//! method is served.

use serde_json::Value;

/// Where a wallet method is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodRoute {
    /// `eth_chainId` / `net_version`, answered from local state.
    ChainId,
    /// `eth_accounts`, round trip through the communicator.
    Accounts,
    /// `wallet_switchEthereumChain`, correlated round trip then local commit.
    SwitchChain,
    /// Positional passthrough to the chain RPC client.
    ChainRead { announce: bool },
    /// Signature-bearing round trip; payload taken from `params[payload_index]`.
    WalletAction {
        payload_index: usize,
        decode_hex: bool,
        announce: bool,
    },
}

impl MethodRoute {
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Self::Accounts | Self::SwitchChain | Self::WalletAction { .. }
        )
    }

    pub fn requires_signature(&self) -> bool {
        matches!(self, Self::WalletAction { .. })
    }

    /// Raises a `message` event for the embedding page before dispatch.
    pub fn announces(&self) -> bool {
        match self {
            Self::ChainRead { announce } | Self::WalletAction { announce, .. } => *announce,
            _ => false,
        }
    }
}

pub const SUPPORTED_METHODS: &[&str] = &[
    "eth_accounts",
    "net_version",
    "eth_chainId",
    "wallet_switchEthereumChain",
    "eth_blockNumber",
    "eth_getBalance",
    "eth_getCode",
    "eth_getTransactionCount",
    "eth_getStorageAt",
    "eth_getBlockByNumber",
    "eth_getBlockByHash",
    "eth_getTransactionByHash",
    "eth_getTransactionReceipt",
    "eth_estimateGas",
    "eth_call",
    "eth_getLogs",
    "eth_gasPrice",
    "eth_sendTransaction",
    "eth_signTypedData_v4",
    "eth_sign",
    "personal_sign",
    "eth_signTypedData",
    "eth_signTransaction",
];

pub fn classify(method: &str) -> Option<MethodRoute> {
    let route = match method {
        "eth_accounts" => MethodRoute::Accounts,
        "net_version" | "eth_chainId" => MethodRoute::ChainId,
        "wallet_switchEthereumChain" => MethodRoute::SwitchChain,
        "eth_blockNumber"
        | "eth_getBalance"
        | "eth_getCode"
        | "eth_getTransactionCount"
        | "eth_getStorageAt"
        | "eth_getBlockByNumber"
        | "eth_getBlockByHash"
        | "eth_getTransactionByHash"
        | "eth_getTransactionReceipt"
        | "eth_estimateGas"
        | "eth_getLogs"
        | "eth_gasPrice" => MethodRoute::ChainRead { announce: false },
        "eth_call" => MethodRoute::ChainRead { announce: true },
        "eth_sendTransaction" => MethodRoute::WalletAction {
            payload_index: 0,
            decode_hex: false,
            announce: true,
        },
        "eth_signTypedData_v4" => MethodRoute::WalletAction {
            payload_index: 1,
            decode_hex: false,
            announce: true,
        },
        "eth_sign" => MethodRoute::WalletAction {
            payload_index: 1,
            decode_hex: true,
            announce: true,
        },
        "personal_sign" | "eth_signTypedData" | "eth_signTransaction" => {
            MethodRoute::WalletAction {
                payload_index: 0,
                decode_hex: true,
                announce: true,
            }
        }
        _ => return None,
    };
    Some(route)
}

/// Normalizes missing params to an empty positional list.
pub fn positional_params(params: Value) -> Value {
    match params {
        Value::Null => Value::Array(Vec::new()),
        other => other,
    }
}

pub fn param_at(params: &Value, index: usize) -> Value {
    params.get(index).cloned().unwrap_or(Value::Null)
}

pub fn extract_payload(params: &Value, index: usize, decode_hex: bool) -> Value {
    let raw = param_at(params, index);
    if decode_hex {
        hex_to_text(raw)
    } else {
        raw
    }
}

/// `0x`-prefixed hex strings become their UTF-8 text; anything else passes through.
pub fn hex_to_text(value: Value) -> Value {
    let Some(raw) = value.as_str() else {
        return value;
    };
    if !(raw.starts_with("0x") || raw.starts_with("0X")) {
        return value;
    }
    match alloy::hex::decode(&raw[2..]) {
        Ok(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        Err(_) => value,
    }
}
