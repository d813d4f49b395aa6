use std::sync::{Arc, Mutex};

use jsonwebtoken::{decode, DecodingKey, Validation};
use reqwest::Url;
use tracing::{debug, warn};

use wallet_bridge_core::{BridgeError, SessionClaims, SessionPort, TokenStorePort};

pub const CALLBACK_PATH: &str = "/ethermailCallback";

/// Token store for hosts without persistent storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    token: Arc<Mutex<Option<String>>>,
}

impl MemoryTokenStore {
    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::default();
        store.store(&token.into());
        store
    }
}

impl TokenStorePort for MemoryTokenStore {
    fn load(&self) -> Option<String> {
        self.token.lock().ok().and_then(|g| g.clone())
    }

    fn store(&self, token: &str) {
        if let Ok(mut g) = self.token.lock() {
            *g = Some(token.to_owned());
        }
    }

    fn clear(&self) {
        if let Ok(mut g) = self.token.lock() {
            *g = None;
        }
    }
}

/// Reads the claims of a bearer token. Neither the signature nor `exp` is
/// checked here; the events server rejects stale or forged tokens with
/// `token-error`.
pub fn decode_claims(token: &str) -> Result<SessionClaims, BridgeError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    decode::<SessionClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| BridgeError::Validation(format!("token decode failed: {e}")))
}

/// Session view over a token store.
#[derive(Clone)]
pub struct StoredSession {
    store: Arc<dyn TokenStorePort>,
}

impl std::fmt::Debug for StoredSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredSession")
            .field("has_token", &self.store.load().is_some())
            .finish()
    }
}

impl StoredSession {
    pub fn new(store: Arc<dyn TokenStorePort>) -> Self {
        Self { store }
    }
}

impl SessionPort for StoredSession {
    fn token(&self) -> Option<String> {
        self.store.load().filter(|t| !t.is_empty())
    }

    fn claims(&self) -> Option<SessionClaims> {
        let token = self.token()?;
        match decode_claims(&token) {
            Ok(claims) => Some(claims),
            Err(e) => {
                warn!(error = %e, "stored token could not be decoded");
                None
            }
        }
    }

    fn clear(&self) {
        self.store.clear();
    }
}

/// Stores the token carried by a login callback URL. Returns whether one was
/// captured.
pub fn capture_callback_token(url: &str, store: &dyn TokenStorePort) -> Result<bool, BridgeError> {
    let url = Url::parse(url)
        .map_err(|e| BridgeError::Validation(format!("invalid page url: {e}")))?;
    if url.path() != CALLBACK_PATH {
        return Ok(false);
    }
    let Some(token) = url
        .query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|t| !t.is_empty())
    else {
        return Ok(false);
    };
    store.store(&token);
    debug!("captured session token from callback url");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn token_for(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"events-server-secret"),
        )
        .expect("encode token")
    }

    #[test]
    fn claims_decode_without_the_server_key() {
        let token = token_for(json!({
            "permissions": "write",
            "wallet": "0x1000000000000000000000000000000000000001",
            "exp": 1739754000
        }));
        let claims = decode_claims(&token).expect("decode token");
        assert!(claims.can_write());
        assert_eq!(claims.exp, 1739754000);
    }

    #[test]
    fn expired_tokens_still_decode_for_the_server_to_reject() {
        let token = token_for(json!({
            "permissions": "admin",
            "wallet": "not-an-address",
            "exp": 1
        }));
        let claims = decode_claims(&token).expect("decode token");
        assert_eq!(claims.exp, 1);
        assert!(!claims.can_write());
        assert_eq!(claims.wallet.as_deref(), Some("not-an-address"));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(decode_claims("not-a-jwt").is_err());
        assert!(decode_claims("a.%%%.c").is_err());
        let session = StoredSession::new(Arc::new(MemoryTokenStore::with_token("a.b")));
        assert!(session.token().is_some());
        assert!(session.claims().is_none());
    }

    #[test]
    fn callback_url_token_is_captured() {
        let store = MemoryTokenStore::default();
        let captured = capture_callback_token(
            "https://dapp.example/ethermailCallback?token=abc.def.ghi",
            &store,
        )
        .expect("parse url");
        assert!(captured);
        assert_eq!(store.load().as_deref(), Some("abc.def.ghi"));

        let other = MemoryTokenStore::default();
        assert!(!capture_callback_token("https://dapp.example/?token=x", &other).expect("parse url"));
        assert!(!capture_callback_token("https://dapp.example/ethermailCallback", &other)
            .expect("parse url"));
        assert_eq!(other.load(), None);
        assert!(capture_callback_token("not a url", &other).is_err());
    }
}
