use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{StrategyKind, SupportedChain};
use crate::ports::{BridgeError, ClockPort, PageContextPort};

pub const ENVELOPE_VERSION: u8 = 1;

/// A uniquely identified request as it crosses a transport.
///
/// `id` comes from the clock, so two envelopes built within the same
/// millisecond share an id. Frame replies for the plain path are correlated
/// on that id alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(rename = "type")]
    pub method: String,
    pub data: Value,
    pub chain_id: u64,
    pub caller_name: String,
    pub caller_origin: String,
    pub caller_icon: String,
    pub version: u8,
}

impl RequestEnvelope {
    /// Envelope fields plus the `sessionId` and `bridge` discriminator.
    pub fn to_wire(&self, session_id: &str, bridge: StrategyKind) -> Result<Value, BridgeError> {
        let mut wire = serde_json::to_value(self)
            .map_err(|e| BridgeError::Validation(format!("envelope serialize failed: {e}")))?;
        let obj = wire.as_object_mut().ok_or_else(|| {
            BridgeError::Validation("envelope must serialize to an object".to_owned())
        })?;
        obj.insert("sessionId".to_owned(), Value::String(session_id.to_owned()));
        obj.insert(
            "bridge".to_owned(),
            Value::String(bridge.bridge_tag().to_owned()),
        );
        Ok(wire)
    }
}

#[derive(Clone)]
pub struct EnvelopeBuilder {
    clock: Arc<dyn ClockPort>,
    page: Arc<dyn PageContextPort>,
}

impl std::fmt::Debug for EnvelopeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeBuilder").finish_non_exhaustive()
    }
}

impl EnvelopeBuilder {
    pub fn new(clock: Arc<dyn ClockPort>, page: Arc<dyn PageContextPort>) -> Self {
        Self { clock, page }
    }

    pub fn build(
        &self,
        method: &str,
        data: Value,
        chain: SupportedChain,
    ) -> Result<RequestEnvelope, BridgeError> {
        let caller = self.page.caller_info();
        Ok(RequestEnvelope {
            id: self.clock.now_ms()?,
            method: method.to_owned(),
            data,
            chain_id: chain.id(),
            caller_name: caller.name,
            caller_origin: caller.origin,
            caller_icon: caller.icon,
            version: ENVELOPE_VERSION,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CallerInfo;
    use serde_json::json;

    struct FixedClock(u64);

    impl ClockPort for FixedClock {
        fn now_ms(&self) -> Result<u64, BridgeError> {
            Ok(self.0)
        }
    }

    struct Page;

    impl PageContextPort for Page {
        fn caller_info(&self) -> CallerInfo {
            CallerInfo::from_page("https://dapp.example", Some("Dapp"), Some("/icon.png"))
        }
    }

    #[test]
    fn envelope_carries_caller_metadata_and_wire_tags() {
        let builder = EnvelopeBuilder::new(Arc::new(FixedClock(1_739_750_400_000)), Arc::new(Page));
        let envelope = builder
            .build("personal_sign", json!("hello"), SupportedChain::Polygon)
            .expect("build envelope");
        assert_eq!(envelope.id, 1_739_750_400_000);
        assert_eq!(envelope.chain_id, 137);

        let wire = envelope
            .to_wire("device-1", StrategyKind::Socket)
            .expect("wire form");
        assert_eq!(wire["type"], "personal_sign");
        assert_eq!(wire["callerName"], "Dapp");
        assert_eq!(wire["callerOrigin"], "https://dapp.example");
        assert_eq!(wire["callerIcon"], "https://dapp.example/icon.png");
        assert_eq!(wire["chainId"], 137);
        assert_eq!(wire["version"], 1);
        assert_eq!(wire["sessionId"], "device-1");
        assert_eq!(wire["bridge"], "ws");
    }
}
