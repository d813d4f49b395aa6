use std::sync::atomic::{AtomicU64, Ordering};

use wallet_bridge_core::{BridgeError, ClockPort};

/// Envelope ids and frame session ids, in epoch milliseconds. Readings never
/// repeat: two envelopes built within the same millisecond get consecutive
/// ids.
#[derive(Debug)]
pub struct MonotonicClock {
    next: AtomicU64,
    wall: bool,
}

impl MonotonicClock {
    /// Follows the wall clock (`web-time`, so the browser's `Date.now()` on
    /// wasm32).
    pub fn system() -> Self {
        Self {
            next: AtomicU64::new(0),
            wall: true,
        }
    }

    /// A fixed sequence `start_ms, start_ms + 1, ...`.
    pub fn starting_at(start_ms: u64) -> Self {
        Self {
            next: AtomicU64::new(start_ms),
            wall: false,
        }
    }

    fn wall_ms(&self) -> Result<u64, BridgeError> {
        if !self.wall {
            return Ok(0);
        }
        let since_epoch = web_time::SystemTime::now()
            .duration_since(web_time::UNIX_EPOCH)
            .map_err(|e| BridgeError::Transport(format!("clock before epoch: {e}")))?;
        Ok(u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX))
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::system()
    }
}

impl ClockPort for MonotonicClock {
    fn now_ms(&self) -> Result<u64, BridgeError> {
        let floor = self.wall_ms()?;
        let previous = self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                Some(next.max(floor).saturating_add(1))
            })
            .unwrap_or_else(|current| current);
        Ok(previous.max(floor))
    }
}
