use std::sync::{Arc, Mutex};

use wallet_bridge_core::{SignalPort, TokenErrorKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSignal {
    pub sequence: u64,
    pub kind: TokenErrorKind,
}

#[derive(Debug, Default)]
struct SignalLog {
    seq: u64,
    signals: Vec<RecordedSignal>,
}

/// Keeps every token error signal in dispatch order until drained.
#[derive(Debug, Clone, Default)]
pub struct RecordingSignals {
    log: Arc<Mutex<SignalLog>>,
}

impl RecordingSignals {
    pub fn drain(&self) -> Vec<RecordedSignal> {
        match self.log.lock() {
            Ok(mut g) => std::mem::take(&mut g.signals),
            Err(_) => Vec::new(),
        }
    }

    pub fn count(&self, kind: TokenErrorKind) -> usize {
        self.log
            .lock()
            .map(|g| g.signals.iter().filter(|s| s.kind == kind).count())
            .unwrap_or(0)
    }
}

impl SignalPort for RecordingSignals {
    fn dispatch(&self, kind: TokenErrorKind) {
        if let Ok(mut g) = self.log.lock() {
            g.seq = g.seq.saturating_add(1);
            let sequence = g.seq;
            g.signals.push(RecordedSignal { sequence, kind });
        }
        tracing::debug!(?kind, "token error signal");
    }
}
