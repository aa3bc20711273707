/// Debounced persistence of local edits
/// Idle / Pending(payload, deadline); every schedule replaces the payload
/// and restarts the timer, only the payload present when it fires is written
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
enum DebounceState {
    Idle,
    Pending { payload: String, deadline: Instant },
}

#[derive(Debug, Clone)]
pub struct DebouncedWriter {
    delay: Duration,
    state: DebounceState,
}

impl DebouncedWriter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: DebounceState::Idle,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, DebounceState::Pending { .. })
    }

    /// Record `payload` and restart the timer. Returns the payload this
    /// call superseded, which will never be written.
    pub fn schedule(&mut self, payload: String, now: Instant) -> Option<String> {
        let deadline = now + self.delay;
        match std::mem::replace(&mut self.state, DebounceState::Pending { payload, deadline }) {
            DebounceState::Pending { payload, .. } => Some(payload),
            DebounceState::Idle => None,
        }
    }

    /// When the pending timer fires, if any
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            DebounceState::Pending { deadline, .. } => Some(*deadline),
            DebounceState::Idle => None,
        }
    }

    /// Fire the timer if it is due
    pub fn take_due(&mut self, now: Instant) -> Option<String> {
        match self.deadline() {
            Some(deadline) if deadline <= now => self.flush(),
            _ => None,
        }
    }

    /// Fire immediately regardless of the deadline
    pub fn flush(&mut self) -> Option<String> {
        match std::mem::replace(&mut self.state, DebounceState::Idle) {
            DebounceState::Pending { payload, .. } => Some(payload),
            DebounceState::Idle => None,
        }
    }
}
