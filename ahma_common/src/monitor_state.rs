//! Observable lifecycle for long-running background workers.
//!
//! A worker (the violation monitor, for instance) moves through
//! `Idle → Streaming → Stopped` exactly once. State lives in a
//! `tokio::sync::watch` channel so observers are notified immediately instead
//! of polling.
//!
//! # Example
//!
//! ```rust
//! use ahma_common::monitor_state::{MonitorState, MonitorStateMachine};
//!
//! let sm = MonitorStateMachine::new();
//! sm.transition_to_streaming().unwrap();
//! sm.transition_to_stopped();
//! assert_eq!(sm.current(), MonitorState::Stopped);
//! ```

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Constructed but not yet producing events.
    Idle,
    /// Actively reading from its source.
    Streaming,
    /// Terminal. The source has been closed.
    Stopped,
}

impl MonitorState {
    pub fn is_streaming(self) -> bool {
        self == MonitorState::Streaming
    }

    pub fn is_stopped(self) -> bool {
        self == MonitorState::Stopped
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorState::Idle => write!(f, "idle"),
            MonitorState::Streaming => write!(f, "streaming"),
            MonitorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Shared, cloneable handle on a worker's lifecycle.
#[derive(Clone)]
pub struct MonitorStateMachine {
    sender: Arc<watch::Sender<MonitorState>>,
    // Keeps the channel open even when nobody has subscribed yet.
    _receiver: watch::Receiver<MonitorState>,
}

impl MonitorStateMachine {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(MonitorState::Idle);
        Self {
            sender: Arc::new(sender),
            _receiver: receiver,
        }
    }

    pub fn current(&self) -> MonitorState {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.sender.subscribe()
    }

    /// `Idle → Streaming`. Any other starting state is rejected.
    pub fn transition_to_streaming(&self) -> Result<(), &'static str> {
        let mut transitioned = false;
        self.sender.send_if_modified(|state| {
            if *state == MonitorState::Idle {
                *state = MonitorState::Streaming;
                transitioned = true;
            }
            transitioned
        });
        if transitioned {
            Ok(())
        } else {
            Err("Can only start streaming from Idle")
        }
    }

    /// Move to `Stopped` from any state. Returns `true` only for the call that
    /// performed the transition, so teardown can run exactly once.
    pub fn transition_to_stopped(&self) -> bool {
        self.sender.send_if_modified(|state| {
            if state.is_stopped() {
                false
            } else {
                *state = MonitorState::Stopped;
                true
            }
        })
    }

    /// Resolves once the worker reaches `Stopped`.
    pub async fn wait_for_stopped(&self) {
        let mut rx = self.sender.subscribe();
        // An Err means the sender is gone, which can only happen after drop.
        let _ = rx.wait_for(|state| state.is_stopped()).await;
    }
}

impl Default for MonitorStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MonitorStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MonitorStateMachine")
            .field(&self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_full_lifecycle() {
        let sm = MonitorStateMachine::new();
        assert_eq!(sm.current(), MonitorState::Idle);

        sm.transition_to_streaming().unwrap();
        assert!(sm.current().is_streaming());

        assert!(sm.transition_to_stopped());
        assert!(sm.current().is_stopped());
    }

    #[test]
    fn test_cannot_restart_after_stop() {
        let sm = MonitorStateMachine::new();
        sm.transition_to_stopped();
        assert!(sm.transition_to_streaming().is_err());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let sm = MonitorStateMachine::new();
        sm.transition_to_streaming().unwrap();
        assert!(sm.transition_to_stopped());
        assert!(!sm.transition_to_stopped());
    }

    #[tokio::test]
    async fn test_wait_for_stopped_wakes_observer() {
        let sm = MonitorStateMachine::new();
        sm.transition_to_streaming().unwrap();
        let sm_clone = sm.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sm_clone.transition_to_stopped();
        });

        let result = timeout(Duration::from_secs(1), sm.wait_for_stopped()).await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_subscribe_sees_transition() {
        let sm = MonitorStateMachine::new();
        let mut rx = sm.subscribe();
        sm.transition_to_streaming().unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), MonitorState::Streaming);
    }
}
