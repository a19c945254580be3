//! Sync engine lifecycle states and their reducer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase of the remote sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineState {
    /// Not running.
    Stopped,
    /// Preparing storage and the outbox.
    Configuring,
    /// Running the paged initial sync.
    PerformingInitialSync,
    /// Opening subscriptions.
    SubscriptionsEstablishing,
    /// Reconciling subscription events and draining the outbox.
    Syncing,
    /// Shutting down.
    Stopping,
    /// Stopped after a terminal error; needs an explicit restart.
    TornDown {
        /// The terminal error.
        reason: String,
    },
}

impl EngineState {
    /// Returns true if the engine is between start and stop.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            EngineState::Configuring
                | EngineState::PerformingInitialSync
                | EngineState::SubscriptionsEstablishing
                | EngineState::Syncing
        )
    }

    /// Returns true if the engine can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::TornDown { .. })
    }

    /// Returns true if the engine has reached a resting state.
    pub fn is_terminal(&self) -> bool {
        self.can_start()
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Stopped => f.write_str("stopped"),
            EngineState::Configuring => f.write_str("configuring"),
            EngineState::PerformingInitialSync => f.write_str("performingInitialSync"),
            EngineState::SubscriptionsEstablishing => f.write_str("subscriptionsEstablishing"),
            EngineState::Syncing => f.write_str("syncing"),
            EngineState::Stopping => f.write_str("stopping"),
            EngineState::TornDown { reason } => write!(f, "tornDown({reason})"),
        }
    }
}

/// Inputs to the lifecycle reducer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineAction {
    /// Begin starting.
    Start,
    /// Configuration finished.
    Configured,
    /// Every model finished its initial sync.
    InitialSyncCompleted,
    /// Every subscription is connected.
    SubscriptionsEstablished,
    /// A transient failure; start over from configuration.
    Retry,
    /// Begin stopping.
    Stop,
    /// Shutdown finished.
    Stopped,
    /// A terminal error occurred.
    Fail(String),
}

/// The lifecycle reducer.
///
/// Actions that do not apply to the current state leave it unchanged.
pub fn reduce(state: &EngineState, action: EngineAction) -> EngineState {
    use EngineAction as A;
    use EngineState as S;

    match (state, action) {
        (s, A::Start) if s.can_start() => S::Configuring,
        (S::Configuring, A::Configured) => S::PerformingInitialSync,
        (S::PerformingInitialSync, A::InitialSyncCompleted) => S::SubscriptionsEstablishing,
        (S::SubscriptionsEstablishing, A::SubscriptionsEstablished) => S::Syncing,
        (s, A::Retry) if s.is_active() => S::Configuring,
        (s, A::Stop) if s.is_active() => S::Stopping,
        (S::Stopping, A::Stopped) => S::Stopped,
        (s, A::Fail(reason)) if !matches!(s, S::Stopped | S::TornDown { .. }) => {
            S::TornDown { reason }
        }
        (s, _) => s.clone(),
    }
}
