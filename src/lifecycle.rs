//! Component lifecycle state machine
//!
//! Every component (service, agent, interface) walks the same monotonic
//! state machine:
//!
//! ```text
//! JOINING → DISCOVERING → READY ↔ BUSY
//!                           ↓
//!                        DEGRADED
//!                           ↓
//!                        OFFLINE
//! ```
//!
//! DEGRADED may replace READY after an invocation error and recovers back
//! to READY. OFFLINE is terminal.

use crate::domain_types::ParticipantGuid;
use crate::messages::{ComponentLifecycleEvent, EventCategory};
use crate::monitoring::MonitoringPublisher;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Lifecycle state of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentState {
    /// Constructed, transport not yet bound
    Joining,
    /// Transport bound, advertising in progress
    Discovering,
    /// Advertised and serving
    Ready,
    /// Processing one invocation
    Busy,
    /// An invocation failed; recovering
    Degraded,
    /// Shut down; terminal
    Offline,
}

impl ComponentState {
    /// Whether the state machine permits moving to `next`
    #[must_use]
    pub fn can_transition_to(self, next: ComponentState) -> bool {
        use ComponentState::{Busy, Degraded, Discovering, Joining, Offline, Ready};
        match self {
            Joining => matches!(next, Discovering | Offline),
            Discovering => matches!(next, Ready | Offline),
            Ready => matches!(next, Busy | Degraded | Offline),
            Busy => matches!(next, Ready | Degraded | Offline),
            Degraded => matches!(next, Ready | Offline),
            Offline => false,
        }
    }
}

/// Kind of component emitting lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    /// Function provider
    Service,
    /// LLM-backed reasoner
    Agent,
    /// System edge (CLI, bridge, UI)
    Interface,
}

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ComponentState,
        to: ComponentState,
    },
}

/// Owns a component's current state and publishes every transition
pub struct StateTracker {
    component_id: ParticipantGuid,
    component_name: String,
    kind: ComponentKind,
    state: Mutex<ComponentState>,
    publisher: Arc<MonitoringPublisher>,
}

impl StateTracker {
    /// Creates a tracker in JOINING and announces the initial state
    pub async fn new(
        component_id: ParticipantGuid,
        component_name: impl Into<String>,
        kind: ComponentKind,
        publisher: Arc<MonitoringPublisher>,
    ) -> Self {
        let tracker = Self {
            component_id,
            component_name: component_name.into(),
            kind,
            state: Mutex::new(ComponentState::Joining),
            publisher,
        };
        tracker
            .publish(None, ComponentState::Joining, EventCategory::AgentInit)
            .await;
        tracker
    }

    /// The current state
    #[must_use]
    pub fn state(&self) -> ComponentState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Moves to `next`, publishing the transition
    ///
    /// # Errors
    /// Returns [`LifecycleError::InvalidTransition`] when the state machine
    /// forbids the move; the current state is left unchanged.
    pub async fn transition(
        &self,
        next: ComponentState,
        category: EventCategory,
    ) -> Result<(), LifecycleError> {
        let previous = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !state.can_transition_to(next) {
                return Err(LifecycleError::InvalidTransition {
                    from: *state,
                    to: next,
                });
            }
            let previous = *state;
            *state = next;
            previous
        };
        debug!(
            component = %self.component_name,
            from = ?previous,
            to = ?next,
            "lifecycle transition"
        );
        self.publish(Some(previous), next, category).await;
        Ok(())
    }

    async fn publish(
        &self,
        previous: Option<ComponentState>,
        next: ComponentState,
        category: EventCategory,
    ) {
        self.publisher
            .publish_lifecycle(&ComponentLifecycleEvent {
                component_id: self.component_id,
                component_name: self.component_name.clone(),
                component_type: self.kind,
                previous_state: previous,
                new_state: next,
                category,
                timestamp: Utc::now(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_STATES: [ComponentState; 6] = [
        ComponentState::Joining,
        ComponentState::Discovering,
        ComponentState::Ready,
        ComponentState::Busy,
        ComponentState::Degraded,
        ComponentState::Offline,
    ];

    #[test]
    fn happy_path_is_permitted() {
        use ComponentState::{Busy, Discovering, Joining, Offline, Ready};
        assert!(Joining.can_transition_to(Discovering));
        assert!(Discovering.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Offline));
    }

    #[test]
    fn degraded_recovers_to_ready() {
        use ComponentState::{Busy, Degraded, Ready};
        assert!(Busy.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Ready));
    }

    #[test]
    fn offline_is_terminal() {
        for next in ALL_STATES {
            assert!(!ComponentState::Offline.can_transition_to(next));
        }
    }

    #[test]
    fn no_state_skips_discovery() {
        use ComponentState::{Busy, Joining, Ready};
        assert!(!Joining.can_transition_to(Ready));
        assert!(!Joining.can_transition_to(Busy));
    }

    proptest! {
        // Any sequence of permitted transitions never revisits JOINING or
        // DISCOVERING once left and never leaves OFFLINE.
        #[test]
        fn permitted_walks_are_monotonic(steps in proptest::collection::vec(0usize..6, 1..32)) {
            let mut state = ComponentState::Joining;
            let mut left_joining = false;
            let mut left_discovering = false;
            for step in steps {
                let next = ALL_STATES[step];
                if state.can_transition_to(next) {
                    if state == ComponentState::Joining && next != ComponentState::Joining {
                        left_joining = true;
                    }
                    if state == ComponentState::Discovering && next != ComponentState::Discovering {
                        left_discovering = true;
                    }
                    state = next;
                }
                if left_joining {
                    prop_assert_ne!(state, ComponentState::Joining);
                }
                if left_discovering {
                    prop_assert_ne!(state, ComponentState::Discovering);
                }
            }
        }
    }
}
