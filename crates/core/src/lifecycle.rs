//! Pipeline state machine.
//!
//! ```text
//!        activate            services ready
//! Idle ───────────► Starting ──────────────► Active
//!  ▲                   │                       │
//!  │  services failed  │                       │ deactivate
//!  ├───────────────────┘                       ▼
//!  └────────────────────────────────────── Stopping
//!              services stopped
//! ```
//!
//! [`transition`] is a pure function: it returns the next state and the
//! side effects the caller must run, or `None` when the event is a no-op
//! in the current state. Activating while `Starting`/`Active` and
//! deactivating while `Idle`/`Stopping` are no-ops, so repeated signals
//! from the host never bind ports twice.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    Starting,
    Active,
    Stopping,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Active => write!(f, "active"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Activate,
    ServicesReady,
    ServicesFailed,
    Deactivate,
    ServicesStopped,
}

/// Work the caller performs after entering the new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    StartServices,
    StopServices,
    TeardownBranches,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: PipelineState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: PipelineState, effects: &[Effect]) -> Self {
        Self {
            next,
            effects: effects.to_vec(),
        }
    }
}

pub fn transition(state: PipelineState, event: LifecycleEvent) -> Option<Transition> {
    use Effect::*;
    use LifecycleEvent::*;
    use PipelineState::*;

    match (state, event) {
        (Idle, Activate) => Some(Transition::to(Starting, &[StartServices])),
        (Starting, ServicesReady) => Some(Transition::to(Active, &[])),
        (Starting, ServicesFailed) => Some(Transition::to(Idle, &[])),
        (Active, Deactivate) => Some(Transition::to(Stopping, &[StopServices, TeardownBranches])),
        (Stopping, ServicesStopped) => Some(Transition::to(Idle, &[])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle() {
        let t = transition(PipelineState::Idle, LifecycleEvent::Activate).unwrap();
        assert_eq!(t.next, PipelineState::Starting);
        assert_eq!(t.effects, vec![Effect::StartServices]);

        let t = transition(t.next, LifecycleEvent::ServicesReady).unwrap();
        assert_eq!(t.next, PipelineState::Active);

        let t = transition(t.next, LifecycleEvent::Deactivate).unwrap();
        assert_eq!(t.next, PipelineState::Stopping);
        assert_eq!(t.effects, vec![Effect::StopServices, Effect::TeardownBranches]);

        let t = transition(t.next, LifecycleEvent::ServicesStopped).unwrap();
        assert_eq!(t.next, PipelineState::Idle);
    }

    #[test]
    fn startup_failure_returns_to_idle() {
        let t = transition(PipelineState::Starting, LifecycleEvent::ServicesFailed).unwrap();
        assert_eq!(t.next, PipelineState::Idle);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn repeated_signals_are_noops() {
        assert!(transition(PipelineState::Active, LifecycleEvent::Activate).is_none());
        assert!(transition(PipelineState::Starting, LifecycleEvent::Activate).is_none());
        assert!(transition(PipelineState::Idle, LifecycleEvent::Deactivate).is_none());
        assert!(transition(PipelineState::Stopping, LifecycleEvent::Deactivate).is_none());
    }

    #[test]
    fn out_of_order_events_rejected() {
        assert!(transition(PipelineState::Idle, LifecycleEvent::ServicesReady).is_none());
        assert!(transition(PipelineState::Active, LifecycleEvent::ServicesStopped).is_none());
        assert!(transition(PipelineState::Stopping, LifecycleEvent::Activate).is_none());
    }
}
