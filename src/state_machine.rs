//! State machine for one profile activation
//!
//! All transitions go through [`reduce`], which returns the next state and the
//! effects to execute. The orchestrator runs the effects and feeds their
//! results back in as events until the activation reaches `Done` or `Failed`.

use std::fmt;

use uuid::Uuid;

use crate::display::{ActivationOutcome, DisplayTopologySnapshot, SnapshotError};
use crate::hotkey::{KeyCombination, SlotId};
use crate::profile::{DisplayProfile, ProfileId, ResolveError};

/// What started an activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    HotKey {
        slot: SlotId,
        combination: KeyCombination,
    },
    Direct {
        profile_id: ProfileId,
    },
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::HotKey { slot, combination } => {
                write!(f, "hotkey {} (slot {})", combination, slot)
            }
            Trigger::Direct { profile_id } => {
                write!(f, "direct request for profile {}", profile_id)
            }
        }
    }
}

/// Pipeline stage at which an activation gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Snapshot,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Resolve => write!(f, "resolve"),
            Stage::Snapshot => write!(f, "snapshot"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("cancelled")]
    Cancelled,
}

/// `Failed(stage, reason)`: an activation that never reached the applier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("activation failed at {stage} stage: {reason}")]
pub struct ActivationFailure {
    pub stage: Stage,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, Default)]
pub enum State {
    #[default]
    Idle,
    SlotReceived {
        activation_id: Uuid,
        trigger: Trigger,
    },
    Resolved {
        activation_id: Uuid,
        profile: DisplayProfile,
    },
    Applying {
        activation_id: Uuid,
        profile_id: ProfileId,
        profile_name: String,
    },
    Done {
        activation_id: Uuid,
        profile_id: ProfileId,
        profile_name: String,
        outcome: ActivationOutcome,
    },
    Failed {
        activation_id: Uuid,
        failure: ActivationFailure,
    },
}

impl State {
    pub fn activation_id(&self) -> Option<Uuid> {
        match self {
            State::Idle => None,
            State::SlotReceived { activation_id, .. }
            | State::Resolved { activation_id, .. }
            | State::Applying { activation_id, .. }
            | State::Done { activation_id, .. }
            | State::Failed { activation_id, .. } => Some(*activation_id),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            State::Idle => "Idle",
            State::SlotReceived { .. } => "SlotReceived",
            State::Resolved { .. } => "Resolved",
            State::Applying { .. } => "Applying",
            State::Done { .. } => "Done",
            State::Failed { .. } => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Done { .. } | State::Failed { .. })
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Triggered {
        id: Uuid,
        trigger: Trigger,
    },
    ProfileResolved {
        id: Uuid,
        profile: DisplayProfile,
    },
    ResolveFailed {
        id: Uuid,
        err: ResolveError,
    },
    SnapshotCaptured {
        id: Uuid,
        snapshot: DisplayTopologySnapshot,
    },
    SnapshotFailed {
        id: Uuid,
        err: SnapshotError,
    },
    ApplyFinished {
        id: Uuid,
        outcome: ActivationOutcome,
    },
    /// Cooperative cancellation observed between stages
    Cancel,
}

#[derive(Debug, Clone)]
pub enum Effect {
    Resolve {
        id: Uuid,
        trigger: Trigger,
    },
    CaptureSnapshot {
        id: Uuid,
    },
    Apply {
        id: Uuid,
        profile: DisplayProfile,
        snapshot: DisplayTopologySnapshot,
    },
    /// Report the terminal state to subscribers
    EmitOutcome,
}

fn failed(activation_id: Uuid, stage: Stage, reason: FailureReason) -> (State, Vec<Effect>) {
    (
        State::Failed {
            activation_id,
            failure: ActivationFailure { stage, reason },
        },
        vec![Effect::EmitOutcome],
    )
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Events carrying an id that does not match the current activation are
/// ignored. A new trigger is only accepted from `Idle` or a terminal state;
/// the orchestrator guarantees one activation at a time.
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current = state.activation_id();

    match (state, event) {
        // -----------------
        // Start
        // -----------------
        (Idle | Done { .. } | Failed { .. }, Triggered { id, trigger }) => (
            SlotReceived {
                activation_id: id,
                trigger: trigger.clone(),
            },
            vec![Resolve { id, trigger }],
        ),

        // -----------------
        // SlotReceived
        // -----------------
        (SlotReceived { activation_id, .. }, ProfileResolved { id, profile })
            if *activation_id == id =>
        {
            (
                Resolved {
                    activation_id: id,
                    profile,
                },
                vec![CaptureSnapshot { id }],
            )
        }
        (SlotReceived { activation_id, .. }, ResolveFailed { id, err }) if *activation_id == id => {
            failed(id, Stage::Resolve, err.into())
        }
        (SlotReceived { activation_id, .. }, Cancel) => {
            failed(*activation_id, Stage::Resolve, FailureReason::Cancelled)
        }

        // -----------------
        // Resolved
        // -----------------
        (
            Resolved {
                activation_id,
                profile,
            },
            SnapshotCaptured { id, snapshot },
        ) if *activation_id == id => (
            Applying {
                activation_id: id,
                profile_id: profile.id,
                profile_name: profile.name.clone(),
            },
            vec![Apply {
                id,
                profile: profile.clone(),
                snapshot,
            }],
        ),
        (Resolved { activation_id, .. }, SnapshotFailed { id, err }) if *activation_id == id => {
            failed(id, Stage::Snapshot, err.into())
        }
        (Resolved { activation_id, .. }, Cancel) => {
            failed(*activation_id, Stage::Snapshot, FailureReason::Cancelled)
        }

        // -----------------
        // Applying
        // -----------------
        // The applier handles cancellation per display; it always finishes.
        (
            Applying {
                activation_id,
                profile_id,
                profile_name,
            },
            ApplyFinished { id, outcome },
        ) if *activation_id == id => (
            Done {
                activation_id: id,
                profile_id: *profile_id,
                profile_name: profile_name.clone(),
                outcome,
            },
            vec![EmitOutcome],
        ),

        // -----------------
        // Stale or unexpected events: no transition
        // -----------------
        (_, event) => {
            log::debug!(
                "Ignoring {:?} in state {} (current activation {:?})",
                std::mem::discriminant(&event),
                state.name(),
                current
            );
            (state.clone(), vec![])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::OutcomeStatus;
    use chrono::Utc;

    fn hotkey_trigger() -> Trigger {
        Trigger::HotKey {
            slot: SlotId(1),
            combination: KeyCombination::new(0x31).ctrl().alt(),
        }
    }

    fn snapshot() -> DisplayTopologySnapshot {
        DisplayTopologySnapshot {
            displays: Vec::new(),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn idle_trigger_requests_resolution() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &State::Idle,
            Event::Triggered {
                id,
                trigger: hotkey_trigger(),
            },
        );
        assert!(matches!(next, State::SlotReceived { activation_id, .. } if activation_id == id));
        assert!(matches!(effects.as_slice(), [Effect::Resolve { .. }]));
    }

    #[test]
    fn happy_path_reaches_done() {
        let id = Uuid::new_v4();
        let profile = DisplayProfile::new(1, "P1");

        let (state, _) = reduce(&State::Idle, Event::Triggered { id, trigger: hotkey_trigger() });
        let (state, effects) = reduce(&state, Event::ProfileResolved { id, profile });
        assert!(matches!(state, State::Resolved { .. }));
        assert!(matches!(effects.as_slice(), [Effect::CaptureSnapshot { .. }]));

        let (state, effects) = reduce(&state, Event::SnapshotCaptured { id, snapshot: snapshot() });
        assert!(matches!(state, State::Applying { .. }));
        assert!(matches!(effects.as_slice(), [Effect::Apply { .. }]));

        let outcome = ActivationOutcome {
            status: OutcomeStatus::Applied,
            displays: Vec::new(),
        };
        let (state, effects) = reduce(&state, Event::ApplyFinished { id, outcome });
        assert!(matches!(state, State::Done { .. }));
        assert!(state.is_terminal());
        assert!(matches!(effects.as_slice(), [Effect::EmitOutcome]));
    }

    #[test]
    fn resolve_failure_short_circuits() {
        let id = Uuid::new_v4();
        let (state, _) = reduce(&State::Idle, Event::Triggered { id, trigger: hotkey_trigger() });
        let (state, effects) = reduce(
            &state,
            Event::ResolveFailed {
                id,
                err: ResolveError::UnknownSlot(SlotId(1)),
            },
        );
        match state {
            State::Failed { failure, .. } => {
                assert_eq!(failure.stage, Stage::Resolve);
                assert_eq!(
                    failure.reason,
                    FailureReason::Resolve(ResolveError::UnknownSlot(SlotId(1)))
                );
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(matches!(effects.as_slice(), [Effect::EmitOutcome]));
    }

    #[test]
    fn snapshot_failure_is_reported_at_snapshot_stage() {
        let id = Uuid::new_v4();
        let state = State::Resolved {
            activation_id: id,
            profile: DisplayProfile::new(1, "P1"),
        };
        let (state, _) = reduce(
            &state,
            Event::SnapshotFailed {
                id,
                err: SnapshotError::EnumerationFailed("gone".into()),
            },
        );
        assert!(matches!(
            state,
            State::Failed { failure: ActivationFailure { stage: Stage::Snapshot, .. }, .. }
        ));
    }

    #[test]
    fn cancel_before_applying_aborts() {
        let id = Uuid::new_v4();
        let state = State::SlotReceived {
            activation_id: id,
            trigger: hotkey_trigger(),
        };
        let (next, _) = reduce(&state, Event::Cancel);
        assert!(matches!(
            next,
            State::Failed {
                failure: ActivationFailure {
                    reason: FailureReason::Cancelled,
                    ..
                },
                ..
            }
        ));
    }

    #[test]
    fn cancel_while_applying_is_left_to_the_applier() {
        let id = Uuid::new_v4();
        let state = State::Applying {
            activation_id: id,
            profile_id: ProfileId(1),
            profile_name: "P1".into(),
        };
        let (next, effects) = reduce(&state, Event::Cancel);
        assert!(matches!(next, State::Applying { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn stale_event_is_ignored() {
        let id = Uuid::new_v4();
        let state = State::SlotReceived {
            activation_id: id,
            trigger: hotkey_trigger(),
        };
        let (next, effects) = reduce(
            &state,
            Event::ProfileResolved {
                id: Uuid::new_v4(),
                profile: DisplayProfile::new(1, "P1"),
            },
        );
        assert!(matches!(next, State::SlotReceived { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn trigger_while_in_flight_is_ignored() {
        let id = Uuid::new_v4();
        let state = State::Resolved {
            activation_id: id,
            profile: DisplayProfile::new(1, "P1"),
        };
        let (next, effects) = reduce(
            &state,
            Event::Triggered {
                id: Uuid::new_v4(),
                trigger: hotkey_trigger(),
            },
        );
        assert_eq!(next.activation_id(), Some(id));
        assert!(effects.is_empty());
    }

    #[test]
    fn terminal_state_accepts_next_trigger() {
        let state = State::Failed {
            activation_id: Uuid::new_v4(),
            failure: ActivationFailure {
                stage: Stage::Resolve,
                reason: FailureReason::Cancelled,
            },
        };
        let id = Uuid::new_v4();
        let (next, _) = reduce(
            &state,
            Event::Triggered {
                id,
                trigger: Trigger::Direct { profile_id: ProfileId(2) },
            },
        );
        assert_eq!(next.activation_id(), Some(id));
    }
}
