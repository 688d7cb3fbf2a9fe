//! Phase machine for a single run.
//!
//! The machine is pure: it never talks to the remote service. The
//! orchestrator feeds it events derived from polls and checks the resulting
//! phase before every side effect.

use serde::Serialize;
use statig::blocking::StateMachine;
use statig::prelude::*;
use thiserror::Error;

use crate::api::types::PlanStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    UploadStarted,
    RunCreated { run_id: String },
    PlanStarted,
    /// The plan reached `status`; only a finished plan ends planning
    PlanFinished { status: PlanStatus, has_changes: bool },
    PolicyChecksStarted { count: usize },
    PoliciesCleared,
    PolicyDenied,
    NoChanges,
    PlanOnlyComplete,
    ReadyToConfirm,
    Confirmed,
    Rejected,
    Discarded,
    ApplyFinished,
    Failed { reason: String },
    Cancel,
}

/// Externally visible phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Created,
    ConfigVersionUploading,
    RunPending,
    Planning,
    PlanFinished,
    PolicyChecking,
    AwaitingConfirmation,
    Applying,
    Applied,
    Planned,
    Errored,
    Discarded,
    Canceled,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunPhase::Applied
                | RunPhase::Planned
                | RunPhase::Errored
                | RunPhase::Discarded
                | RunPhase::Canceled
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("event {event:?} moved the run from {from:?} to {actual:?}, expected {expected:?}")]
    Unexpected {
        from: RunPhase,
        event: RunEvent,
        expected: RunPhase,
        actual: RunPhase,
    },
}

/// Guard data for the run lifecycle
#[derive(Debug, Default)]
pub struct RunMachine {
    has_changes: bool,
    apply_if_no_changes: bool,
    pending_policy_checks: usize,
}

impl RunMachine {
    pub fn new(apply_if_no_changes: bool) -> Self {
        Self {
            apply_if_no_changes,
            ..Default::default()
        }
    }
}

#[state_machine(
    initial = "State::created()",
    state(derive(Debug, Clone, PartialEq, Eq))
)]
impl RunMachine {
    #[state(superstate = "active")]
    fn created(&mut self, event: &RunEvent) -> Outcome<State> {
        match event {
            RunEvent::UploadStarted => Transition(State::config_version_uploading()),
            _ => Super,
        }
    }

    #[state(superstate = "active")]
    fn config_version_uploading(&mut self, event: &RunEvent) -> Outcome<State> {
        match event {
            RunEvent::RunCreated { run_id } => {
                tracing::debug!(run.id = %run_id, "Run created");
                Transition(State::run_pending())
            }
            _ => Super,
        }
    }

    #[state(superstate = "active")]
    fn run_pending(&mut self, event: &RunEvent) -> Outcome<State> {
        match event {
            RunEvent::PlanStarted => Transition(State::planning()),
            RunEvent::PlanFinished {
                status: PlanStatus::Finished,
                has_changes,
            } => {
                self.has_changes = *has_changes;
                Transition(State::plan_finished())
            }
            RunEvent::PlanFinished { .. } => Handled,
            _ => Super,
        }
    }

    #[state(superstate = "active")]
    fn planning(&mut self, event: &RunEvent) -> Outcome<State> {
        match event {
            RunEvent::PlanStarted | RunEvent::PlanFinished { .. } if !finished_plan(event) => Handled,
            RunEvent::PlanFinished { has_changes, .. } => {
                self.has_changes = *has_changes;
                Transition(State::plan_finished())
            }
            _ => Super,
        }
    }

    #[state(superstate = "plan_review")]
    fn plan_finished(&mut self, event: &RunEvent) -> Outcome<State> {
        match event {
            RunEvent::PolicyChecksStarted { count } if *count > 0 => {
                self.pending_policy_checks = *count;
                Transition(State::policy_checking())
            }
            RunEvent::PolicyChecksStarted { .. } => Handled,
            _ => Super,
        }
    }

    #[state(superstate = "plan_review")]
    fn policy_checking(&mut self, event: &RunEvent) -> Outcome<State> {
        match event {
            RunEvent::PoliciesCleared => {
                self.pending_policy_checks = 0;
                Handled
            }
            RunEvent::PolicyDenied => {
                tracing::warn!(
                    pending = self.pending_policy_checks,
                    "Policy check failed, discarding run"
                );
                Transition(State::discarded())
            }
            _ => Super,
        }
    }

    /// Decisions that need a finished plan and no outstanding policy checks
    #[superstate(superstate = "active")]
    fn plan_review(&mut self, event: &RunEvent) -> Outcome<State> {
        let gated = self.pending_policy_checks > 0;
        match event {
            RunEvent::NoChanges if !gated && !self.has_changes => Transition(State::applied()),
            RunEvent::PlanOnlyComplete if !gated => Transition(State::planned()),
            RunEvent::ReadyToConfirm
                if !gated && (self.has_changes || self.apply_if_no_changes) =>
            {
                Transition(State::awaiting_confirmation())
            }
            RunEvent::NoChanges | RunEvent::PlanOnlyComplete | RunEvent::ReadyToConfirm => {
                Handled
            }
            _ => Super,
        }
    }

    #[state(superstate = "active")]
    fn awaiting_confirmation(&mut self, event: &RunEvent) -> Outcome<State> {
        match event {
            RunEvent::Confirmed => Transition(State::applying()),
            RunEvent::Rejected => Transition(State::discarded()),
            _ => Super,
        }
    }

    #[state(superstate = "active")]
    fn applying(&mut self, event: &RunEvent) -> Outcome<State> {
        match event {
            RunEvent::ApplyFinished => Transition(State::applied()),
            _ => Super,
        }
    }

    #[superstate]
    fn active(&mut self, event: &RunEvent) -> Outcome<State> {
        match event {
            RunEvent::Failed { reason } => {
                tracing::error!(reason = %reason, "Run errored");
                Transition(State::errored())
            }
            RunEvent::Cancel => Transition(State::canceled()),
            RunEvent::Discarded => Transition(State::discarded()),
            _ => Handled,
        }
    }

    #[state]
    fn applied(event: &RunEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn planned(event: &RunEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn errored(event: &RunEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn discarded(event: &RunEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn canceled(event: &RunEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }
}

fn finished_plan(event: &RunEvent) -> bool {
    matches!(
        event,
        RunEvent::PlanFinished {
            status: PlanStatus::Finished,
            ..
        }
    )
}

impl From<&State> for RunPhase {
    fn from(state: &State) -> Self {
        match state {
            State::Created { .. } => RunPhase::Created,
            State::ConfigVersionUploading { .. } => RunPhase::ConfigVersionUploading,
            State::RunPending { .. } => RunPhase::RunPending,
            State::Planning { .. } => RunPhase::Planning,
            State::PlanFinished { .. } => RunPhase::PlanFinished,
            State::PolicyChecking { .. } => RunPhase::PolicyChecking,
            State::AwaitingConfirmation { .. } => RunPhase::AwaitingConfirmation,
            State::Applying { .. } => RunPhase::Applying,
            State::Applied { .. } => RunPhase::Applied,
            State::Planned { .. } => RunPhase::Planned,
            State::Errored { .. } => RunPhase::Errored,
            State::Discarded { .. } => RunPhase::Discarded,
            State::Canceled { .. } => RunPhase::Canceled,
        }
    }
}

/// Phase tracker for one run, fed with events derived from remote polls
pub struct RunLifecycle {
    machine: StateMachine<RunMachine>,
}

impl std::fmt::Debug for RunLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLifecycle")
            .field("phase", &self.phase())
            .finish()
    }
}

impl RunLifecycle {
    pub fn new(apply_if_no_changes: bool) -> Self {
        Self {
            machine: RunMachine::new(apply_if_no_changes).state_machine(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        RunPhase::from(self.machine.state())
    }

    pub fn handle(&mut self, event: RunEvent) -> RunPhase {
        self.machine.handle(&event);
        self.phase()
    }

    /// Handle `event` and require that the run lands in `expected`
    pub fn advance(&mut self, event: RunEvent, expected: RunPhase) -> Result<(), TransitionError> {
        let from = self.phase();
        let actual = self.handle(event.clone());
        if actual == expected {
            Ok(())
        } else {
            Err(TransitionError::Unexpected {
                from,
                event,
                expected,
                actual,
            })
        }
    }
}
