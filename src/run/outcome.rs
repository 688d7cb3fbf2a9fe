use serde::Serialize;
use std::fmt;

use crate::api::types::{ResourceChanges, StateVersion};
use crate::run::state_machine::RunPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    OperatorRejected,
    ConfirmationTimedOut,
    /// The remote service discarded the run on its own
    Remote,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DiscardReason::OperatorRejected => "rejected by operator",
            DiscardReason::ConfirmationTimedOut => "confirmation timed out",
            DiscardReason::Remote => "discarded remotely",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Applied {
        changes: ResourceChanges,
        state_version: Option<StateVersion>,
    },
    /// A plan-only run finished with changes to report
    Planned { changes: ResourceChanges },
    NoChanges,
    Discarded { reason: DiscardReason },
    Canceled,
}

impl RunOutcome {
    pub fn summary(&self) -> String {
        match self {
            RunOutcome::Applied { changes, state_version } => {
                let serial = state_version
                    .as_ref()
                    .map(|sv| format!(" (state serial {})", sv.serial))
                    .unwrap_or_default();
                format!(
                    "Apply complete! Resources: {} added, {} changed, {} destroyed.{serial}",
                    changes.additions, changes.changes, changes.destructions
                )
            }
            RunOutcome::Planned { changes } => format!("Plan: {changes}."),
            RunOutcome::NoChanges => {
                "No changes. Infrastructure is up-to-date.".to_string()
            }
            RunOutcome::Discarded { reason } => format!("Run discarded: {reason}."),
            RunOutcome::Canceled => "Run canceled.".to_string(),
        }
    }
}

/// What the caller gets back from a finished operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Option<String>,
    pub workspace: String,
    pub phase: RunPhase,
    pub outcome: RunOutcome,
}
