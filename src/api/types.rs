//! Entity snapshots returned by the remote service.
//!
//! Every type here is an immutable value: a poll fetches a fresh snapshot and
//! the caller replaces the one it holds. Status enums keep unrecognized
//! strings in an `Unknown` variant so newer servers do not break decoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Organization-level permissions relevant to the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationPermissions {
    pub can_create_workspace: bool,
    pub can_update: bool,
    pub can_destroy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    pub email: Option<String>,
    pub permissions: OrganizationPermissions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub organization: String,
    pub working_directory: Option<String>,
    pub auto_apply: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceCreateOptions {
    pub name: String,
    pub working_directory: Option<String>,
    pub auto_apply: bool,
}

impl WorkspaceCreateOptions {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $wire:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            /// A status this client does not recognize, kept verbatim
            Unknown(String),
        }

        impl $name {
            pub fn parse(value: &str) -> Self {
                match value {
                    $($wire => $name::$variant,)+
                    other => $name::Unknown(other.to_string()),
                }
            }

            pub fn as_str(&self) -> &str {
                match self {
                    $($name::$variant => $wire,)+
                    $name::Unknown(other) => other.as_str(),
                }
            }

            pub fn is_unknown(&self) -> bool {
                matches!(self, $name::Unknown(_))
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $name::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_enum! {
    ConfigurationStatus {
        Pending => "pending",
        Uploaded => "uploaded",
        Errored => "errored",
    }
}

status_enum! {
    /// Remote run status vocabulary
    RunStatus {
        Pending => "pending",
        Planning => "planning",
        Planned => "planned",
        Confirmed => "confirmed",
        Applying => "applying",
        Applied => "applied",
        Errored => "errored",
        Discarded => "discarded",
        Canceled => "canceled",
    }
}

status_enum! {
    PlanStatus {
        Pending => "pending",
        Running => "running",
        Finished => "finished",
        Errored => "errored",
    }
}

status_enum! {
    PolicyStatus {
        Pending => "pending",
        Passed => "passed",
        Failed => "failed",
        Overridden => "overridden",
    }
}

status_enum! {
    ApplyStatus {
        Pending => "pending",
        Running => "running",
        Finished => "finished",
        Errored => "errored",
    }
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Applied | RunStatus::Errored | RunStatus::Discarded | RunStatus::Canceled
        )
    }

    /// The plan has completed remotely once the run has moved past planning.
    pub fn plan_completed(&self) -> bool {
        matches!(
            self,
            RunStatus::Planned | RunStatus::Confirmed | RunStatus::Applying | RunStatus::Applied
        )
    }
}

impl PolicyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PolicyStatus::Passed | PolicyStatus::Failed | PolicyStatus::Overridden
        )
    }

    pub fn allows_apply(&self) -> bool {
        matches!(self, PolicyStatus::Passed | PolicyStatus::Overridden)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationVersion {
    pub id: String,
    pub status: ConfigurationStatus,
    pub source: Option<String>,
    pub speculative: bool,
    pub upload_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationVersionCreateOptions {
    pub auto_queue_runs: bool,
    pub speculative: bool,
}

/// Summary of the resource changes a plan or apply reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChanges {
    pub additions: u32,
    pub changes: u32,
    pub destructions: u32,
}

impl ResourceChanges {
    pub fn new(additions: u32, changes: u32, destructions: u32) -> Self {
        Self {
            additions,
            changes,
            destructions,
        }
    }

    pub fn has_changes(&self) -> bool {
        self.additions > 0 || self.changes > 0 || self.destructions > 0
    }
}

impl fmt::Display for ResourceChanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to destroy",
            self.additions, self.changes, self.destructions
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub workspace_id: String,
    pub status: RunStatus,
    pub is_destroy: bool,
    pub message: Option<String>,
    pub configuration_version_id: Option<String>,
    pub plan_id: Option<String>,
    pub apply_id: Option<String>,
    pub policy_check_ids: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCreateOptions {
    pub workspace_id: String,
    pub configuration_version_id: String,
    pub is_destroy: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub status: PlanStatus,
    pub changes: ResourceChanges,
}

impl Plan {
    pub fn has_changes(&self) -> bool {
        self.changes.has_changes()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub passed: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCheck {
    pub id: String,
    pub status: PolicyStatus,
    pub result: PolicyResult,
    /// Whether an operator may override a failure of this check
    pub overridable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Apply {
    pub id: String,
    pub status: ApplyStatus,
    pub changes: ResourceChanges,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVersion {
    pub id: String,
    pub workspace_id: String,
    pub serial: u64,
    pub download_url: Option<String>,
}
