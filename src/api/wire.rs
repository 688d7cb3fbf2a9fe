//! JSON:API documents exchanged with the remote service.
//!
//! Attributes use kebab-case keys; related resources are referenced by id
//! under `relationships`. Decoding is lenient: optional attributes default,
//! and status strings are kept verbatim when unrecognized.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::api::types::*;

pub const CONTENT_TYPE: &str = "application/vnd.api+json";

#[derive(Debug, Deserialize)]
pub struct Document<A> {
    pub data: Resource<A>,
}

#[derive(Debug, Deserialize)]
pub struct ListDocument<A> {
    pub data: Vec<Resource<A>>,
    #[serde(default)]
    pub meta: Option<Meta>,
}

impl<A> ListDocument<A> {
    pub fn next_page(&self) -> Option<u32> {
        self.meta
            .as_ref()
            .and_then(|m| m.pagination.as_ref())
            .and_then(|p| p.next_page)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Meta {
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Pagination {
    pub current_page: Option<u32>,
    pub next_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct Resource<A> {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: A,
    #[serde(default)]
    pub relationships: HashMap<String, Relationship>,
}

impl<A> Resource<A> {
    /// Id of a to-one relationship, if present
    pub fn related_id(&self, name: &str) -> Option<String> {
        match self.relationships.get(name)?.data.as_ref()? {
            RelationshipData::One(r) => Some(r.id.clone()),
            RelationshipData::Many(_) => None,
        }
    }

    /// Ids of a to-many relationship; empty when absent
    pub fn related_ids(&self, name: &str) -> Vec<String> {
        match self.relationships.get(name).and_then(|r| r.data.as_ref()) {
            Some(RelationshipData::Many(refs)) => refs.iter().map(|r| r.id.clone()).collect(),
            Some(RelationshipData::One(r)) => vec![r.id.clone()],
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Relationship {
    #[serde(default)]
    pub data: Option<RelationshipData>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RelationshipData {
    One(ResourceRef),
    Many(Vec<ResourceRef>),
}

#[derive(Debug, Deserialize)]
pub struct ResourceRef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OrganizationAttributes {
    pub name: String,
    pub email: Option<String>,
    #[serde(default)]
    pub permissions: PermissionAttributes,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PermissionAttributes {
    #[serde(default)]
    pub can_create_workspace: bool,
    #[serde(default)]
    pub can_update: bool,
    #[serde(default)]
    pub can_destroy: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkspaceAttributes {
    pub name: String,
    pub working_directory: Option<String>,
    #[serde(default)]
    pub auto_apply: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigurationVersionAttributes {
    pub status: ConfigurationStatus,
    pub source: Option<String>,
    #[serde(default)]
    pub speculative: bool,
    pub upload_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunAttributes {
    pub status: RunStatus,
    #[serde(default)]
    pub is_destroy: bool,
    pub message: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChangeAttributes {
    pub status: String,
    #[serde(default)]
    pub resource_additions: u32,
    #[serde(default)]
    pub resource_changes: u32,
    #[serde(default)]
    pub resource_destructions: u32,
}

impl ChangeAttributes {
    fn changes(&self) -> ResourceChanges {
        ResourceChanges::new(
            self.resource_additions,
            self.resource_changes,
            self.resource_destructions,
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyCheckAttributes {
    pub status: PolicyStatus,
    #[serde(default)]
    pub result: Option<PolicyResultAttributes>,
    #[serde(default)]
    pub actions: Option<PolicyActionAttributes>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyResultAttributes {
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub total_failed: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyActionAttributes {
    #[serde(default)]
    pub is_overridable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StateVersionAttributes {
    pub serial: u64,
    pub hosted_state_download_url: Option<String>,
}

impl From<Resource<OrganizationAttributes>> for Organization {
    fn from(res: Resource<OrganizationAttributes>) -> Self {
        let a = res.attributes;
        Organization {
            name: a.name,
            email: a.email,
            permissions: OrganizationPermissions {
                can_create_workspace: a.permissions.can_create_workspace,
                can_update: a.permissions.can_update,
                can_destroy: a.permissions.can_destroy,
            },
        }
    }
}

pub fn workspace_from(organization: &str, res: Resource<WorkspaceAttributes>) -> Workspace {
    Workspace {
        id: res.id,
        name: res.attributes.name,
        organization: organization.to_string(),
        working_directory: res.attributes.working_directory,
        auto_apply: res.attributes.auto_apply,
    }
}

impl From<Resource<ConfigurationVersionAttributes>> for ConfigurationVersion {
    fn from(res: Resource<ConfigurationVersionAttributes>) -> Self {
        ConfigurationVersion {
            id: res.id,
            status: res.attributes.status,
            source: res.attributes.source,
            speculative: res.attributes.speculative,
            upload_url: res.attributes.upload_url,
        }
    }
}

impl From<Resource<RunAttributes>> for Run {
    fn from(res: Resource<RunAttributes>) -> Self {
        Run {
            workspace_id: res.related_id("workspace").unwrap_or_default(),
            configuration_version_id: res.related_id("configuration-version"),
            plan_id: res.related_id("plan"),
            apply_id: res.related_id("apply"),
            policy_check_ids: res.related_ids("policy-checks"),
            status: res.attributes.status,
            is_destroy: res.attributes.is_destroy,
            message: res.attributes.message,
            created_at: res.attributes.created_at,
            id: res.id,
        }
    }
}

impl From<Resource<ChangeAttributes>> for Plan {
    fn from(res: Resource<ChangeAttributes>) -> Self {
        Plan {
            status: PlanStatus::parse(&res.attributes.status),
            changes: res.attributes.changes(),
            id: res.id,
        }
    }
}

impl From<Resource<ChangeAttributes>> for Apply {
    fn from(res: Resource<ChangeAttributes>) -> Self {
        Apply {
            status: ApplyStatus::parse(&res.attributes.status),
            changes: res.attributes.changes(),
            id: res.id,
        }
    }
}

impl From<Resource<PolicyCheckAttributes>> for PolicyCheck {
    fn from(res: Resource<PolicyCheckAttributes>) -> Self {
        let result = res.attributes.result.unwrap_or_default();
        PolicyCheck {
            id: res.id,
            status: res.attributes.status,
            result: PolicyResult {
                passed: result.passed,
                failed: result.total_failed,
            },
            overridable: res
                .attributes
                .actions
                .map(|a| a.is_overridable)
                .unwrap_or(false),
        }
    }
}

pub fn state_version_from(workspace_id: &str, res: Resource<StateVersionAttributes>) -> StateVersion {
    StateVersion {
        id: res.id,
        workspace_id: workspace_id.to_string(),
        serial: res.attributes.serial,
        download_url: res.attributes.hosted_state_download_url,
    }
}

pub fn workspace_create_body(options: &WorkspaceCreateOptions) -> Value {
    json!({
        "data": {
            "type": "workspaces",
            "attributes": {
                "name": options.name,
                "working-directory": options.working_directory,
                "auto-apply": options.auto_apply,
            }
        }
    })
}

pub fn configuration_version_create_body(options: &ConfigurationVersionCreateOptions) -> Value {
    json!({
        "data": {
            "type": "configuration-versions",
            "attributes": {
                "auto-queue-runs": options.auto_queue_runs,
                "speculative": options.speculative,
            }
        }
    })
}

pub fn run_create_body(options: &RunCreateOptions) -> Value {
    json!({
        "data": {
            "type": "runs",
            "attributes": {
                "is-destroy": options.is_destroy,
                "message": options.message,
            },
            "relationships": {
                "workspace": {
                    "data": { "type": "workspaces", "id": options.workspace_id }
                },
                "configuration-version": {
                    "data": { "type": "configuration-versions", "id": options.configuration_version_id }
                }
            }
        }
    })
}

pub fn comment_body(comment: &str) -> Value {
    json!({ "comment": comment })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_document_decodes_relationships() {
        let body = r#"{
          "data": {
            "id": "run-CZcmD7eagjhyX0vN",
            "type": "runs",
            "attributes": {
              "status": "planned",
              "is-destroy": true,
              "message": "Queued manually",
              "created-at": "2018-05-02T22:34:36.237Z"
            },
            "relationships": {
              "workspace": { "data": { "id": "ws-1", "type": "workspaces" } },
              "plan": { "data": { "id": "plan-1", "type": "plans" } },
              "apply": { "data": null },
              "policy-checks": { "data": [ { "id": "polchk-1", "type": "policy-checks" } ] }
            }
          }
        }"#;

        let doc: Document<RunAttributes> = serde_json::from_str(body).unwrap();
        let run = Run::from(doc.data);
        assert_eq!(run.id, "run-CZcmD7eagjhyX0vN");
        assert_eq!(run.status, RunStatus::Planned);
        assert!(run.is_destroy);
        assert_eq!(run.workspace_id, "ws-1");
        assert_eq!(run.plan_id.as_deref(), Some("plan-1"));
        assert_eq!(run.apply_id, None);
        assert_eq!(run.policy_check_ids, vec!["polchk-1".to_string()]);
    }

    #[test]
    fn test_organization_permissions_default_when_absent() {
        let body = r#"{"data":{"id":"hashicorp","type":"organizations","attributes":{"name":"hashicorp"}}}"#;
        let doc: Document<OrganizationAttributes> = serde_json::from_str(body).unwrap();
        let org = Organization::from(doc.data);
        assert_eq!(org.name, "hashicorp");
        assert!(!org.permissions.can_create_workspace);
    }

    #[test]
    fn test_list_document_pagination() {
        let body = r#"{"data":[],"meta":{"pagination":{"current-page":1,"next-page":2}}}"#;
        let doc: ListDocument<WorkspaceAttributes> = serde_json::from_str(body).unwrap();
        assert_eq!(doc.next_page(), Some(2));
    }
}
