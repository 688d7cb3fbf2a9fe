use crate::run::package::ConfigurationSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Plan only; never applies
    Plan,
    Apply,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Plan => f.write_str("plan"),
            OperationKind::Apply => f.write_str("apply"),
        }
    }
}

/// A requested plan or apply against one workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub destroy: bool,
    pub auto_approve: bool,
    pub apply_if_no_changes: bool,
    pub message: Option<String>,
    pub config: ConfigurationSnapshot,
}

impl Operation {
    pub fn plan(config: ConfigurationSnapshot) -> Self {
        Self::new(OperationKind::Plan, config)
    }

    pub fn apply(config: ConfigurationSnapshot) -> Self {
        Self::new(OperationKind::Apply, config)
    }

    fn new(kind: OperationKind, config: ConfigurationSnapshot) -> Self {
        Self {
            kind,
            destroy: false,
            auto_approve: false,
            apply_if_no_changes: false,
            message: None,
            config,
        }
    }

    pub fn destroy(mut self, destroy: bool) -> Self {
        self.destroy = destroy;
        self
    }

    pub fn auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    pub fn apply_if_no_changes(mut self, apply: bool) -> Self {
        self.apply_if_no_changes = apply;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_plan_only(&self) -> bool {
        self.kind == OperationKind::Plan
    }

    /// Run message sent to the remote service
    pub fn run_message(&self) -> String {
        self.message.clone().unwrap_or_else(|| {
            format!("Queued by remote-runs ({}{})", self.kind, if self.destroy { ", destroy" } else { "" })
        })
    }
}
