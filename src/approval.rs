//! Typed model of an invoice approval workflow.
//!
//! Workflows arrive as JSON and deserialise into a map of named steps. A
//! step is one of three kinds, each carrying only the data that kind needs:
//!
//! ```json
//! {
//!   "start": "extract",
//!   "steps": {
//!     "extract":  {"type": "system_action", "action": "extract_invoice", "next": "review"},
//!     "review":   {"type": "user_action", "role": "approver",
//!                  "transitions": {"approve": "approved", "reject": "rejected"}},
//!     "approved": {"type": "terminal", "outcome": "approved"},
//!     "rejected": {"type": "terminal", "outcome": "rejected"}
//!   }
//! }
//! ```
//!
//! There is no execution engine: callers hold the current step name and
//! ask [`WorkflowDefinition::next_step`] where an action leads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Performed automatically, then moves to `next`.
    SystemAction { action: String, next: String },
    /// Waits for a user holding `role`; `transitions` maps action → step.
    UserAction {
        role: String,
        transitions: BTreeMap<String, String>,
    },
    Terminal { outcome: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub start: String,
    pub steps: BTreeMap<String, Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("workflow definition is not valid JSON: {0}")]
    Parse(String),

    #[error("start step '{0}' is not defined")]
    MissingStart(String),

    #[error("step '{from}' leads to undefined step '{target}'")]
    UnknownTarget { from: String, target: String },

    #[error("workflow has no terminal step")]
    NoTerminal,

    #[error("step '{0}' is not defined")]
    UnknownStep(String),

    #[error("step '{step}' has no action '{action}'")]
    UnknownAction { step: String, action: String },

    #[error("step '{step}' requires role '{required}', not '{actual}'")]
    RoleNotAllowed {
        step: String,
        required: String,
        actual: String,
    },

    #[error("step '{0}' is terminal")]
    Finished(String),
}

impl WorkflowDefinition {
    /// Parse and validate a JSON definition.
    pub fn from_json(json: &str) -> Result<Self, WorkflowError> {
        let def: Self =
            serde_json::from_str(json).map_err(|e| WorkflowError::Parse(e.to_string()))?;
        def.validate()?;
        Ok(def)
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if !self.steps.contains_key(&self.start) {
            return Err(WorkflowError::MissingStart(self.start.clone()));
        }

        for (name, step) in &self.steps {
            let targets: Vec<&String> = match step {
                Step::SystemAction { next, .. } => vec![next],
                Step::UserAction { transitions, .. } => transitions.values().collect(),
                Step::Terminal { .. } => Vec::new(),
            };
            if let Some(target) = targets.into_iter().find(|t| !self.steps.contains_key(*t)) {
                return Err(WorkflowError::UnknownTarget {
                    from: name.clone(),
                    target: target.clone(),
                });
            }
        }

        if !self.steps.values().any(|s| matches!(s, Step::Terminal { .. })) {
            return Err(WorkflowError::NoTerminal);
        }
        Ok(())
    }

    /// Where `action`, performed by `role` at step `current`, leads.
    pub fn next_step(&self, current: &str, action: &str, role: &str) -> Result<&str, WorkflowError> {
        let step = self
            .steps
            .get(current)
            .ok_or_else(|| WorkflowError::UnknownStep(current.to_string()))?;

        let unknown = || WorkflowError::UnknownAction {
            step: current.to_string(),
            action: action.to_string(),
        };

        match step {
            Step::SystemAction { action: a, next } if a == action => Ok(next.as_str()),
            Step::SystemAction { .. } => Err(unknown()),
            Step::UserAction { role: r, .. } if r != role => Err(WorkflowError::RoleNotAllowed {
                step: current.to_string(),
                required: r.clone(),
                actual: role.to_string(),
            }),
            Step::UserAction { transitions, .. } => {
                transitions.get(action).map(String::as_str).ok_or_else(unknown)
            }
            Step::Terminal { .. } => Err(WorkflowError::Finished(current.to_string())),
        }
    }
}
