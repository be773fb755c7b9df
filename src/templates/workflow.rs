// src/templates/workflow.rs
//! Workflows: conditional DAGs composing templates. A step runs its
//! template; when the named matcher (or any matcher) fires, the step's
//! subtemplates become eligible. The loader rejects cyclic definitions
//! and references to templates that are not in the store.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::TemplarError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub info: Option<super::model::Info>,
    pub workflows: Vec<WorkflowStep>,
    #[serde(skip)]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub template: String,
    /// Gate on a specific matcher name; absent means any match
    #[serde(default, rename = "matcher", skip_serializing_if = "Option::is_none")]
    pub matcher_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtemplates: Vec<WorkflowStep>,
}

impl Workflow {
    /// Validate the workflow against the set of known template ids.
    /// Rejects unknown references and any template id repeating along a
    /// root-to-leaf chain (a cycle once edges are followed).
    pub fn validate(&self, known_ids: &HashSet<String>) -> Result<(), TemplarError> {
        let mut chain = Vec::new();
        for step in &self.workflows {
            Self::validate_step(&self.id, step, known_ids, &mut chain)?;
        }
        Ok(())
    }

    fn validate_step(
        workflow_id: &str,
        step: &WorkflowStep,
        known_ids: &HashSet<String>,
        chain: &mut Vec<String>,
    ) -> Result<(), TemplarError> {
        if !known_ids.contains(&step.template) {
            return Err(TemplarError::Load(format!(
                "workflow {} references unknown template {}",
                workflow_id, step.template
            )));
        }
        if chain.iter().any(|id| id == &step.template) {
            return Err(TemplarError::Load(format!(
                "workflow {} contains a cycle through {}",
                workflow_id, step.template
            )));
        }

        chain.push(step.template.clone());
        for sub in &step.subtemplates {
            Self::validate_step(workflow_id, sub, known_ids, chain)?;
        }
        chain.pop();
        Ok(())
    }

    /// All template ids referenced anywhere in the workflow
    pub fn referenced_templates(&self) -> Vec<String> {
        let mut ids = Vec::new();
        fn collect(steps: &[WorkflowStep], ids: &mut Vec<String>) {
            for step in steps {
                ids.push(step.template.clone());
                collect(&step.subtemplates, ids);
            }
        }
        collect(&self.workflows, &mut ids);
        ids
    }
}
