//! Pipeline domain model

use crate::core::step::{Step, StepKind};
use serde::Serialize;
use std::collections::BTreeMap;

/// A loaded pipeline: top-level env and agent rules plus the step list
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Pipeline {
    /// Pipeline-level environment, applied to every job
    pub env: BTreeMap<String, String>,

    /// Top-level `agents:` rules, inherited by steps that set none
    pub agent_query_rules: Vec<String>,

    /// Steps in source order
    pub steps: Vec<Step>,
}

impl Pipeline {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            env: BTreeMap::new(),
            agent_query_rules: Vec::new(),
            steps,
        }
    }

    /// Number of steps including those nested in groups (groups themselves excluded)
    pub fn step_count(&self) -> usize {
        fn count(steps: &[Step]) -> usize {
            steps
                .iter()
                .map(|s| match s.kind {
                    StepKind::Group => count(&s.steps),
                    _ => 1,
                })
                .sum()
        }
        count(&self.steps)
    }

    /// All step keys in source order, descending into groups
    pub fn keys(&self) -> Vec<String> {
        fn collect(steps: &[Step], out: &mut Vec<String>) {
            for step in steps {
                if let Some(key) = &step.key {
                    out.push(key.clone());
                }
                collect(&step.steps, out);
            }
        }
        let mut keys = Vec::new();
        collect(&self.steps, &mut keys);
        keys
    }
}
