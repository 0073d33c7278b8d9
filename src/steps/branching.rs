use crate::error::Result;
use crate::property::{Property, Values};
use crate::step::{Step, StepContext, StepResult, BRANCH_DEFAULT};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

pub const NEXT_STEP_NAME: &str = "next_step_name";

/// Picks a branch from its `next_step_name` input.
///
/// Values missing from the mapping take the `default` branch.
pub struct BranchingStep {
    mapping: BTreeMap<String, String>,
    inputs: Vec<Property>,
}

impl BranchingStep {
    pub fn new<K: Into<String>, B: Into<String>>(
        mapping: impl IntoIterator<Item = (K, B)>,
    ) -> Self {
        Self {
            mapping: mapping.into_iter().map(|(k, b)| (k.into(), b.into())).collect(),
            inputs: vec![Property::string(NEXT_STEP_NAME)],
        }
    }
}

#[async_trait]
impl Step for BranchingStep {
    fn kind(&self) -> &'static str {
        "branching"
    }

    fn input_descriptors(&self) -> &[Property] {
        &self.inputs
    }

    fn output_descriptors(&self) -> &[Property] {
        &[]
    }

    fn branches(&self) -> Vec<String> {
        let mut branches: Vec<String> = self.mapping.values().cloned().collect();
        branches.sort();
        branches.dedup();
        branches.retain(|b| b != BRANCH_DEFAULT);
        branches.push(BRANCH_DEFAULT.to_string());
        branches
    }

    async fn invoke(&self, inputs: Values, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let key = match inputs.get(NEXT_STEP_NAME) {
            Some(Value::String(s)) => s.as_str(),
            _ => "",
        };
        let branch = self.mapping.get(key).map_or(BRANCH_DEFAULT, String::as_str);
        tracing::debug!(step = ctx.step_name(), key, branch, "Branch selected");
        Ok(StepResult::branch(Values::new(), branch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branches_include_default_once() {
        let step = BranchingStep::new([("yes", "accept"), ("y", "accept"), ("no", "refuse")]);
        assert_eq!(step.branches(), vec!["accept", "refuse", "default"]);
    }
}
