use crate::error::Result;
use crate::property::{Property, Values};
use crate::step::{Step, StepContext, StepResult};
use async_trait::async_trait;

/// Terminal step. Its name is reported as `complete_step_name` when the flow
/// finishes here.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompleteStep;

impl CompleteStep {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Step for CompleteStep {
    fn kind(&self) -> &'static str {
        "complete"
    }

    fn input_descriptors(&self) -> &[Property] {
        &[]
    }

    fn output_descriptors(&self) -> &[Property] {
        &[]
    }

    fn branches(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_terminal(&self) -> bool {
        true
    }

    async fn invoke(&self, _inputs: Values, _ctx: &mut StepContext<'_>) -> Result<StepResult> {
        Ok(StepResult::next(Values::new()))
    }
}
