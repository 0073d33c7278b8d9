use crate::error::Result;
use crate::flow::{flow_branches, Flow};
use crate::property::{Property, Values};
use crate::status::ExecutionStatus;
use crate::step::{Step, StepContext, StepResult, BRANCH_NEXT};
use async_trait::async_trait;
use std::sync::Arc;

const SLOT: &str = "flow";

/// Runs a sub-flow as one step.
///
/// The step takes the branch named after the inner complete step the sub-flow
/// finished on, or `next` when it left through an exit transition.
pub struct FlowExecutionStep {
    flow: Arc<Flow>,
    share_messages: bool,
}

impl FlowExecutionStep {
    /// The sub-flow shares this conversation's messages
    pub fn new(flow: Arc<Flow>) -> Self {
        Self {
            flow,
            share_messages: true,
        }
    }

    /// The sub-flow gets its own message list
    #[must_use]
    pub fn isolated(mut self) -> Self {
        self.share_messages = false;
        self
    }

    pub fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }
}

#[async_trait]
impl Step for FlowExecutionStep {
    fn kind(&self) -> &'static str {
        "flow_execution"
    }

    fn input_descriptors(&self) -> &[Property] {
        self.flow.inputs()
    }

    fn output_descriptors(&self) -> &[Property] {
        self.flow.outputs()
    }

    fn branches(&self) -> Vec<String> {
        flow_branches(&self.flow)
    }

    fn might_yield(&self) -> bool {
        self.flow.might_yield()
    }

    async fn invoke(&self, inputs: Values, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let status = ctx
            .run_sub_conversation(SLOT, self.flow.as_ref(), inputs, self.share_messages)
            .await?;
        match status {
            ExecutionStatus::Finished {
                output_values,
                complete_step_name,
            } => {
                let branch = complete_step_name.unwrap_or_else(|| BRANCH_NEXT.to_string());
                Ok(StepResult::branch(output_values, branch))
            }
            other => Ok(StepResult::from_inner_status(other)
                .unwrap_or_else(|| StepResult::next(Values::new()))),
        }
    }
}
