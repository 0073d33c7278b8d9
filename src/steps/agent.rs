use crate::agent::Agent;
use crate::error::Result;
use crate::property::{Property, Values};
use crate::status::ExecutionStatus;
use crate::step::{Step, StepContext, StepResult};
use async_trait::async_trait;
use std::sync::Arc;

const SLOT: &str = "agent";

/// Runs an agent inside a flow, on the flow's message list
pub struct AgentExecutionStep {
    agent: Arc<Agent>,
}

impl AgentExecutionStep {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }
}

#[async_trait]
impl Step for AgentExecutionStep {
    fn kind(&self) -> &'static str {
        "agent_execution"
    }

    fn input_descriptors(&self) -> &[Property] {
        self.agent.inputs()
    }

    fn output_descriptors(&self) -> &[Property] {
        self.agent.outputs()
    }

    fn might_yield(&self) -> bool {
        self.agent.might_yield()
    }

    async fn invoke(&self, inputs: Values, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        match ctx
            .run_sub_conversation(SLOT, self.agent.as_ref(), inputs, true)
            .await?
        {
            ExecutionStatus::Finished { output_values, .. } => Ok(StepResult::next(output_values)),
            other => Ok(StepResult::from_inner_status(other)
                .unwrap_or_else(|| StepResult::next(Values::new()))),
        }
    }
}
