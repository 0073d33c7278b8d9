//! Re-running a sub-flow until a success condition holds

use crate::error::{FlowError, Result};
use crate::flow::Flow;
use crate::property::{Property, Values};
use crate::status::ExecutionStatus;
use crate::step::{Step, StepContext, StepResult, BRANCH_FAILURE, BRANCH_NEXT};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const RETRY_COUNT: &str = "retry_count";
pub const SUCCESS: &str = "success";
pub const MAX_TRIALS_LIMIT: usize = 100;

#[derive(Serialize, Deserialize)]
struct Trial {
    /// 1-based number of the trial in progress
    number: usize,
}

/// Runs the sub-flow in a fresh sub-conversation per trial, until its
/// `success_condition` output is truthy or `max_num_trials` trials ran.
pub struct RetryStep {
    flow: Arc<Flow>,
    success_condition: String,
    max_num_trials: usize,
    outputs: Vec<Property>,
}

impl RetryStep {
    pub fn new(
        flow: Arc<Flow>,
        success_condition: impl Into<String>,
        max_num_trials: usize,
    ) -> Result<Self> {
        let success_condition = success_condition.into();
        if !(1..=MAX_TRIALS_LIMIT).contains(&max_num_trials) {
            return Err(FlowError::invalid_step(
                "retry",
                format!(
                    "max_num_trials must be between 1 and {MAX_TRIALS_LIMIT}, got {max_num_trials}"
                ),
            ));
        }
        if !flow.outputs().iter().any(|p| p.name == success_condition) {
            return Err(FlowError::invalid_step(
                "retry",
                format!("sub-flow `{}` has no output `{success_condition}`", flow.name()),
            ));
        }
        if let Some(clash) = flow
            .outputs()
            .iter()
            .find(|p| p.name == RETRY_COUNT || p.name == SUCCESS)
        {
            return Err(FlowError::invalid_step(
                "retry",
                format!("sub-flow output `{}` clashes with a retry output", clash.name),
            ));
        }
        let mut outputs = flow.outputs().to_vec();
        outputs.push(Property::integer(RETRY_COUNT));
        outputs.push(Property::boolean(SUCCESS));
        Ok(Self {
            flow,
            success_condition,
            max_num_trials,
            outputs,
        })
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f.abs() > 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[async_trait]
impl Step for RetryStep {
    fn kind(&self) -> &'static str {
        "retry"
    }

    fn input_descriptors(&self) -> &[Property] {
        self.flow.inputs()
    }

    fn output_descriptors(&self) -> &[Property] {
        &self.outputs
    }

    fn branches(&self) -> Vec<String> {
        vec![BRANCH_NEXT.to_string(), BRANCH_FAILURE.to_string()]
    }

    fn might_yield(&self) -> bool {
        self.flow.might_yield()
    }

    async fn invoke(&self, inputs: Values, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let mut trial = ctx.state::<Trial>()?.unwrap_or(Trial { number: 1 });
        loop {
            let slot = format!("trial{}", trial.number);
            let status = ctx
                .run_sub_conversation(&slot, self.flow.as_ref(), inputs.clone(), false)
                .await?;
            let mut outputs = match status {
                ExecutionStatus::Finished { output_values, .. } => output_values,
                other => {
                    ctx.set_state(&trial)?;
                    return Ok(StepResult::from_inner_status(other)
                        .unwrap_or_else(|| StepResult::next(Values::new())));
                }
            };

            let success = outputs.get(&self.success_condition).is_some_and(is_truthy);
            tracing::debug!(
                step = ctx.step_name(),
                trial = trial.number,
                success,
                "Retry trial finished"
            );
            if success || trial.number >= self.max_num_trials {
                ctx.clear_state();
                outputs.insert(RETRY_COUNT.to_string(), Value::from(trial.number));
                outputs.insert(SUCCESS.to_string(), Value::Bool(success));
                let branch = if success { BRANCH_NEXT } else { BRANCH_FAILURE };
                return Ok(StepResult::branch(outputs, branch));
            }
            trial.number += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::steps::{InputMessageStep, OutputMessageStep, ToolExecutionStep};
    use crate::tool::ServerTool;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sub-flow whose `tool_output` turns true on call number `succeed_at`
    fn attempt_flow(succeed_at: usize) -> Arc<Flow> {
        let calls = Arc::new(AtomicUsize::new(0));
        let attempt = ServerTool::builder("attempt")
            .output(Property::boolean("ok"))
            .handler(move |_args: Values| {
                let calls = Arc::clone(&calls);
                async move {
                    let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(json!(call >= succeed_at))
                }
            })
            .build()
            .unwrap();
        Arc::new(
            Flow::sequence(
                "attempt",
                vec![("try", Arc::new(ToolExecutionStep::new(attempt)) as Arc<dyn Step>)],
            )
            .unwrap(),
        )
    }

    fn run_retry(succeed_at: usize, max: usize) -> (String, Values) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let outer = Flow::builder("outer")
            .step("retry", RetryStep::new(attempt_flow(succeed_at), "tool_output", max).unwrap())
            .step("done", OutputMessageStep::new("done"))
            .step("gave_up", OutputMessageStep::new("gave up"))
            .transition("retry", "done")
            .branch_transition("retry", "failure", "gave_up")
            .exit("done")
            .exit("gave_up")
            .build()
            .unwrap();
        rt.block_on(async {
            let mut conv = outer.start_conversation(Values::new(), vec![]).unwrap();
            let status = outer.execute(&mut conv).await.unwrap();
            let outputs = status.output_values().unwrap().clone();
            (conv.history()[1].clone(), outputs)
        })
    }

    #[test]
    fn test_truthiness() {
        let falsy_values = [
            json!(null),
            json!(false),
            json!(0),
            json!(0.0),
            json!(""),
            json!([]),
            json!({}),
        ];
        for falsy in falsy_values {
            assert!(!is_truthy(&falsy), "{falsy} should be falsy");
        }
        for truthy in [json!(true), json!(-1), json!("no"), json!([0]), json!({"a": null})] {
            assert!(is_truthy(&truthy), "{truthy} should be truthy");
        }
    }

    #[test]
    fn test_invalid_configurations() {
        assert!(RetryStep::new(attempt_flow(1), "tool_output", 0).is_err());
        assert!(RetryStep::new(attempt_flow(1), "tool_output", 101).is_err());
        assert!(RetryStep::new(attempt_flow(1), "missing", 3).is_err());
        assert!(RetryStep::new(attempt_flow(1), "tool_output", 100).is_ok());
    }

    #[test]
    fn test_single_failing_trial() {
        let (taken, outputs) = run_retry(5, 1);
        assert_eq!(taken, "gave_up");
        assert_eq!(outputs[RETRY_COUNT], json!(1));
        assert_eq!(outputs[SUCCESS], json!(false));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_retry_count_matches_first_success(succeed_at in 1usize..8, max in 1usize..8) {
            let (taken, outputs) = run_retry(succeed_at, max);
            if succeed_at <= max {
                prop_assert_eq!(taken, "done");
                prop_assert_eq!(&outputs[RETRY_COUNT], &json!(succeed_at));
                prop_assert_eq!(&outputs[SUCCESS], &json!(true));
            } else {
                prop_assert_eq!(taken, "gave_up");
                prop_assert_eq!(&outputs[RETRY_COUNT], &json!(max));
                prop_assert_eq!(&outputs[SUCCESS], &json!(false));
            }
        }
    }

    #[tokio::test]
    async fn test_yielding_trial_resumes() {
        let ask = Arc::new(
            Flow::sequence(
                "ask",
                vec![("ask", Arc::new(InputMessageStep::with_prompt("Ready?")) as Arc<dyn Step>)],
            )
            .unwrap(),
        );
        let outer = Flow::builder("outer")
            .step("retry", RetryStep::new(ask, "user_provided_input", 3).unwrap())
            .exit("retry")
            .branch_exit("retry", "failure")
            .build()
            .unwrap();
        let mut conv = outer.start_conversation(Values::new(), vec![]).unwrap();

        assert!(matches!(
            outer.execute(&mut conv).await.unwrap(),
            ExecutionStatus::UserMessageRequest { .. }
        ));
        conv.append_user_message("");
        assert!(matches!(
            outer.execute(&mut conv).await.unwrap(),
            ExecutionStatus::UserMessageRequest { .. }
        ));
        conv.append_user_message("yes");
        let status = outer.execute(&mut conv).await.unwrap();
        let outputs = status.output_values().unwrap();
        assert_eq!(outputs[RETRY_COUNT], json!(2));
        assert_eq!(outputs["user_provided_input"], json!("yes"));
    }
}
