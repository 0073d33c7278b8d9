//! Fan-out of a sub-flow over a collection

use crate::component::Component;
use crate::error::{FlowError, Result};
use crate::flow::Flow;
use crate::interrupt::ExecutionInterrupt;
use crate::llm::TokenUsage;
use crate::pool;
use crate::property::{Property, Values};
use crate::status::ExecutionStatus;
use crate::step::{ensure_unique_names, Step, StepContext, StepResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Input holding the collection to map over
pub const ITERATED_INPUT: &str = "iterated_input";

/// Runs a sub-flow once per element of `iterated_input` and collects the
/// chosen sub-flow outputs into lists aligned with the elements.
///
/// A list is iterated item by item; a map yields `{"key": k, "value": v}`
/// elements in key order.
pub struct MapStep {
    flow: Arc<Flow>,
    unpack: BTreeMap<String, String>,
    collected: Vec<Property>,
    parallel: bool,
    max_concurrent: Option<usize>,
    inputs: Vec<Property>,
    outputs: Vec<Property>,
}

pub struct MapStepBuilder {
    flow: Arc<Flow>,
    unpack: BTreeMap<String, String>,
    collected: Option<Vec<String>>,
    parallel: bool,
    max_concurrent: Option<usize>,
}

impl MapStepBuilder {
    /// Feed the part of each element at `path` into the sub-flow input
    /// `input`. `"."` is the whole element, `".a.b"` a nested field.
    #[must_use]
    pub fn unpack_input(mut self, input: impl Into<String>, path: impl Into<String>) -> Self {
        self.unpack.insert(input.into(), path.into());
        self
    }

    /// Collect this sub-flow output. All outputs are collected by default.
    #[must_use]
    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.collected.get_or_insert_with(Vec::new).push(name.into());
        self
    }

    /// Run elements on the worker pool, each in a conversation of its own.
    ///
    /// The sub-flow must not yield. An agent inside it that runs out of
    /// iterations has nobody to hand over to, and its element fails.
    #[must_use]
    pub fn parallel_execution(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    #[must_use]
    pub fn max_concurrent_threads(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    pub fn build(self) -> Result<MapStep> {
        let invalid = |message: String| FlowError::invalid_step("map", message);
        if self.parallel && self.flow.might_yield() {
            return Err(invalid(format!(
                "sub-flow `{}` might yield and cannot run in parallel",
                self.flow.name()
            )));
        }
        if self.max_concurrent == Some(0) {
            return Err(invalid("max_concurrent_threads must be at least 1".to_string()));
        }
        if let Some(unknown) = self
            .unpack
            .keys()
            .find(|name| !self.flow.inputs().iter().any(|p| &p.name == *name))
        {
            return Err(invalid(format!("sub-flow has no input `{unknown}` to unpack into")));
        }

        let collected = match self.collected {
            None => self.flow.outputs().to_vec(),
            Some(names) => names
                .iter()
                .map(|name| {
                    self.flow
                        .outputs()
                        .iter()
                        .find(|p| &p.name == name)
                        .cloned()
                        .ok_or_else(|| invalid(format!("sub-flow has no output `{name}`")))
                })
                .collect::<Result<Vec<_>>>()?,
        };
        ensure_unique_names("map", &collected)?;

        let mut inputs = vec![Property::union(
            ITERATED_INPUT,
            vec![
                Property::list("list", Property::any("item")),
                Property::map("map", Property::any("value")),
            ],
        )];
        for input in self.flow.inputs() {
            if input.name == ITERATED_INPUT {
                return Err(invalid(format!(
                    "sub-flow input `{ITERATED_INPUT}` clashes with the mapped input"
                )));
            }
            if !self.unpack.contains_key(&input.name) {
                inputs.push(input.clone());
            }
        }
        let outputs = collected
            .iter()
            .map(|p| Property::list(&p.name, p.renamed("item")))
            .collect();

        Ok(MapStep {
            flow: self.flow,
            unpack: self.unpack,
            collected,
            parallel: self.parallel,
            max_concurrent: self.max_concurrent,
            inputs,
            outputs,
        })
    }
}

#[derive(Default, Serialize, Deserialize)]
struct Progress {
    index: usize,
    outputs: Vec<Values>,
}

impl MapStep {
    pub fn builder(flow: Arc<Flow>) -> MapStepBuilder {
        MapStepBuilder {
            flow,
            unpack: BTreeMap::new(),
            collected: None,
            parallel: false,
            max_concurrent: None,
        }
    }

    fn elements(&self, step: &str, inputs: &Values) -> Result<Vec<Value>> {
        match inputs.get(ITERATED_INPUT) {
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(Value::Object(entries)) => Ok(entries
                .iter()
                .map(|(key, value)| json!({"key": key, "value": value}))
                .collect()),
            other => Err(FlowError::step(
                step,
                format!("cannot iterate over {}", other.cloned().unwrap_or(Value::Null)),
            )),
        }
    }

    /// Sub-flow inputs for one element
    fn element_inputs(&self, step: &str, element: &Value, inputs: &Values) -> Result<Values> {
        let mut values: Values = inputs
            .iter()
            .filter(|(name, _)| name.as_str() != ITERATED_INPUT)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        for (input, path) in &self.unpack {
            let value = lookup_path(element, path)
                .ok_or_else(|| {
                    FlowError::step(step, format!("element {element} has nothing at `{path}`"))
                })?;
            values.insert(input.clone(), value.clone());
        }
        Ok(values)
    }

    fn collect(&self, per_element: &[Values]) -> Values {
        self.collected
            .iter()
            .map(|output| {
                let items = per_element
                    .iter()
                    .map(|values| values.get(&output.name).cloned().unwrap_or(Value::Null))
                    .collect();
                (output.name.clone(), Value::Array(items))
            })
            .collect()
    }

    async fn run_sequential(
        &self,
        elements: Vec<Value>,
        inputs: &Values,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepResult> {
        let mut progress: Progress = ctx.state()?.unwrap_or_default();
        while progress.index < elements.len() {
            let index = progress.index;
            let element_inputs = self.element_inputs(ctx.step_name(), &elements[index], inputs)?;
            let slot = format!("item{index}");
            let status = ctx
                .run_sub_conversation(&slot, self.flow.as_ref(), element_inputs, true)
                .await?;
            match status {
                ExecutionStatus::Finished { output_values, .. } => {
                    progress.outputs.push(output_values);
                    progress.index += 1;
                }
                other => {
                    tracing::debug!(step = ctx.step_name(), index, "Mapped sub-flow yielded");
                    ctx.set_state(&progress)?;
                    return Ok(StepResult::from_inner_status(other)
                        .unwrap_or_else(|| StepResult::next(Values::new())));
                }
            }
        }
        ctx.clear_state();
        Ok(StepResult::next(self.collect(&progress.outputs)))
    }

    async fn run_parallel(
        &self,
        elements: Vec<Value>,
        inputs: &Values,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepResult> {
        let pool = pool::worker_pool().ok_or(FlowError::WorkerPoolUninitialized)?;
        let interrupts = ctx.conversation().interrupts();
        let mut jobs = Vec::with_capacity(elements.len());
        for element in &elements {
            let element_inputs = self.element_inputs(ctx.step_name(), element, inputs)?;
            jobs.push(run_element(Arc::clone(&self.flow), element_inputs, interrupts.clone()));
        }
        tracing::debug!(
            step = ctx.step_name(),
            elements = elements.len(),
            workers = pool.size(),
            max_concurrent = self.max_concurrent,
            "Mapping sub-flow on the worker pool"
        );
        let results = pool.run_all(jobs, self.max_concurrent).await;

        let mut outputs = Vec::with_capacity(results.len());
        let mut failure = None;
        for job in results {
            let result = match job {
                Ok((result, usage)) => {
                    ctx.conversation_mut().add_token_usage(usage);
                    result
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(values) => outputs.push(values),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(StepResult::next(self.collect(&outputs)))
    }
}

async fn run_element(
    flow: Arc<Flow>,
    inputs: Values,
    interrupts: Vec<Arc<dyn ExecutionInterrupt>>,
) -> (Result<Values>, TokenUsage) {
    let mut conversation = match flow.start_conversation(inputs, Vec::new()) {
        Ok(conversation) => conversation.with_interrupts(interrupts),
        Err(e) => return (Err(e), TokenUsage::default()),
    };
    let result = match flow.execute(&mut conversation).await {
        Ok(ExecutionStatus::Finished { output_values, .. }) => Ok(output_values),
        Ok(other) => Err(FlowError::step(
            flow.name(),
            format!("mapped sub-flow stopped with {}", other.kind()),
        )),
        Err(e) => Err(e),
    };
    (result, conversation.token_usage())
}

fn lookup_path<'v>(element: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(element, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

#[async_trait]
impl Step for MapStep {
    fn kind(&self) -> &'static str {
        "map"
    }

    fn input_descriptors(&self) -> &[Property] {
        &self.inputs
    }

    fn output_descriptors(&self) -> &[Property] {
        &self.outputs
    }

    fn might_yield(&self) -> bool {
        !self.parallel && self.flow.might_yield()
    }

    async fn invoke(&self, inputs: Values, ctx: &mut StepContext<'_>) -> Result<StepResult> {
        let elements = self.elements(ctx.step_name(), &inputs)?;
        if self.parallel {
            self.run_parallel(elements, &inputs, ctx).await
        } else {
            self.run_sequential(elements, &inputs, ctx).await
        }
    }
}
