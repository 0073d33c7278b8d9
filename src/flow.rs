//! Flows: graphs of steps and their execution driver
//!
//! Control-flow transitions map `(step, branch)` to the next step or to the
//! flow exit. Values move between steps either through explicit data edges or,
//! when a flow declares none, by name: a step input reads the most recent
//! output of the same name.

mod builder;

pub use builder::FlowBuilder;

use crate::component::Component;
use crate::conversation::Conversation;
use crate::error::{FlowError, Result};
use crate::events::{self, Event};
use crate::property::{Property, Values};
use crate::status::ExecutionStatus;
use crate::step::{Step, StepContext, StepMode, BRANCH_DEFAULT, BRANCH_NEXT, BRANCH_SELF};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A step placed in a flow, with optional renaming of its inputs and outputs
#[derive(Clone)]
pub struct FlowNode {
    name: String,
    step: Arc<dyn Step>,
    input_names: BTreeMap<String, String>,
    output_names: BTreeMap<String, String>,
}

impl FlowNode {
    pub fn new(name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        Self {
            name: name.into(),
            step,
            input_names: BTreeMap::new(),
            output_names: BTreeMap::new(),
        }
    }

    /// Read step input `input` from the flow value named `name`
    #[must_use]
    pub fn rename_input(mut self, input: impl Into<String>, name: impl Into<String>) -> Self {
        self.input_names.insert(input.into(), name.into());
        self
    }

    /// Publish step output `output` under the flow value name `name`
    #[must_use]
    pub fn rename_output(mut self, output: impl Into<String>, name: impl Into<String>) -> Self {
        self.output_names.insert(output.into(), name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step(&self) -> &Arc<dyn Step> {
        &self.step
    }

    fn visible_input(&self, step_input: &str) -> String {
        self.input_names
            .get(step_input)
            .cloned()
            .unwrap_or_else(|| step_input.to_string())
    }

    fn visible_output(&self, step_output: &str) -> String {
        self.output_names
            .get(step_output)
            .cloned()
            .unwrap_or_else(|| step_output.to_string())
    }

    /// Inputs under their flow-level names
    pub(crate) fn inputs(&self) -> Vec<Property> {
        self.step
            .input_descriptors()
            .iter()
            .map(|p| p.renamed(self.visible_input(&p.name)))
            .collect()
    }

    /// Outputs under their flow-level names
    pub(crate) fn outputs(&self) -> Vec<Property> {
        self.step
            .output_descriptors()
            .iter()
            .map(|p| p.renamed(self.visible_output(&p.name)))
            .collect()
    }

    pub(crate) fn input(&self, name: &str) -> Option<Property> {
        self.inputs().into_iter().find(|p| p.name == name)
    }

    pub(crate) fn output(&self, name: &str) -> Option<Property> {
        self.outputs().into_iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Step(String),
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEdge {
    pub source_step: String,
    pub source_output: String,
    pub destination_step: String,
    pub destination_input: String,
}

pub struct Flow {
    id: String,
    name: String,
    description: String,
    begin: String,
    order: Vec<String>,
    nodes: BTreeMap<String, FlowNode>,
    transitions: BTreeMap<(String, String), Transition>,
    data_edges: Vec<DataEdge>,
    inputs: Vec<Property>,
    outputs: Vec<Property>,
    might_yield: bool,
}

impl Flow {
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder::new(name)
    }

    /// Steps run one after the other, then the flow exits
    pub fn sequence(name: impl Into<String>, steps: Vec<(&str, Arc<dyn Step>)>) -> Result<Flow> {
        let mut builder = FlowBuilder::new(name);
        let mut previous: Option<&str> = None;
        for (step_name, step) in &steps {
            builder = builder.node(FlowNode::new(*step_name, Arc::clone(step)));
            if let Some(prev) = previous {
                builder = builder.transition(prev, *step_name);
            }
            previous = Some(*step_name);
        }
        if let Some((last, step)) = steps.last() {
            if !step.is_terminal() {
                builder = builder.exit(*last);
            }
        }
        builder.build()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn inputs(&self) -> &[Property] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Property] {
        &self.outputs
    }

    pub fn begin_step(&self) -> &str {
        &self.begin
    }

    /// Step names in declaration order
    pub fn step_names(&self) -> &[String] {
        &self.order
    }

    pub fn might_yield(&self) -> bool {
        self.might_yield
    }

    pub fn data_edges(&self) -> &[DataEdge] {
        &self.data_edges
    }

    /// Names of the terminal steps, in declaration order
    pub fn complete_step_names(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| self.nodes[*name].step.is_terminal())
            .cloned()
            .collect()
    }

    /// Whether some transition leaves the flow without a terminal step
    pub fn has_exit(&self) -> bool {
        self.transitions.values().any(|t| *t == Transition::Exit)
    }

    fn node(&self, name: &str) -> Result<&FlowNode> {
        self.nodes
            .get(name)
            .ok_or_else(|| FlowError::InvalidFlow(format!("{}: unknown step `{name}`", self.name)))
    }

    fn next_after(&self, step: &str, branch: &str) -> Result<Transition> {
        if let Some(target) = self.transitions.get(&(step.to_string(), branch.to_string())) {
            return Ok(target.clone());
        }
        if branch == BRANCH_SELF {
            return Ok(Transition::Step(step.to_string()));
        }
        let default = (step.to_string(), BRANCH_DEFAULT.to_string());
        if let Some(target) = self.transitions.get(&default) {
            tracing::debug!(
                flow = %self.name,
                step,
                branch,
                "Unknown branch, taking the default transition"
            );
            return Ok(target.clone());
        }
        Err(FlowError::step(step, format!("no transition for branch `{branch}`")))
    }

    /// Value feeding `input` (visible name) of `node`, with its declared type
    fn lookup_value<'c>(
        &self,
        node: &FlowNode,
        input: &str,
        conversation: &'c Conversation,
    ) -> Option<(Property, &'c serde_json::Value)> {
        if self.data_edges.is_empty() {
            if let Some((producer, value)) = conversation.latest_output(input) {
                if let Some(declared) = self.nodes.get(producer).and_then(|n| n.output(input)) {
                    return Some((declared, value));
                }
            }
        } else {
            let latest = self
                .data_edges
                .iter()
                .filter(|e| e.destination_step == node.name && e.destination_input == input)
                .filter_map(|e| {
                    conversation
                        .output_of(&e.source_step, &e.source_output)
                        .map(|(seq, value)| (seq, e, value))
                })
                .max_by_key(|(seq, _, _)| *seq);
            if let Some((_, edge, value)) = latest {
                let declared = self
                    .nodes
                    .get(&edge.source_step)
                    .and_then(|n| n.output(&edge.source_output));
                if let Some(declared) = declared {
                    return Some((declared, value));
                }
            }
        }
        let declared = self.inputs.iter().find(|p| p.name == input)?;
        conversation.inputs().get(input).map(|v| (declared.clone(), v))
    }

    fn resolve_inputs(&self, node: &FlowNode, conversation: &Conversation) -> Result<Values> {
        let mut values = Values::new();
        for descriptor in node.step.input_descriptors() {
            let visible = node.visible_input(&descriptor.name);
            let value = match self.lookup_value(node, &visible, conversation) {
                Some((declared, value)) => declared.cast_value(value, descriptor)?,
                None => match &descriptor.default {
                    Some(default) => default.clone(),
                    None => {
                        return Err(FlowError::step(
                            &node.name,
                            format!("no value available for input `{visible}`"),
                        ))
                    }
                },
            };
            values.insert(descriptor.name.clone(), value);
        }
        Ok(values)
    }

    fn collect_outputs(&self, conversation: &Conversation) -> Result<Values> {
        let mut values = Values::new();
        for output in &self.outputs {
            let Some((producer, value)) = conversation.latest_output(&output.name) else {
                match &output.default {
                    Some(default) => {
                        values.insert(output.name.clone(), default.clone());
                        continue;
                    }
                    None => {
                        return Err(FlowError::step(
                            &self.name,
                            format!("output `{}` was never produced", output.name),
                        ))
                    }
                }
            };
            let declared = self
                .nodes
                .get(producer)
                .and_then(|n| n.output(&output.name))
                .unwrap_or_else(|| output.clone());
            values.insert(output.name.clone(), declared.cast_value(value, output)?);
        }
        Ok(values)
    }

    async fn run(&self, conversation: &mut Conversation) -> Result<ExecutionStatus> {
        let mut current = conversation
            .cursor()
            .map_or_else(|| self.begin.clone(), str::to_string);
        loop {
            if let Some(reason) = conversation.check_interrupts() {
                conversation.set_cursor(Some(current.clone()));
                tracing::info!(
                    conversation_id = %conversation.id(),
                    step = %current,
                    %reason,
                    "Execution interrupted"
                );
                return Ok(ExecutionStatus::Interrupted { reason });
            }

            let node = self.node(&current)?;
            let inputs = self.resolve_inputs(node, conversation)?;
            conversation.set_cursor(Some(current.clone()));
            tracing::debug!(
                conversation_id = %conversation.id(),
                step = %current,
                kind = node.step.kind(),
                "Invoking step"
            );
            events::emit(Event::StepStarted {
                conversation_id: conversation.id().to_string(),
                step: current.clone(),
            });

            let result = {
                let mut ctx = StepContext::new(conversation, &current);
                node.step.invoke(inputs, &mut ctx).await?
            };

            let suspension = match result.mode {
                StepMode::Yielding(suspension) => Some(suspension),
                StepMode::Passthrough => None,
            };
            events::emit(Event::StepFinished {
                conversation_id: conversation.id().to_string(),
                step: current.clone(),
                branch: suspension.is_none().then(|| result.branch.clone()),
            });
            if let Some(suspension) = suspension {
                tracing::debug!(
                    conversation_id = %conversation.id(),
                    step = %current,
                    "Step yielded"
                );
                return Ok(suspension.into());
            }

            let outputs: Values = result
                .outputs
                .into_iter()
                .map(|(name, value)| (node.visible_output(&name), value))
                .collect();
            conversation.record_outputs(&current, outputs);
            conversation.push_history(&current);

            if node.step.is_terminal() {
                return self.finish(conversation, Some(current));
            }
            match self.next_after(&current, &result.branch)? {
                Transition::Exit => return self.finish(conversation, None),
                Transition::Step(next) => {
                    tracing::debug!(
                        from = %current,
                        to = %next,
                        branch = %result.branch,
                        "Transition"
                    );
                    current = next;
                }
            }
        }
    }

    fn finish(
        &self,
        conversation: &mut Conversation,
        complete_step_name: Option<String>,
    ) -> Result<ExecutionStatus> {
        let output_values = self.collect_outputs(conversation)?;
        conversation.finish();
        Ok(ExecutionStatus::Finished {
            output_values,
            complete_step_name,
        })
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("steps", &self.order)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Component for Flow {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn input_descriptors(&self) -> &[Property] {
        &self.inputs
    }

    fn output_descriptors(&self) -> &[Property] {
        &self.outputs
    }

    fn might_yield(&self) -> bool {
        self.might_yield
    }

    async fn execute(&self, conversation: &mut Conversation) -> Result<ExecutionStatus> {
        conversation.check_executable(&self.id)?;
        tracing::info!(conversation_id = %conversation.id(), flow = %self.name, "Executing flow");
        events::emit(Event::ExecutionStarted {
            conversation_id: conversation.id().to_string(),
            component: self.name.clone(),
        });
        let result = self.run(conversation).await;
        match &result {
            Ok(status) => {
                tracing::info!(
                    conversation_id = %conversation.id(),
                    flow = %self.name,
                    status = status.kind(),
                    "Flow execution returned"
                );
                events::emit(Event::ExecutionFinished {
                    conversation_id: conversation.id().to_string(),
                    component: self.name.clone(),
                    status: status.kind(),
                });
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation.id(),
                    flow = %self.name,
                    error = %e,
                    "Flow execution failed"
                );
            }
        }
        result
    }
}

/// Default branch names of a flow used as a step
pub(crate) fn flow_branches(flow: &Flow) -> Vec<String> {
    let mut branches = flow.complete_step_names();
    if branches.is_empty() || flow.has_exit() {
        branches.push(BRANCH_NEXT.to_string());
    }
    branches
}
