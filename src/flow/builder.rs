//! Flow construction and build-time validation

use super::{DataEdge, Flow, FlowNode, Transition};
use crate::error::{FlowError, Result};
use crate::property::Property;
use crate::step::{Step, BRANCH_DEFAULT, BRANCH_NEXT, BRANCH_SELF};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

pub struct FlowBuilder {
    id: Option<String>,
    name: String,
    description: String,
    nodes: Vec<FlowNode>,
    begin: Vec<String>,
    transitions: Vec<(String, String, Transition)>,
    data_edges: Vec<DataEdge>,
    outputs: Option<Vec<Property>>,
}

impl FlowBuilder {
    pub(super) fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            nodes: Vec::new(),
            begin: Vec::new(),
            transitions: Vec::new(),
            data_edges: Vec::new(),
            outputs: None,
        }
    }

    /// Stable id; a random one is generated otherwise
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn step(self, name: impl Into<String>, step: impl Step + 'static) -> Self {
        self.node(FlowNode::new(name, Arc::new(step)))
    }

    #[must_use]
    pub fn node(mut self, node: FlowNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// First step to run. Defaults to the first step added.
    #[must_use]
    pub fn begin(mut self, step: impl Into<String>) -> Self {
        self.begin.push(step.into());
        self
    }

    /// `from` continues to `to` on its `next` branch
    #[must_use]
    pub fn transition(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.branch_transition(from, BRANCH_NEXT, to)
    }

    #[must_use]
    pub fn branch_transition(
        mut self,
        from: impl Into<String>,
        branch: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.transitions
            .push((from.into(), branch.into(), Transition::Step(to.into())));
        self
    }

    /// The flow ends after `from` takes its `next` branch
    #[must_use]
    pub fn exit(self, from: impl Into<String>) -> Self {
        self.branch_exit(from, BRANCH_NEXT)
    }

    #[must_use]
    pub fn branch_exit(mut self, from: impl Into<String>, branch: impl Into<String>) -> Self {
        self.transitions.push((from.into(), branch.into(), Transition::Exit));
        self
    }

    /// Feed output `output` of `from` into input `input` of `to`.
    ///
    /// Once any data edge is declared, step inputs are only fed by data edges
    /// and flow inputs.
    #[must_use]
    pub fn data_edge(
        mut self,
        from: impl Into<String>,
        output: impl Into<String>,
        to: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        self.data_edges.push(DataEdge {
            source_step: from.into(),
            source_output: output.into(),
            destination_step: to.into(),
            destination_input: input.into(),
        });
        self
    }

    /// Narrow the flow outputs to these descriptors
    #[must_use]
    pub fn outputs(mut self, outputs: Vec<Property>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn build(self) -> Result<Flow> {
        let flow_name = self.name;
        let invalid = |message: String| FlowError::InvalidFlow(format!("{flow_name}: {message}"));

        if self.nodes.is_empty() {
            return Err(invalid("a flow needs at least one step".to_string()));
        }
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut nodes = BTreeMap::new();
        for node in self.nodes {
            if nodes.contains_key(&node.name) {
                return Err(invalid(format!("duplicate step name `{}`", node.name)));
            }
            order.push(node.name.clone());
            nodes.insert(node.name.clone(), node);
        }

        let begin = match self.begin.as_slice() {
            [] => order[0].clone(),
            [begin] => begin.clone(),
            [first, rest @ ..] if rest.iter().all(|b| b == first) => first.clone(),
            _ => return Err(invalid(format!("several begin steps: {}", self.begin.join(", ")))),
        };
        if !nodes.contains_key(&begin) {
            return Err(invalid(format!("begin step `{begin}` does not exist")));
        }

        let mut transitions = BTreeMap::new();
        for (from, branch, target) in self.transitions {
            let Some(node) = nodes.get(&from) else {
                return Err(invalid(format!("transition from unknown step `{from}`")));
            };
            if node.step.is_terminal() {
                return Err(invalid(format!("terminal step `{from}` cannot have transitions")));
            }
            if branch != BRANCH_DEFAULT && !node.step.branches().contains(&branch) {
                return Err(invalid(format!("step `{from}` has no branch `{branch}`")));
            }
            if let Transition::Step(to) = &target {
                if !nodes.contains_key(to) {
                    return Err(invalid(format!("transition from `{from}` to unknown step `{to}`")));
                }
                if *to == begin {
                    return Err(invalid(format!(
                        "begin step `{begin}` is the target of a transition"
                    )));
                }
            }
            if transitions.insert((from.clone(), branch.clone()), target).is_some() {
                return Err(invalid(format!("branch `{branch}` of `{from}` has two transitions")));
            }
        }

        for name in &order {
            let node = &nodes[name];
            let has_default = transitions.contains_key(&(name.clone(), BRANCH_DEFAULT.to_string()));
            if node.step.is_terminal() || has_default {
                continue;
            }
            if let Some(branch) = node
                .step
                .branches()
                .into_iter()
                .find(|b| b != BRANCH_SELF && !transitions.contains_key(&(name.clone(), b.clone())))
            {
                return Err(invalid(format!("branch `{branch}` of `{name}` has no transition")));
            }
        }

        let graph = Graph::new(&order, &transitions, &begin);
        for name in &order {
            if !graph.reachable.contains(name.as_str()) {
                tracing::warn!(
                    flow = %flow_name,
                    step = %name,
                    "Step is unreachable from the begin step"
                );
            }
        }

        for edge in &self.data_edges {
            let (Some(source), Some(dest)) = (
                nodes.get(&edge.source_step),
                nodes.get(&edge.destination_step),
            ) else {
                return Err(invalid(format!(
                    "data edge {}.{} -> {}.{} references an unknown step",
                    edge.source_step,
                    edge.source_output,
                    edge.destination_step,
                    edge.destination_input
                )));
            };
            let Some(output) = source.output(&edge.source_output) else {
                return Err(invalid(format!(
                    "step `{}` has no output `{}`",
                    edge.source_step, edge.source_output
                )));
            };
            let Some(input) = dest.input(&edge.destination_input) else {
                return Err(invalid(format!(
                    "step `{}` has no input `{}`",
                    edge.destination_step, edge.destination_input
                )));
            };
            if !output.is_castable_to(&input) {
                return Err(invalid(format!(
                    "data edge {}.{} -> {}.{}: {} is not compatible with {}",
                    edge.source_step,
                    edge.source_output,
                    edge.destination_step,
                    edge.destination_input,
                    output.type_name(),
                    input.type_name()
                )));
            }
        }

        let explicit_data = !self.data_edges.is_empty();
        let mut inputs: Vec<Property> = Vec::new();
        for name in &order {
            let node = &nodes[name];
            let ancestors = graph.ancestors(name);
            for input in node.inputs() {
                let satisfied = if explicit_data {
                    self.data_edges
                        .iter()
                        .any(|e| e.destination_step == *name && e.destination_input == input.name)
                } else {
                    let mut satisfied = false;
                    for producer in ancestors.iter().map(|a| &nodes[*a]) {
                        if let Some(output) = producer.output(&input.name) {
                            if !output.is_castable_to(&input) {
                                return Err(invalid(format!(
                                    "output `{}` of `{}` ({}) cannot feed input of `{name}` ({})",
                                    input.name,
                                    producer.name,
                                    output.type_name(),
                                    input.type_name()
                                )));
                            }
                            satisfied = true;
                        }
                    }
                    satisfied
                };
                if !satisfied {
                    merge_flow_input(&mut inputs, input).map_err(invalid)?;
                }
            }
        }

        let guaranteed = graph.guaranteed_outputs(&nodes);
        let Some(guaranteed) = guaranteed else {
            return Err(invalid("no CompleteStep and no exit transition".to_string()));
        };
        let producible: Vec<Property> = guaranteed
            .iter()
            .filter_map(|out| {
                order
                    .iter()
                    .find_map(|step| nodes[step].output(out))
            })
            .collect();
        let outputs = match self.outputs {
            None => producible,
            Some(declared) => {
                for out in &declared {
                    let Some(produced) = producible.iter().find(|p| p.name == out.name) else {
                        return Err(invalid(format!(
                            "output `{}` is not produced on every path to the end",
                            out.name
                        )));
                    };
                    if !produced.is_castable_to(out) {
                        return Err(invalid(format!(
                            "output `{}` is produced as {} but declared as {}",
                            out.name,
                            produced.type_name(),
                            out.type_name()
                        )));
                    }
                }
                declared
            }
        };

        let might_yield = nodes.values().any(|n| n.step.might_yield());
        Ok(Flow {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: flow_name,
            description: self.description,
            begin,
            order,
            nodes,
            transitions,
            data_edges: self.data_edges,
            inputs,
            outputs,
            might_yield,
        })
    }
}

fn merge_flow_input(
    inputs: &mut Vec<Property>,
    input: Property,
) -> std::result::Result<(), String> {
    match inputs.iter_mut().find(|p| p.name == input.name) {
        None => {
            inputs.push(input);
            Ok(())
        }
        Some(existing) if existing.kind != input.kind => Err(format!(
            "flow input `{}` is required both as {} and as {}",
            input.name,
            existing.type_name(),
            input.type_name()
        )),
        Some(existing) => {
            if input.default.is_none() {
                existing.default = None;
            }
            Ok(())
        }
    }
}

/// Control-flow graph view used by the analyses
struct Graph<'a> {
    order: &'a [String],
    successors: BTreeMap<&'a str, Vec<&'a str>>,
    predecessors: BTreeMap<&'a str, Vec<&'a str>>,
    exits: BTreeSet<&'a str>,
    begin: &'a str,
    reachable: BTreeSet<&'a str>,
}

impl<'a> Graph<'a> {
    fn new(
        order: &'a [String],
        transitions: &'a BTreeMap<(String, String), Transition>,
        begin: &'a str,
    ) -> Self {
        let mut successors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut predecessors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut exits = BTreeSet::new();
        for ((from, _), target) in transitions {
            match target {
                Transition::Step(to) => {
                    successors.entry(from.as_str()).or_default().push(to.as_str());
                    predecessors.entry(to.as_str()).or_default().push(from.as_str());
                }
                Transition::Exit => {
                    exits.insert(from.as_str());
                }
            }
        }
        let mut graph = Self {
            order,
            successors,
            predecessors,
            exits,
            begin,
            reachable: BTreeSet::new(),
        };
        graph.reachable = Self::walk(begin, &graph.successors);
        graph.reachable.insert(begin);
        graph
    }

    /// Steps reachable from `start` along `edges`, excluding `start` unless
    /// it lies on a cycle
    fn walk(start: &'a str, edges: &BTreeMap<&'a str, Vec<&'a str>>) -> BTreeSet<&'a str> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&'a str> =
            edges.get(start).into_iter().flatten().copied().collect();
        while let Some(step) = queue.pop_front() {
            if seen.insert(step) {
                queue.extend(edges.get(step).into_iter().flatten().copied());
            }
        }
        seen
    }

    /// Steps from which `step` can be reached
    fn ancestors(&self, step: &'a str) -> BTreeSet<&'a str> {
        Self::walk(step, &self.predecessors)
    }

    /// Names produced on every path to a terminal point, or `None` when the
    /// flow has no terminal point.
    fn guaranteed_outputs(&self, nodes: &BTreeMap<String, FlowNode>) -> Option<BTreeSet<String>> {
        let produced_by = |step: &str| -> BTreeSet<String> {
            nodes[step].outputs().into_iter().map(|p| p.name).collect()
        };
        let universe: BTreeSet<String> = self.order.iter().flat_map(|s| produced_by(s)).collect();

        let mut entry: BTreeMap<&str, BTreeSet<String>> = self
            .order
            .iter()
            .map(|s| (s.as_str(), universe.clone()))
            .collect();
        entry.insert(self.begin, BTreeSet::new());
        let exit_of = |entry: &BTreeMap<&str, BTreeSet<String>>, step: &str| -> BTreeSet<String> {
            entry[step].union(&produced_by(step)).cloned().collect()
        };

        let mut changed = true;
        while changed {
            changed = false;
            for step in self.order.iter().map(String::as_str) {
                if step == self.begin {
                    continue;
                }
                let Some(preds) = self.predecessors.get(step) else {
                    continue;
                };
                let mut incoming: Option<BTreeSet<String>> = None;
                for pred in preds {
                    let out = exit_of(&entry, *pred);
                    incoming = Some(match incoming {
                        None => out,
                        Some(acc) => acc.intersection(&out).cloned().collect(),
                    });
                }
                if let Some(incoming) = incoming {
                    if incoming != entry[step] {
                        entry.insert(step, incoming);
                        changed = true;
                    }
                }
            }
        }

        let mut terminal: Option<BTreeSet<String>> = None;
        for step in self.order.iter().map(String::as_str) {
            if !self.reachable.contains(step) {
                continue;
            }
            let at_end = if nodes[step].step.is_terminal() {
                Some(entry[step].clone())
            } else if self.exits.contains(step) {
                Some(exit_of(&entry, step))
            } else {
                None
            };
            if let Some(at_end) = at_end {
                terminal = Some(match terminal {
                    None => at_end,
                    Some(acc) => acc.intersection(&at_end).cloned().collect(),
                });
            }
        }
        terminal
    }
}
