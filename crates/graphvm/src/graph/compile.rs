//! Structural validation and deterministic topological ordering.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};

use serde::Serialize;
use smallvec::SmallVec;

use super::Node;
use crate::error::{Error, Result};
use crate::ops::Phase;

/// Seed tensor fed by the executor before the backward part of a plan runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GradientSeed {
    /// Terminal tensor the seed is the gradient of.
    pub terminal: String,
    /// External tensor holding the seed value.
    pub tensor: String,
}

/// Immutable, validated graph with a fixed node order.
///
/// Safe to share across threads; every [`ExecutionPlan`](crate::ExecutionPlan) holds one.
#[derive(Debug)]
pub struct CompiledGraph {
    pub(crate) name: String,
    pub(crate) version: u64,
    pub(crate) nodes: Vec<Node>,
    pub(crate) order: Vec<usize>,
    pub(crate) forward_len: usize,
    pub(crate) inputs: Vec<String>,
    pub(crate) seeds: Vec<GradientSeed>,
    pub(crate) terminals: Vec<String>,
    pub(crate) gradients: BTreeMap<String, String>,
    pub(crate) retained: BTreeSet<String>,
    pub(crate) phase: Phase,
}

impl CompiledGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Graph version this compilation was produced from.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Node indices in execution order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Node names in execution order.
    pub fn node_names(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&index| self.nodes[index].name.as_str())
            .collect()
    }

    /// Number of leading steps that belong to the forward graph.
    pub fn forward_len(&self) -> usize {
        self.forward_len
    }

    /// External inputs the caller must bind before running.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn seeds(&self) -> &[GradientSeed] {
        &self.seeds
    }

    pub fn terminals(&self) -> &[String] {
        &self.terminals
    }

    /// Gradient tensor computed for `tensor`, if it was a differentiation target.
    pub fn gradient_of(&self, tensor: &str) -> Option<&str> {
        self.gradients.get(tensor).map(String::as_str)
    }

    /// Tensors kept bound after a run.
    pub fn retained(&self) -> &BTreeSet<String> {
        &self.retained
    }

    pub fn has_gradients(&self) -> bool {
        !self.terminals.is_empty()
    }

    pub(crate) fn is_external(&self, tensor: &str) -> bool {
        self.inputs.iter().any(|name| name == tensor)
            || self.seeds.iter().any(|seed| seed.tensor == tensor)
    }
}

/// Maps every produced tensor to its single producer.
pub(crate) fn producers(nodes: &[Node], external: &[String]) -> Result<HashMap<String, usize>> {
    let external: HashSet<&str> = external.iter().map(String::as_str).collect();
    let mut producers: HashMap<String, usize> = HashMap::new();
    for (index, node) in nodes.iter().enumerate() {
        for output in &node.outputs {
            if external.contains(output.as_str()) {
                return Err(Error::MultipleProducers {
                    tensor: output.clone(),
                    first: "<external input>".to_string(),
                    second: node.name.clone(),
                });
            }
            if let Some(&first) = producers.get(output) {
                return Err(Error::MultipleProducers {
                    tensor: output.clone(),
                    first: nodes[first].name.clone(),
                    second: node.name.clone(),
                });
            }
            producers.insert(output.clone(), index);
        }
    }
    Ok(producers)
}

/// Validates the node set and returns a topological order.
///
/// Among nodes whose dependencies are resolved, the earliest declared runs first, so the
/// order is a pure function of the graph.
pub(crate) fn validate_and_order(nodes: &[Node], external: &[String]) -> Result<Vec<usize>> {
    let producers = producers(nodes, external)?;
    let external: HashSet<&str> = external.iter().map(String::as_str).collect();

    let mut dependents: Vec<SmallVec<[usize; 4]>> = vec![SmallVec::new(); nodes.len()];
    let mut pending = vec![0usize; nodes.len()];
    for (index, node) in nodes.iter().enumerate() {
        for input in &node.inputs {
            match producers.get(input) {
                Some(&producer) => {
                    dependents[producer].push(index);
                    pending[index] += 1;
                }
                None if external.contains(input.as_str()) => {}
                None => {
                    return Err(Error::DanglingInput {
                        node: node.name.clone(),
                        tensor: input.clone(),
                    })
                }
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(index, _)| Reverse(index))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(index)) = ready.pop() {
        order.push(index);
        for &dependent in &dependents[index] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(Error::CyclicGraph {
            cycle: find_cycle(nodes, &producers, &pending),
        });
    }
    Ok(order)
}

/// Walks producer edges backwards through the nodes Kahn's algorithm could not schedule.
///
/// Every such node still has an unscheduled producer, so the walk must revisit a node.
fn find_cycle(
    nodes: &[Node],
    producers: &HashMap<String, usize>,
    pending: &[usize],
) -> Vec<String> {
    let stuck = |index: usize| pending[index] > 0;
    let Some(start) = (0..nodes.len()).find(|&index| stuck(index)) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut seen: HashMap<usize, usize> = HashMap::new();
    let mut current = start;
    loop {
        if let Some(&position) = seen.get(&current) {
            let mut cycle: Vec<String> = path[position..]
                .iter()
                .rev()
                .map(|&index| nodes[index].name.clone())
                .collect();
            if let Some(first) = cycle.first().cloned() {
                cycle.push(first);
            }
            return cycle;
        }
        seen.insert(current, path.len());
        path.push(current);
        let next = nodes[current]
            .inputs
            .iter()
            .filter_map(|input| producers.get(input).copied())
            .filter(|&producer| stuck(producer))
            .min();
        match next {
            Some(producer) => current = producer,
            None => return path.iter().map(|&index| nodes[index].name.clone()).collect(),
        }
    }
}
