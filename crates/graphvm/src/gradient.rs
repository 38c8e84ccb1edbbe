//! Reverse-mode gradient graph synthesis.
//!
//! Given the compiled forward nodes, a set of terminal tensors, and the tensors to
//! differentiate against, the builder emits one backward node per forward node that lies on a
//! path between them. A tensor read by several consumers receives one partial gradient per
//! read; those partials are summed by a `GradientAccumulate` node that is emitted before the
//! tensor's own producer runs its backward step.
//!
//! Partials are always summed in the same order: the terminal seed first, then consumer reads
//! ordered by (node declaration index, input position).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::graph::{producers, GradientBinding, GradientSeed, Invocation, Node};
use crate::ops::builtin::{self, GRADIENT_ACCUMULATE, ZEROS_LIKE};
use crate::ops::OpConfig;

/// What to differentiate, and with respect to what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradientRequest {
    /// Tensors whose gradients are seeded (typically losses).
    pub terminals: Vec<String>,
    /// Differentiation targets; `None` means every input declared with `requires_grad`.
    pub wrt: Option<Vec<String>>,
}

impl GradientRequest {
    pub fn new<I>(terminals: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        GradientRequest {
            terminals: terminals.into_iter().map(Into::into).collect(),
            wrt: None,
        }
    }

    pub fn with_respect_to<I>(mut self, wrt: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.wrt = Some(wrt.into_iter().map(Into::into).collect());
        self
    }
}

/// Name of the fully accumulated gradient of `tensor`.
pub fn gradient_name(tensor: &str) -> String {
    format!("{tensor}_grad")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Contribution {
    Seed,
    Read { node: usize, input: usize },
}

struct ActiveNode {
    index: usize,
    wanted: Vec<bool>,
    has_grad: Vec<bool>,
}

pub(crate) struct BackwardGraph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) seeds: Vec<GradientSeed>,
    pub(crate) gradients: BTreeMap<String, String>,
}

struct Emitter<'a> {
    contributions: HashMap<&'a str, Vec<Contribution>>,
    accumulated: HashSet<&'a str>,
    nodes: Vec<Node>,
}

impl<'a> Emitter<'a> {
    /// Name of the partial gradient written by `contribution`.
    fn partial_name(&self, tensor: &str, contribution: Contribution) -> String {
        let list = self.contributions.get(tensor).map(Vec::as_slice).unwrap_or(&[]);
        if list.len() <= 1 {
            return gradient_name(tensor);
        }
        let position = list
            .iter()
            .position(|candidate| *candidate == contribution)
            .unwrap_or(list.len());
        format!("{tensor}_grad_{position}")
    }

    fn accumulate(&mut self, tensor: &'a str) {
        let Some(list) = self.contributions.get(tensor) else {
            return;
        };
        if list.len() <= 1 || !self.accumulated.insert(tensor) {
            return;
        }
        let partials: Vec<String> = list
            .iter()
            .map(|contribution| self.partial_name(tensor, *contribution))
            .collect();
        self.nodes.push(Node {
            name: format!("{tensor}_grad_sum"),
            kind: GRADIENT_ACCUMULATE.to_string(),
            inputs: partials,
            outputs: vec![gradient_name(tensor)],
            config: OpConfig::new(),
            op: builtin::accumulate(),
            invocation: Invocation::Forward,
            gradient: true,
        });
    }

    fn zeros(&mut self, tensor: &str) {
        self.nodes.push(Node {
            name: format!("{tensor}_grad_zeros"),
            kind: ZEROS_LIKE.to_string(),
            inputs: vec![tensor.to_string()],
            outputs: vec![gradient_name(tensor)],
            config: OpConfig::new(),
            op: builtin::zeros_like(),
            invocation: Invocation::Forward,
            gradient: true,
        });
    }
}

/// Synthesises the backward nodes for `terminals` with respect to `wrt`.
pub(crate) fn build(
    nodes: &[Node],
    order: &[usize],
    inputs: &[String],
    terminals: &[String],
    wrt: &[String],
    strict: bool,
) -> Result<BackwardGraph> {
    let producers = producers(nodes, inputs)?;
    let known = |tensor: &str| producers.contains_key(tensor) || inputs.iter().any(|i| i == tensor);
    if let Some(missing) = terminals.iter().chain(wrt).find(|name| !known(name)) {
        return Err(Error::unknown_tensor(missing.as_str()));
    }

    let mut needs: HashSet<&str> = wrt.iter().map(String::as_str).collect();
    for &index in order {
        let node = &nodes[index];
        if node.op.stops_gradient() {
            continue;
        }
        if node.inputs.iter().any(|input| needs.contains(input.as_str())) {
            needs.extend(node.outputs.iter().map(String::as_str));
        }
    }

    let mut contributions: HashMap<&str, Vec<Contribution>> = HashMap::new();
    let mut seeded: Vec<&str> = Vec::new();
    for terminal in terminals {
        if seeded.contains(&terminal.as_str()) {
            continue;
        }
        if !needs.contains(terminal.as_str()) {
            if strict {
                return Err(Error::DisconnectedGraph {
                    terminal: terminal.clone(),
                });
            }
            warn!(
                terminal = %terminal,
                "terminal reaches no differentiation target; its gradients stay zero"
            );
            continue;
        }
        contributions
            .entry(terminal.as_str())
            .or_default()
            .push(Contribution::Seed);
        seeded.push(terminal.as_str());
    }

    // Consumers precede producers in reverse order, so each tensor's contribution list is
    // complete by the time its producer is visited.
    let mut active: Vec<ActiveNode> = Vec::new();
    for &index in order.iter().rev() {
        let node = &nodes[index];
        if node.op.stops_gradient() {
            continue;
        }
        let has_grad: Vec<bool> = node
            .outputs
            .iter()
            .map(|output| contributions.contains_key(output.as_str()))
            .collect();
        let wanted: Vec<bool> = node
            .inputs
            .iter()
            .map(|input| needs.contains(input.as_str()))
            .collect();
        if !has_grad.contains(&true) || !wanted.contains(&true) {
            continue;
        }
        if !node.op.differentiable() {
            return Err(Error::NoGradientDefined {
                kind: node.kind.clone(),
                node: node.name.clone(),
            });
        }
        for (position, input) in node.inputs.iter().enumerate() {
            if wanted[position] {
                contributions
                    .entry(input.as_str())
                    .or_default()
                    .push(Contribution::Read {
                        node: index,
                        input: position,
                    });
            }
        }
        active.push(ActiveNode {
            index,
            wanted,
            has_grad,
        });
    }
    for list in contributions.values_mut() {
        list.sort();
    }

    let mut emitter = Emitter {
        contributions,
        accumulated: HashSet::new(),
        nodes: Vec::new(),
    };
    let seeds: Vec<GradientSeed> = seeded
        .iter()
        .map(|terminal| GradientSeed {
            terminal: terminal.to_string(),
            tensor: emitter.partial_name(terminal, Contribution::Seed),
        })
        .collect();

    for plan in &active {
        let node = &nodes[plan.index];
        for (position, output) in node.outputs.iter().enumerate() {
            if plan.has_grad[position] {
                emitter.accumulate(output.as_str());
            }
        }

        let mut grad_inputs = node.inputs.clone();
        grad_inputs.extend(node.outputs.iter().cloned());
        grad_inputs.extend(
            node.outputs
                .iter()
                .zip(&plan.has_grad)
                .filter(|(_, has)| **has)
                .map(|(output, _)| gradient_name(output)),
        );
        let grad_outputs: Vec<String> = node
            .inputs
            .iter()
            .enumerate()
            .filter(|(position, _)| plan.wanted[*position])
            .map(|(position, input)| {
                emitter.partial_name(
                    input,
                    Contribution::Read {
                        node: plan.index,
                        input: position,
                    },
                )
            })
            .collect();

        emitter.nodes.push(Node {
            name: format!("{}_grad", node.name),
            kind: node.kind.clone(),
            inputs: grad_inputs,
            outputs: grad_outputs,
            config: node.config.clone(),
            op: Arc::clone(&node.op),
            invocation: Invocation::Backward(GradientBinding {
                forward_inputs: node.inputs.len(),
                forward_outputs: node.outputs.len(),
                output_grads: plan.has_grad.clone(),
                input_grads: plan.wanted.clone(),
            }),
            gradient: true,
        });
    }

    let mut gradients = BTreeMap::new();
    for target in wrt {
        if gradients.contains_key(target) {
            continue;
        }
        if emitter.contributions.contains_key(target.as_str()) {
            emitter.accumulate(target.as_str());
        } else {
            emitter.zeros(target);
        }
        gradients.insert(target.clone(), gradient_name(target));
    }

    debug!(
        terminals = seeds.len(),
        targets = gradients.len(),
        nodes = emitter.nodes.len(),
        "built backward graph"
    );
    Ok(BackwardGraph {
        nodes: emitter.nodes,
        seeds,
        gradients,
    })
}
