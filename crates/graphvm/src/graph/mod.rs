//! Static operator graphs: construction, substitution, and compilation.
//!
//! A [`Graph`] is mutable while it is being built. [`Graph::compile`] validates it and freezes
//! a snapshot into an [`Arc<CompiledGraph>`]; the snapshot is cached until the next structural
//! edit bumps the graph version, so repeated compiles of an unchanged graph are free.

mod compile;
mod node;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::gradient::{self, GradientRequest};
use crate::ops::{OpConfig, OperatorRegistry, Phase};
use crate::timing;
use crate::workspace::Workspace;

pub use compile::{CompiledGraph, GradientSeed};
pub use node::Node;

pub(crate) use compile::{producers, validate_and_order};
pub(crate) use node::{GradientBinding, Invocation};

/// A directed set of operator nodes connected through named tensors.
pub struct Graph {
    name: String,
    registry: Arc<OperatorRegistry>,
    nodes: Vec<Node>,
    inputs: Vec<String>,
    requires_grad: BTreeSet<String>,
    outputs: BTreeSet<String>,
    phase: Option<Phase>,
    version: u64,
    compiled: Option<Arc<CompiledGraph>>,
}

impl Graph {
    pub fn new(name: impl Into<String>, registry: Arc<OperatorRegistry>) -> Self {
        Graph {
            name: name.into(),
            registry,
            nodes: Vec::new(),
            inputs: Vec::new(),
            requires_grad: BTreeSet::new(),
            outputs: BTreeSet::new(),
            phase: None,
            version: 0,
            compiled: None,
        }
    }

    /// Creates a graph named by the workspace's sequential counter (`Graph_<n>`).
    pub fn in_workspace(workspace: &Workspace, registry: Arc<OperatorRegistry>) -> Self {
        Self::new(workspace.next_graph_name(), registry)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Structural version; bumped by every edit.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn registry(&self) -> &Arc<OperatorRegistry> {
        &self.registry
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(String::as_str)
    }

    fn touch(&mut self) {
        self.version += 1;
        self.compiled = None;
    }

    /// Declares a tensor bound by the caller before each run.
    pub fn declare_input(&mut self, name: impl Into<String>, requires_grad: bool) -> &mut Self {
        let name = name.into();
        if requires_grad {
            self.requires_grad.insert(name.clone());
        } else {
            self.requires_grad.remove(&name);
        }
        if !self.inputs.contains(&name) {
            self.inputs.push(name);
        }
        self.touch();
        self
    }

    /// Keeps `name` bound after each run instead of recycling its buffer.
    pub fn mark_output(&mut self, name: impl Into<String>) -> &mut Self {
        self.outputs.insert(name.into());
        self.touch();
        self
    }

    /// Overrides the phase derived from whether gradients are compiled.
    pub fn set_phase(&mut self, phase: Phase) -> &mut Self {
        self.phase = Some(phase);
        self.touch();
        self
    }

    /// Appends a node named `<kind>_<index>`.
    pub fn add_node<I, O>(
        &mut self,
        kind: &str,
        inputs: I,
        outputs: O,
        config: OpConfig,
    ) -> Result<usize>
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        let name = format!("{kind}_{}", self.nodes.len());
        self.add_named_node(name, kind, inputs, outputs, config)
    }

    /// Appends a node; the operator is instantiated immediately so unknown kinds and bad
    /// configuration fail here rather than at compile time.
    pub fn add_named_node<I, O>(
        &mut self,
        name: impl Into<String>,
        kind: &str,
        inputs: I,
        outputs: O,
        config: OpConfig,
    ) -> Result<usize>
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        let inputs: Vec<String> = inputs.into_iter().map(Into::into).collect();
        let outputs: Vec<String> = outputs.into_iter().map(Into::into).collect();
        let op = self.registry.create(kind, &inputs, &outputs, &config)?;
        let index = self.nodes.len();
        self.nodes.push(Node {
            name: name.into(),
            kind: kind.to_string(),
            inputs,
            outputs,
            config,
            op,
            invocation: Invocation::Forward,
            gradient: false,
        });
        self.touch();
        Ok(index)
    }

    /// Replaces every read of a key tensor by its mapped tensor.
    ///
    /// A replaced external input is no longer read, so it stops being declared.
    pub fn substitute(&mut self, givens: &HashMap<String, String>) -> &mut Self {
        if givens.is_empty() {
            return self;
        }
        for node in &mut self.nodes {
            for input in &mut node.inputs {
                if let Some(replacement) = givens.get(input.as_str()) {
                    *input = replacement.clone();
                }
            }
        }
        self.inputs.retain(|name| !givens.contains_key(name));
        self.requires_grad.retain(|name| !givens.contains_key(name));
        self.touch();
        self
    }

    /// Validates the graph and freezes its execution order.
    ///
    /// Returns the cached compilation while the graph is unchanged.
    pub fn compile(&mut self) -> Result<Arc<CompiledGraph>> {
        if let Some(compiled) = &self.compiled {
            return Ok(Arc::clone(compiled));
        }
        let started = Instant::now();
        let order = validate_and_order(&self.nodes, &self.inputs)?;
        let compiled = Arc::new(CompiledGraph {
            name: self.name.clone(),
            version: self.version,
            forward_len: order.len(),
            nodes: self.nodes.clone(),
            order,
            inputs: self.inputs.clone(),
            seeds: Vec::new(),
            terminals: Vec::new(),
            gradients: BTreeMap::new(),
            retained: self.outputs.clone(),
            phase: self.phase.unwrap_or(Phase::Test),
        });
        timing::add_compile_time(started.elapsed());
        debug!(
            graph = %self.name,
            version = self.version,
            nodes = compiled.nodes.len(),
            "compiled graph"
        );
        self.compiled = Some(Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Compiles the forward graph extended with the backward graph for `request`.
    pub fn compile_with_gradients(
        &mut self,
        request: &GradientRequest,
        config: &EngineConfig,
    ) -> Result<Arc<CompiledGraph>> {
        let forward = self.compile()?;
        let started = Instant::now();
        let wrt: Vec<String> = match &request.wrt {
            Some(wrt) => wrt.clone(),
            None => self
                .inputs
                .iter()
                .filter(|name| self.requires_grad.contains(*name))
                .cloned()
                .collect(),
        };
        let backward = gradient::build(
            &forward.nodes,
            &forward.order,
            &forward.inputs,
            &request.terminals,
            &wrt,
            config.strict_gradients,
        )?;

        let mut nodes = forward.nodes.clone();
        nodes.extend(backward.nodes);
        let mut external = forward.inputs.clone();
        external.extend(backward.seeds.iter().map(|seed| seed.tensor.clone()));
        let order = validate_and_order(&nodes, &external)?;

        let mut retained = self.outputs.clone();
        retained.extend(backward.gradients.values().cloned());
        let compiled = Arc::new(CompiledGraph {
            name: self.name.clone(),
            version: self.version,
            nodes,
            order,
            forward_len: forward.nodes.len(),
            inputs: forward.inputs.clone(),
            seeds: backward.seeds,
            terminals: request.terminals.clone(),
            gradients: backward.gradients,
            retained,
            phase: self.phase.unwrap_or(Phase::Train),
        });
        timing::add_compile_time(started.elapsed());
        debug!(
            graph = %self.name,
            version = self.version,
            nodes = compiled.nodes.len(),
            backward = compiled.nodes.len() - compiled.forward_len,
            "compiled graph with gradients"
        );
        Ok(compiled)
    }
}
