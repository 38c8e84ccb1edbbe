//! Execution planning: specialise a compiled graph for concrete input metadata, compute
//! tensor live ranges, and decide which buffers outputs may reuse.
//!
//! Scheduling is a pure function of the compiled graph, the input signature, and the
//! [`ScheduleOptions`], so equal requests always produce identical plans.

mod cache;
mod liveness;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::graph::{CompiledGraph, Graph, Invocation};
use crate::tensor::TensorMeta;
use crate::timing;

pub use cache::{PlanCache, PlanKey};
pub use liveness::LiveRange;

use liveness::{max_overlap, SlotAllocator, SlotRequest};

/// Metadata of every external input, keyed by tensor name.
pub type InputSignature = BTreeMap<String, TensorMeta>;

/// Memory policy knobs that change plan shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScheduleOptions {
    /// Keep every intermediate bound and give each its own buffer.
    pub debug_mode: bool,
    /// Keep gradient tensors out of buffer sharing and release.
    pub isolate_gradients: bool,
}

impl From<&EngineConfig> for ScheduleOptions {
    fn from(config: &EngineConfig) -> Self {
        ScheduleOptions {
            debug_mode: config.debug_mode,
            isolate_gradients: !config.share_grads,
        }
    }
}

/// Where one output of a step is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDirective {
    pub tensor: String,
    pub meta: TensorMeta,
    /// Plan-local physical buffer slot.
    pub slot: usize,
    /// The slot was taken over from the dying first input of an in-place-safe node.
    pub in_place: bool,
}

/// One node invocation plus its buffer directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub node: usize,
    pub outputs: Vec<OutputDirective>,
    /// Tensors whose last use is this step; unbound right after it.
    pub releases: Vec<String>,
}

/// Topological node order plus per-step buffer reuse directives.
#[derive(Debug)]
pub struct ExecutionPlan {
    graph: Arc<CompiledGraph>,
    options: ScheduleOptions,
    steps: Vec<PlanStep>,
    metas: BTreeMap<String, TensorMeta>,
    ranges: BTreeMap<String, LiveRange>,
    slot_count: usize,
}

impl ExecutionPlan {
    /// Specialises `graph` for `inputs`.
    pub fn new(
        graph: Arc<CompiledGraph>,
        inputs: &InputSignature,
        options: ScheduleOptions,
    ) -> Result<Self> {
        let started = Instant::now();
        let metas = infer_metas(&graph, inputs)?;
        let ranges = live_ranges(&graph, options);

        let mut allocator = SlotAllocator::default();
        let mut steps = Vec::with_capacity(graph.order.len());
        for (position, &index) in graph.order.iter().enumerate() {
            let node = &graph.nodes[index];
            let in_place_input = (node.invocation == Invocation::Forward
                && node.op.in_place_safe()
                && !options.debug_mode)
                .then(|| node.inputs.first())
                .flatten()
                .filter(|input| {
                    ranges
                        .get(input.as_str())
                        .map(|range| range.end == position)
                        .unwrap_or(false)
                });

            let mut requests = Vec::with_capacity(node.outputs.len());
            for (slot_index, output) in node.outputs.iter().enumerate() {
                let meta = &metas[output];
                let byte_len = meta.byte_len().ok_or_else(|| Error::OutOfMemory {
                    device: meta.device,
                    requested: u64::MAX,
                    available: 0,
                })?;
                requests.push(SlotRequest {
                    tensor: output,
                    key: (meta.device, byte_len),
                    shares: !options.debug_mode
                        && !(options.isolate_gradients && node.gradient),
                    in_place_of: if slot_index == 0 {
                        in_place_input.map(String::as_str)
                    } else {
                        None
                    },
                });
            }
            let assigned = allocator.assign(&requests);
            let outputs = node
                .outputs
                .iter()
                .zip(assigned.slots)
                .zip(assigned.in_place)
                .map(|((tensor, slot), in_place)| OutputDirective {
                    tensor: tensor.clone(),
                    meta: metas[tensor].clone(),
                    slot,
                    in_place,
                })
                .collect();

            let mut releases: Vec<String> = Vec::new();
            for tensor in node.inputs.iter().chain(&node.outputs) {
                let dies_here = ranges
                    .get(tensor.as_str())
                    .map(|range| range.end == position)
                    .unwrap_or(false);
                if dies_here && !releases.contains(tensor) {
                    allocator.free(tensor);
                    releases.push(tensor.clone());
                }
            }
            steps.push(PlanStep {
                node: index,
                outputs,
                releases,
            });
        }

        let plan = ExecutionPlan {
            graph,
            options,
            steps,
            metas,
            ranges,
            slot_count: allocator.slot_count(),
        };
        timing::add_compile_time(started.elapsed());
        debug!(
            graph = %plan.graph.name,
            steps = plan.steps.len(),
            slots = plan.slot_count,
            max_live = plan.max_live_tensors(),
            "scheduled execution plan"
        );
        Ok(plan)
    }

    /// Compiles `graph` (propagating structural errors) and schedules the result.
    pub fn for_graph(
        graph: &mut Graph,
        inputs: &InputSignature,
        options: ScheduleOptions,
    ) -> Result<Self> {
        let compiled = graph.compile()?;
        Self::new(compiled, inputs, options)
    }

    pub fn graph(&self) -> &Arc<CompiledGraph> {
        &self.graph
    }

    pub fn options(&self) -> ScheduleOptions {
        self.options
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Number of leading steps that make up the forward pass.
    pub fn forward_len(&self) -> usize {
        self.graph.forward_len
    }

    /// Node names in plan order.
    pub fn node_order(&self) -> Vec<&str> {
        self.steps
            .iter()
            .map(|step| self.graph.nodes[step.node].name.as_str())
            .collect()
    }

    /// Inferred metadata of any tensor the plan touches.
    pub fn meta(&self, tensor: &str) -> Option<&TensorMeta> {
        self.metas.get(tensor)
    }

    pub fn live_range(&self, tensor: &str) -> Option<LiveRange> {
        self.ranges.get(tensor).copied()
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn slot_of(&self, tensor: &str) -> Option<usize> {
        self.steps
            .iter()
            .flat_map(|step| &step.outputs)
            .find(|directive| directive.tensor == tensor)
            .map(|directive| directive.slot)
    }

    /// Largest number of node-produced tensors simultaneously live at any step.
    pub fn max_live_tensors(&self) -> usize {
        max_overlap(self.ranges.values(), self.steps.len())
    }
}

fn infer_metas(
    graph: &CompiledGraph,
    inputs: &InputSignature,
) -> Result<BTreeMap<String, TensorMeta>> {
    let mut metas: BTreeMap<String, TensorMeta> = BTreeMap::new();
    for name in &graph.inputs {
        let meta = inputs
            .get(name)
            .ok_or_else(|| Error::unknown_tensor(name.as_str()))?;
        metas.insert(name.clone(), meta.clone());
    }

    for (position, &index) in graph.order.iter().enumerate() {
        if position == graph.forward_len {
            insert_seed_metas(graph, &mut metas)?;
        }
        let node = &graph.nodes[index];
        let input_metas: Vec<TensorMeta> = node
            .inputs
            .iter()
            .map(|input| {
                metas
                    .get(input)
                    .cloned()
                    .ok_or_else(|| Error::unknown_tensor(input.as_str()))
            })
            .collect::<Result<_>>()
            .map_err(|err| err.at_node(&node.name, &node.kind))?;
        let output_metas = match &node.invocation {
            Invocation::Forward => node
                .op
                .infer_outputs(&input_metas)
                .map_err(|err| err.at_node(&node.name, &node.kind))?,
            Invocation::Backward(binding) => input_metas[..binding.forward_inputs]
                .iter()
                .zip(&binding.input_grads)
                .filter(|(_, wanted)| **wanted)
                .map(|(meta, _)| meta.clone())
                .collect(),
        };
        if output_metas.len() != node.outputs.len() {
            return Err(Error::kernel(format!(
                "inferred {} output(s) for {} declared",
                output_metas.len(),
                node.outputs.len()
            ))
            .at_node(&node.name, &node.kind));
        }
        for (output, meta) in node.outputs.iter().zip(output_metas) {
            metas.insert(output.clone(), meta);
        }
    }
    if graph.forward_len == graph.order.len() {
        insert_seed_metas(graph, &mut metas)?;
    }
    Ok(metas)
}

fn insert_seed_metas(
    graph: &CompiledGraph,
    metas: &mut BTreeMap<String, TensorMeta>,
) -> Result<()> {
    for seed in &graph.seeds {
        let meta = metas
            .get(&seed.terminal)
            .cloned()
            .ok_or_else(|| Error::unknown_tensor(seed.terminal.as_str()))?;
        metas.insert(seed.tensor.clone(), meta);
    }
    Ok(())
}

/// Live range of every node-produced tensor. External inputs are owned by the caller and
/// never appear here.
fn live_ranges(graph: &CompiledGraph, options: ScheduleOptions) -> BTreeMap<String, LiveRange> {
    let mut produced_at: HashMap<&str, usize> = HashMap::new();
    let mut gradient: BTreeSet<&str> = BTreeSet::new();
    for (position, &index) in graph.order.iter().enumerate() {
        let node = &graph.nodes[index];
        for output in &node.outputs {
            produced_at.insert(output.as_str(), position);
            if node.gradient {
                gradient.insert(output.as_str());
            }
        }
    }

    // Single backward scan: the first read met is the last use.
    let mut last_use: HashMap<&str, usize> = HashMap::new();
    for (position, &index) in graph.order.iter().enumerate().rev() {
        for input in &graph.nodes[index].inputs {
            last_use.entry(input.as_str()).or_insert(position);
        }
    }

    produced_at
        .into_iter()
        .map(|(tensor, start)| {
            let pinned = options.debug_mode
                || graph.retained.contains(tensor)
                || (options.isolate_gradients && gradient.contains(tensor));
            let end = if pinned {
                LiveRange::OPEN
            } else {
                last_use.get(tensor).copied().unwrap_or(start).max(start)
            };
            (tensor.to_string(), LiveRange::new(start, end))
        })
        .collect()
}
