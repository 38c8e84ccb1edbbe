//! Plan replay against a workspace.
//!
//! The executor walks plan steps in order. For each step it borrows the input tensors, calls
//! the node's forward or backward kernel, and only after the kernel succeeds binds and writes
//! the outputs into the buffers the plan directs. A failing node therefore never leaves a
//! half-written output behind, and every error is tagged with the node that raised it.
//!
//! Several executors may share one workspace as long as they run under disjoint namespaces;
//! the workspace serialises binding changes while kernels run concurrently.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::graph::{CompiledGraph, Graph, Invocation, Node};
use crate::ops::{BackwardContext, ForwardContext, Phase, TensorView};
use crate::scheduler::{ExecutionPlan, InputSignature, PlanStep};
use crate::tensor::{BufferId, Tensor, TensorMeta, TensorValue};
use crate::update::UpdateStep;
use crate::workspace::{Preferred, Workspace};

/// Cooperative cancellation flag, checked between node boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Acquire)
    }

    /// Clears the flag so the token can guard another run.
    pub fn reset(&self) {
        self.0.store(false, AtomicOrdering::Release);
    }
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub steps: usize,
    /// Buffers newly allocated from the device during the run.
    pub fresh_buffers: u64,
    /// Outputs placed into recycled buffers.
    pub reused_buffers: u64,
    /// Most buffers held by live bindings at any step boundary.
    pub peak_live_buffers: usize,
    pub elapsed: Duration,
}

/// Replays execution plans against a workspace, optionally under a tensor-name namespace.
pub struct Executor<'w> {
    workspace: &'w Workspace,
    namespace: Option<String>,
    cancel: CancelToken,
}

impl<'w> Executor<'w> {
    pub fn new(workspace: &'w Workspace) -> Self {
        Executor {
            workspace,
            namespace: None,
            cancel: CancelToken::new(),
        }
    }

    /// Prefixes every tensor name with `<namespace>/`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn workspace(&self) -> &'w Workspace {
        self.workspace
    }

    /// Workspace name of a plan-local tensor name.
    pub fn scoped(&self, name: &str) -> String {
        match &self.namespace {
            Some(namespace) => format!("{namespace}/{name}"),
            None => name.to_string(),
        }
    }

    /// Binds an input under this executor's namespace.
    pub fn feed(&self, name: &str, value: TensorValue) -> Result<Tensor> {
        self.workspace.feed(&self.scoped(name), value)
    }

    pub fn fetch(&self, name: &str) -> Result<Tensor> {
        self.workspace.fetch(&self.scoped(name))
    }

    pub fn fetch_value(&self, name: &str) -> Result<TensorValue> {
        self.workspace.fetch_value(&self.scoped(name))
    }

    /// Metadata of the graph inputs currently bound under this namespace.
    pub fn signature(&self, graph: &CompiledGraph) -> Result<InputSignature> {
        graph
            .inputs()
            .iter()
            .map(|name| Ok((name.clone(), self.workspace.meta(&self.scoped(name))?)))
            .collect()
    }

    /// Runs the forward part of `plan`.
    pub fn run(&self, plan: &ExecutionPlan) -> Result<RunReport> {
        self.execute(plan, plan.forward_len())
    }

    /// Runs forward then backward, seeding each loss gradient with ones.
    ///
    /// Terminals of the plan that are not listed in `losses` are seeded with zeros.
    pub fn run_with_gradients(&self, plan: &ExecutionPlan, losses: &[&str]) -> Result<RunReport> {
        let graph = plan.graph();
        if let Some(loss) = losses
            .iter()
            .find(|loss| !graph.terminals().iter().any(|terminal| terminal == *loss))
        {
            return Err(Error::NotATerminal {
                name: loss.to_string(),
            });
        }
        for seed in graph.seeds() {
            let meta: TensorMeta = plan
                .meta(&seed.tensor)
                .cloned()
                .ok_or_else(|| Error::unknown_tensor(seed.tensor.as_str()))?;
            let fill = if losses.contains(&seed.terminal.as_str()) {
                1.0
            } else {
                0.0
            };
            self.workspace
                .feed(&self.scoped(&seed.tensor), TensorValue::filled(meta, fill))?;
        }
        self.execute(plan, plan.steps().len())
    }

    /// Applies parameter updates in order, writing each parameter and its history in place.
    pub(crate) fn apply_updates(&self, updates: &[UpdateStep]) -> Result<()> {
        for update in updates {
            trace!(update = %update.name, kind = %update.op.kind(), "applying update");
            self.apply_update(update).map_err(|err| err.at_node(&update.name, update.op.kind()))?;
        }
        Ok(())
    }

    fn apply_update(&self, update: &UpdateStep) -> Result<()> {
        let param = self.fetch(&update.param)?;
        let grad = self.fetch(&update.grad)?;
        if grad.meta() != param.meta() {
            return Err(Error::shape_mismatch(update.grad.as_str(), param.meta(), grad.meta()));
        }
        let history_name = self.scoped(&update.history);
        let history = match self.workspace.fetch(&history_name) {
            Ok(history) if history.meta() == param.meta() => history,
            _ => {
                let zeros = TensorValue::zeros(param.meta().clone());
                let history = self.workspace.feed(&history_name, zeros)?;
                self.workspace.mark_persistent(&history_name)?;
                history
            }
        };

        let metas = [param.meta().clone(), param.meta().clone()];
        let values = {
            let tensors = [&param, &grad, &history];
            let guards = tensors
                .iter()
                .map(|tensor| tensor.read())
                .collect::<Result<Vec<_>>>()?;
            let views: Vec<TensorView<'_>> = tensors
                .iter()
                .zip(&guards)
                .map(|(tensor, guard)| TensorView::new(tensor.meta(), guard))
                .collect();
            let mut ctx = ForwardContext::new(&update.name, Phase::Train, views, &metas);
            update.op.forward(&mut ctx)?;
            ctx.into_outputs()?
        };
        for (tensor, value) in [&param, &history].into_iter().zip(values) {
            tensor.write(value)?;
        }
        Ok(())
    }

    fn execute(&self, plan: &ExecutionPlan, limit: usize) -> Result<RunReport> {
        let graph = plan.graph();
        let started = Instant::now();
        let before = self.workspace.stats();
        let mut slot_buffers: Vec<Option<BufferId>> = vec![None; plan.slot_count()];
        let mut peak_live_buffers = before.live_buffers;

        for (completed, step) in plan.steps().iter().take(limit).enumerate() {
            if self.cancel.is_cancelled() {
                debug!(graph = %graph.name(), completed, "run cancelled");
                return Err(Error::Cancelled { completed });
            }
            let node = &graph.nodes()[step.node];
            trace!(
                graph = %graph.name(),
                node = %node.name(),
                kind = %node.kind(),
                "executing step"
            );
            let live = self
                .execute_step(plan, node, step, &mut slot_buffers)
                .map_err(|err| err.at_node(node.name(), node.kind()))?;
            peak_live_buffers = peak_live_buffers.max(live);
        }

        let after = self.workspace.stats();
        let report = RunReport {
            steps: limit.min(plan.steps().len()),
            fresh_buffers: after
                .allocations
                .fresh
                .saturating_sub(before.allocations.fresh),
            reused_buffers: after
                .allocations
                .reused
                .saturating_sub(before.allocations.reused),
            peak_live_buffers,
            elapsed: started.elapsed(),
        };
        debug!(
            graph = %graph.name(),
            steps = report.steps,
            fresh = report.fresh_buffers,
            reused = report.reused_buffers,
            "run finished"
        );
        Ok(report)
    }

    /// Returns the number of live buffers right after the outputs were committed.
    fn execute_step(
        &self,
        plan: &ExecutionPlan,
        node: &Node,
        step: &PlanStep,
        slot_buffers: &mut [Option<BufferId>],
    ) -> Result<usize> {
        let mut names: Vec<&str> = Vec::new();
        let mut tensors: Vec<Tensor> = Vec::new();
        let mut positions = Vec::with_capacity(node.inputs().len());
        for input in node.inputs() {
            let position = match names.iter().position(|name| *name == input) {
                Some(position) => position,
                None => {
                    let tensor = self.workspace.fetch(&self.scoped(input))?;
                    if let Some(expected) = plan.meta(input) {
                        if tensor.meta() != expected {
                            return Err(Error::shape_mismatch(
                                input.as_str(),
                                expected,
                                tensor.meta(),
                            ));
                        }
                    }
                    names.push(input);
                    tensors.push(tensor);
                    tensors.len() - 1
                }
            };
            positions.push(position);
        }

        let values = {
            let guards = tensors
                .iter()
                .map(Tensor::read)
                .collect::<Result<Vec<_>>>()?;
            let views: Vec<TensorView<'_>> = positions
                .iter()
                .map(|&position| TensorView::new(tensors[position].meta(), &guards[position]))
                .collect();
            invoke(plan.graph().phase(), node, step, views)?
        };
        if values.len() != step.outputs.len() {
            return Err(Error::kernel(format!(
                "produced {} value(s) for {} planned output(s)",
                values.len(),
                step.outputs.len()
            )));
        }

        // Persistent tensors keep their buffer for the whole session.
        let donor = positions
            .first()
            .map(|&position| &tensors[position])
            .filter(|tensor| !self.workspace.is_persistent(tensor.name()));
        for (directive, value) in step.outputs.iter().zip(values) {
            let preferred = if directive.in_place && donor.is_some() {
                donor.map(|tensor| Preferred::InPlace(tensor.buffer()))
            } else {
                slot_buffers[directive.slot].map(Preferred::Slot)
            };
            let tensor = self.workspace.bind_output(
                &self.scoped(&directive.tensor),
                directive.meta.clone(),
                preferred,
            )?;
            tensor.write(value)?;
            slot_buffers[directive.slot] = Some(tensor.buffer());
        }

        let live = self.workspace.stats().live_buffers;
        for tensor in &step.releases {
            let scoped = self.scoped(tensor);
            if !self.workspace.is_persistent(&scoped) {
                self.workspace.release(&scoped)?;
            }
        }
        Ok(live)
    }
}

fn invoke(
    phase: Phase,
    node: &Node,
    step: &PlanStep,
    views: Vec<TensorView<'_>>,
) -> Result<Vec<TensorValue>> {
    let metas: Vec<TensorMeta> = step
        .outputs
        .iter()
        .map(|directive| directive.meta.clone())
        .collect();
    match &node.invocation {
        Invocation::Forward => {
            let mut ctx = ForwardContext::new(node.name(), phase, views, &metas);
            node.operator().forward(&mut ctx)?;
            ctx.into_outputs()
        }
        Invocation::Backward(binding) => {
            let mut views = views.into_iter();
            let inputs: Vec<TensorView<'_>> = views.by_ref().take(binding.forward_inputs).collect();
            let outputs: Vec<TensorView<'_>> =
                views.by_ref().take(binding.forward_outputs).collect();
            let output_grads: Vec<Option<TensorView<'_>>> = binding
                .output_grads
                .iter()
                .map(|present| if *present { views.next() } else { None })
                .collect();
            let mut ctx = BackwardContext::new(
                node.name(),
                phase,
                inputs,
                outputs,
                output_grads,
                &binding.input_grads,
            );
            node.operator().backward(&mut ctx)?;
            ctx.into_input_grads()
        }
    }
}

/// Validates `graph` and freezes its execution order.
pub fn compile_graph(graph: &mut Graph) -> Result<Arc<CompiledGraph>> {
    graph.compile()
}

/// Runs the forward part of `plan` against `workspace`.
pub fn run(plan: &ExecutionPlan, workspace: &Workspace) -> Result<RunReport> {
    Executor::new(workspace).run(plan)
}

/// Runs `plan` forward and backward, seeding `losses` with unit gradients.
pub fn run_with_gradients(
    plan: &ExecutionPlan,
    workspace: &Workspace,
    losses: &[&str],
) -> Result<RunReport> {
    Executor::new(workspace).run_with_gradients(plan, losses)
}
