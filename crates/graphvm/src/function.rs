//! Callable front door over a compiled graph.
//!
//! A [`Function`] owns a compiled graph plus an LRU cache of execution plans keyed by the
//! metadata of the bound inputs. Each call feeds the positional values, reuses or schedules
//! the plan for the resulting signature, runs it, and fetches the requested outputs.
//!
//! A function either returns outputs or applies an [`Updater`], never both. An updating
//! function returns nothing and rewrites its parameters once the run finishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::executor::{Executor, RunReport};
use crate::gradient::GradientRequest;
use crate::graph::{CompiledGraph, Graph};
use crate::scheduler::{PlanCache, ScheduleOptions};
use crate::tensor::TensorValue;
use crate::update::{UpdateStep, Updater};
use crate::workspace::Workspace;

/// Collects inputs, outputs, givens and gradient targets before compiling a [`Function`].
pub struct FunctionBuilder {
    graph: Graph,
    inputs: Option<Vec<String>>,
    outputs: Vec<String>,
    givens: HashMap<String, String>,
    gradients: Option<GradientRequest>,
    updater: Option<Updater>,
    namespace: Option<String>,
    config: EngineConfig,
}

impl FunctionBuilder {
    pub fn new(graph: Graph) -> Self {
        FunctionBuilder {
            graph,
            inputs: None,
            outputs: Vec::new(),
            givens: HashMap::new(),
            gradients: None,
            updater: None,
            namespace: None,
            config: EngineConfig::default(),
        }
    }

    /// Positional inputs fed by [`Function::call`]. Defaults to every declared graph input;
    /// graph inputs left out must already be bound in the workspace.
    pub fn inputs<I>(mut self, inputs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.inputs = Some(inputs.into_iter().map(Into::into).collect());
        self
    }

    pub fn outputs<I>(mut self, outputs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces every read of `tensor` by `replacement`.
    pub fn given(mut self, tensor: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.givens.insert(tensor.into(), replacement.into());
        self
    }

    pub fn gradients(mut self, request: GradientRequest) -> Self {
        self.gradients = Some(request);
        self
    }

    /// Applies `updater` after every call. Excludes [`FunctionBuilder::outputs`].
    pub fn updater(mut self, updater: Updater) -> Self {
        self.updater = Some(updater);
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self, workspace: Arc<Workspace>) -> Result<Function> {
        let FunctionBuilder {
            mut graph,
            inputs,
            outputs,
            givens,
            gradients,
            updater,
            namespace,
            config,
        } = self;

        if updater.is_some() && !outputs.is_empty() {
            return Err(Error::invalid_config(
                graph.name(),
                "a function takes either outputs or an updater, not both",
            ));
        }
        let updates = match &updater {
            Some(updater) => updater.instantiate(graph.registry())?,
            None => Vec::new(),
        };
        graph.substitute(&givens);
        for output in &outputs {
            graph.mark_output(output.as_str());
        }
        let compiled = match &gradients {
            Some(request) => graph.compile_with_gradients(request, &config)?,
            None => graph.compile()?,
        };

        let inputs = inputs.unwrap_or_else(|| compiled.inputs().to_vec());
        if let Some(unknown) = inputs.iter().find(|name| !compiled.is_external(name)) {
            return Err(Error::unknown_tensor(unknown.as_str()));
        }
        let produced = |name: &str| {
            compiled.is_external(name)
                || compiled
                    .nodes()
                    .iter()
                    .any(|node| node.outputs().iter().any(|output| output == name))
        };
        if let Some(unknown) = outputs.iter().find(|name| !produced(name)) {
            return Err(Error::unknown_tensor(unknown.as_str()));
        }

        debug!(
            graph = %compiled.name(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            updates = updates.len(),
            gradients = compiled.has_gradients(),
            "built function"
        );
        Ok(Function {
            workspace,
            options: ScheduleOptions::from(&config),
            plans: Mutex::new(PlanCache::new(config.plan_cache_capacity)),
            graph: compiled,
            inputs,
            outputs,
            updates,
            namespace,
        })
    }
}

/// A compiled graph bound to a workspace, callable with positional host values.
///
/// Concurrent calls on one function share its input names; give each caller its own
/// namespace when they must run in parallel.
pub struct Function {
    workspace: Arc<Workspace>,
    graph: Arc<CompiledGraph>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    updates: Vec<UpdateStep>,
    namespace: Option<String>,
    options: ScheduleOptions,
    plans: Mutex<PlanCache>,
}

impl Function {
    pub fn builder(graph: Graph) -> FunctionBuilder {
        FunctionBuilder::new(graph)
    }

    pub fn graph(&self) -> &Arc<CompiledGraph> {
        &self.graph
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Name of the gradient tensor computed for `wrt`, if gradients were requested for it.
    pub fn gradient_of(&self, wrt: &str) -> Option<&str> {
        self.graph.gradient_of(wrt)
    }

    /// Feeds `values`, runs the plan for their signature, and returns the outputs in order.
    pub fn call(&self, values: Vec<TensorValue>) -> Result<Vec<TensorValue>> {
        self.call_with_report(values).map(|(outputs, _)| outputs)
    }

    pub fn call_with_report(
        &self,
        values: Vec<TensorValue>,
    ) -> Result<(Vec<TensorValue>, RunReport)> {
        if values.len() != self.inputs.len() {
            return Err(Error::invalid_config(
                self.graph.name(),
                format!(
                    "function takes {} input(s) but {} were given",
                    self.inputs.len(),
                    values.len()
                ),
            ));
        }
        let executor = self.executor();
        for (name, value) in self.inputs.iter().zip(values) {
            executor.feed(name, value)?;
        }

        let signature = executor.signature(&self.graph)?;
        let plan = self
            .plans
            .lock()
            .expect("plan cache mutex poisoned")
            .get_or_schedule(&self.graph, &signature, self.options)?;

        let report = if self.graph.has_gradients() {
            let losses: Vec<&str> = self.graph.terminals().iter().map(String::as_str).collect();
            executor.run_with_gradients(&plan, &losses)?
        } else {
            executor.run(&plan)?
        };
        executor.apply_updates(&self.updates)?;

        let outputs = self
            .outputs
            .iter()
            .map(|name| executor.fetch_value(name))
            .collect::<Result<Vec<_>>>()?;
        Ok((outputs, report))
    }

    /// Number of specialised plans currently cached.
    pub fn cached_plans(&self) -> usize {
        self.plans.lock().expect("plan cache mutex poisoned").len()
    }

    /// `(hits, misses)` of the plan cache.
    pub fn plan_cache_stats(&self) -> (u64, u64) {
        let plans = self.plans.lock().expect("plan cache mutex poisoned");
        (plans.hits(), plans.misses())
    }

    fn executor(&self) -> Executor<'_> {
        let executor = Executor::new(&self.workspace);
        match &self.namespace {
            Some(namespace) => executor.with_namespace(namespace.as_str()),
            None => executor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{ForwardContext, OpConfig, OpSpec, Operator, OperatorRegistry};
    use crate::tensor::{TensorData, TensorMeta};

    struct Double;

    impl Operator for Double {
        fn kind(&self) -> &str {
            "Double"
        }

        fn infer_outputs(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>> {
            Ok(inputs.to_vec())
        }

        fn forward(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
            let input = ctx.input(0)?.as_slice::<f32>()?;
            let doubled: Vec<f32> = input.iter().map(|v| v * 2.0).collect();
            ctx.set_output(0, TensorData::F32(doubled))
        }
    }

    fn doubling_graph() -> Graph {
        let registry = OperatorRegistry::new();
        registry
            .register("Double", |_: &OpSpec<'_>| Ok(Arc::new(Double) as Arc<dyn Operator>))
            .unwrap();
        let mut graph = Graph::new("double", Arc::new(registry));
        graph.declare_input("x", false);
        graph.add_node("Double", ["x"], ["y"], OpConfig::new()).unwrap();
        graph
    }

    fn vector(values: &[f32]) -> TensorValue {
        TensorValue::from_f32([values.len()], values.to_vec()).unwrap()
    }

    #[test]
    fn call_feeds_runs_and_fetches() {
        let function = Function::builder(doubling_graph())
            .outputs(["y"])
            .build(Arc::new(Workspace::new()))
            .unwrap();
        let outputs = function.call(vec![vector(&[1.0, 2.5])]).unwrap();
        assert_eq!(outputs[0].as_slice::<f32>().unwrap(), &[2.0, 5.0]);
    }

    #[test]
    fn plans_are_cached_per_signature() {
        let function = Function::builder(doubling_graph())
            .outputs(["y"])
            .build(Arc::new(Workspace::new()))
            .unwrap();
        function.call(vec![vector(&[1.0])]).unwrap();
        function.call(vec![vector(&[2.0])]).unwrap();
        function.call(vec![vector(&[1.0, 2.0])]).unwrap();
        assert_eq!(function.cached_plans(), 2);
        assert_eq!(function.plan_cache_stats(), (1, 2));
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let function = Function::builder(doubling_graph())
            .outputs(["y"])
            .build(Arc::new(Workspace::new()))
            .unwrap();
        let err = function.call(Vec::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn unknown_output_fails_at_build() {
        let err = Function::builder(doubling_graph())
            .outputs(["missing"])
            .build(Arc::new(Workspace::new()))
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnknownTensor { .. }));
    }

    #[test]
    fn outputs_and_updater_are_exclusive() {
        let err = Function::builder(doubling_graph())
            .outputs(["y"])
            .updater(Updater::new("Double").param("x"))
            .build(Arc::new(Workspace::new()))
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn namespaced_functions_share_a_workspace() {
        let workspace = Arc::new(Workspace::new());
        let left = Function::builder(doubling_graph())
            .outputs(["y"])
            .namespace("left")
            .build(Arc::clone(&workspace))
            .unwrap();
        let right = Function::builder(doubling_graph())
            .outputs(["y"])
            .namespace("right")
            .build(Arc::clone(&workspace))
            .unwrap();
        left.call(vec![vector(&[1.0])]).unwrap();
        right.call(vec![vector(&[3.0])]).unwrap();
        assert!(workspace.contains("left/y"));
        assert_eq!(workspace.fetch_value("left/y").unwrap().to_f32_vec().unwrap(), vec![2.0]);
        assert_eq!(workspace.fetch_value("right/y").unwrap().to_f32_vec().unwrap(), vec![6.0]);
    }
}
