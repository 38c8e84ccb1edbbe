mod common;

use std::sync::Arc;
use std::thread;

use anyhow::Result;
use graphvm::{
    CancelToken, EngineConfig, Error, Executor, ForwardContext, GradientRequest, Graph, OpConfig,
    OpSpec, Operator, ScheduleOptions, TensorMeta, Workspace,
};

use common::{f32s, plan_for, registry, vector};

struct Explode;

impl Operator for Explode {
    fn kind(&self) -> &str {
        "Explode"
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> graphvm::Result<Vec<TensorMeta>> {
        Ok(inputs.to_vec())
    }

    fn forward(&self, _ctx: &mut ForwardContext<'_>) -> graphvm::Result<()> {
        Err(Error::kernel("device fault"))
    }
}

/// Passes its input through and trips the cancel token it was built with.
struct Trip(CancelToken);

impl Operator for Trip {
    fn kind(&self) -> &str {
        "Trip"
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> graphvm::Result<Vec<TensorMeta>> {
        Ok(inputs.to_vec())
    }

    fn forward(&self, ctx: &mut ForwardContext<'_>) -> graphvm::Result<()> {
        let data = ctx.input(0)?.data().clone();
        self.0.cancel();
        ctx.set_output(0, data)
    }
}

fn relu_chain(name: &str, length: usize) -> Result<Graph> {
    let mut graph = Graph::new(name, registry());
    graph.declare_input("x", false);
    let mut previous = "x".to_string();
    for step in 0..length {
        let next = format!("h{step}");
        graph.add_node("Relu", [previous.as_str()], [next.as_str()], OpConfig::new())?;
        previous = next;
    }
    graph.mark_output(previous);
    Ok(graph)
}

#[test]
fn failing_node_is_named_and_leaves_no_output() -> Result<()> {
    let registry = registry();
    registry.register("Explode", |_: &OpSpec<'_>| {
        Ok(Arc::new(Explode) as Arc<dyn Operator>)
    })?;
    let mut graph = Graph::new("faulty", registry);
    graph.declare_input("x", false);
    graph.add_node("Relu", ["x"], ["y"], OpConfig::new())?;
    graph.add_node("Explode", ["y"], ["z"], OpConfig::new())?;
    graph.mark_output("z");
    let compiled = graph.compile()?;

    let workspace = Workspace::new();
    workspace.feed("x", vector(&[1.0, -1.0]))?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    let err = Executor::new(&workspace).run(&plan).unwrap_err();
    assert!(matches!(
        err,
        Error::NodeFailed { ref node, ref kind, .. }
            if node == "Explode_1" && kind == "Explode"
    ));
    assert!(matches!(err.root(), Error::Kernel { .. }));
    assert!(!workspace.contains("z"));
    Ok(())
}

#[test]
fn rebinding_an_input_with_another_shape_fails_at_its_reader() -> Result<()> {
    let compiled = relu_chain("reshaped_input", 2)?.compile()?;
    let workspace = Workspace::new();
    workspace.feed("x", vector(&[1.0, 2.0, 3.0]))?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;

    workspace.feed("x", vector(&[1.0, 2.0, 3.0, 4.0]))?;
    let err = Executor::new(&workspace).run(&plan).unwrap_err();
    assert!(matches!(err, Error::NodeFailed { ref node, .. } if node == "Relu_0"));
    assert!(matches!(err.root(), Error::ShapeMismatch { .. }));
    Ok(())
}

#[test]
fn missing_input_fails_scheduling() -> Result<()> {
    let compiled = relu_chain("unbound", 1)?.compile()?;
    let workspace = Workspace::new();
    let err = plan_for(&workspace, &compiled, ScheduleOptions::default()).unwrap_err();
    assert!(matches!(err, Error::UnknownTensor { ref name } if name == "x"));
    Ok(())
}

#[test]
fn cancellation_stops_at_the_next_node_boundary() -> Result<()> {
    let token = CancelToken::new();
    let registry = registry();
    let trip_token = token.clone();
    registry.register("Trip", move |_: &OpSpec<'_>| {
        Ok(Arc::new(Trip(trip_token.clone())) as Arc<dyn Operator>)
    })?;
    let mut graph = Graph::new("cancelled", registry);
    graph.declare_input("x", false);
    graph.add_node("Trip", ["x"], ["y"], OpConfig::new())?;
    graph.add_node("Relu", ["y"], ["z"], OpConfig::new())?;
    graph.mark_output("z");
    let compiled = graph.compile()?;

    let workspace = Workspace::new();
    workspace.feed("x", vector(&[1.0]))?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    let executor = Executor::new(&workspace).with_cancel_token(token.clone());
    let err = executor.run(&plan).unwrap_err();
    assert!(matches!(err, Error::Cancelled { completed: 1 }));
    assert!(token.is_cancelled());
    assert!(!workspace.contains("z"));
    Ok(())
}

#[test]
fn namespaced_executors_share_one_workspace_across_threads() -> Result<()> {
    let compiled = relu_chain("shared", 3)?.compile()?;
    let workspace = Workspace::new();
    let probe = Executor::new(&workspace).with_namespace("probe");
    probe.feed("x", vector(&[0.0, 0.0]))?;
    let plan = {
        let signature = probe.signature(&compiled)?;
        graphvm::ExecutionPlan::new(Arc::clone(&compiled), &signature, ScheduleOptions::default())?
    };

    thread::scope(|scope| {
        for worker in 0..4 {
            let workspace = &workspace;
            let plan = &plan;
            scope.spawn(move || {
                let executor = Executor::new(workspace).with_namespace(format!("worker{worker}"));
                let value = worker as f32;
                executor
                    .feed("x", vector(&[value, -value]))
                    .expect("feed");
                executor.run(plan).expect("run");
            });
        }
    });

    for worker in 0..4 {
        let value = worker as f32;
        assert_eq!(
            f32s(&workspace, &format!("worker{worker}/h2")),
            vec![value, 0.0]
        );
        assert!(!workspace.contains(&format!("worker{worker}/h0")));
    }
    Ok(())
}

#[test]
fn debug_mode_keeps_every_intermediate() -> Result<()> {
    let compiled = relu_chain("debugged", 3)?.compile()?;
    let workspace = Workspace::new();
    workspace.feed("x", vector(&[-1.0, 2.0]))?;

    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    Executor::new(&workspace).run(&plan)?;
    assert!(!workspace.contains("h0"));
    assert!(!workspace.contains("h1"));
    assert!(workspace.contains("h2"));

    let options = ScheduleOptions::from(&EngineConfig::default().with_debug_mode(true));
    let plan = plan_for(&workspace, &compiled, options)?;
    assert_eq!(plan.slot_count(), 3);
    Executor::new(&workspace).run(&plan)?;
    assert_eq!(f32s(&workspace, "h0"), vec![0.0, 2.0]);
    assert_eq!(f32s(&workspace, "h1"), vec![0.0, 2.0]);
    Ok(())
}

#[test]
fn in_place_chain_allocates_a_single_buffer() -> Result<()> {
    let compiled = relu_chain("in_place", 4)?.compile()?;
    let workspace = Workspace::new();
    workspace.feed("x", vector(&[-2.0, 5.0]))?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    assert_eq!(plan.slot_count(), 1);

    let report = Executor::new(&workspace).run(&plan)?;
    assert_eq!(report.steps, 4);
    assert_eq!(report.fresh_buffers, 1);
    assert_eq!(f32s(&workspace, "h3"), vec![0.0, 5.0]);
    Ok(())
}

#[test]
fn isolated_gradients_never_share_slots() -> Result<()> {
    let mut graph = Graph::new("isolated", registry());
    graph.declare_input("A", true);
    graph.add_node("Mul", ["A", "A"], ["B"], OpConfig::new())?;
    graph.add_node("Scale", ["B"], ["C"], OpConfig::new().with("alpha", 0.5))?;
    graph.add_node("Sum", ["C"], ["L"], OpConfig::new())?;
    let config = EngineConfig::default().with_share_grads(false);
    let compiled = graph.compile_with_gradients(&GradientRequest::new(["L"]), &config)?;

    let workspace = Workspace::new();
    workspace.feed("A", vector(&[1.0, 2.0, 3.0]))?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::from(&config))?;

    let mut owners: Vec<(usize, bool)> = Vec::new();
    for step in plan.steps() {
        let gradient = compiled.nodes()[step.node].is_gradient();
        for output in &step.outputs {
            owners.push((output.slot, gradient));
        }
    }
    for (slot, _) in owners.iter().filter(|(_, gradient)| *gradient) {
        let sharers = owners.iter().filter(|(other, _)| other == slot).count();
        assert_eq!(sharers, 1, "gradient slot {slot} is shared");
    }

    Executor::new(&workspace).run_with_gradients(&plan, &["L"])?;
    assert_eq!(f32s(&workspace, "A_grad"), vec![1.0, 2.0, 3.0]);
    // Isolated gradients stay bound after the run.
    assert!(workspace.contains("B_grad"));
    Ok(())
}

#[test]
fn stale_handles_do_not_observe_reused_buffers() -> Result<()> {
    let compiled = relu_chain("stale", 1)?.compile()?;
    let workspace = Workspace::new();
    workspace.feed("x", vector(&[1.0, 2.0]))?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    let executor = Executor::new(&workspace);
    executor.run(&plan)?;
    let first = workspace.fetch("h0")?;
    assert_eq!(first.to_value()?.to_f32_vec(), Some(vec![1.0, 2.0]));

    workspace.feed("x", vector(&[3.0, 4.0]))?;
    executor.run(&plan)?;
    assert!(matches!(first.read().unwrap_err(), Error::StaleTensor { .. }));
    assert_eq!(f32s(&workspace, "h0"), vec![3.0, 4.0]);
    Ok(())
}

#[test]
fn recycled_buffers_never_leak_earlier_contents() -> Result<()> {
    let sentinel = 1.0e9_f32;
    let workspace = Workspace::new();

    let mut noisy = Graph::new("noisy", registry());
    noisy.declare_input("x", false);
    noisy.add_node("Scale", ["x"], ["big"], OpConfig::new().with("alpha", sentinel))?;
    noisy.add_node("Sum", ["big"], ["total"], OpConfig::new())?;
    noisy.mark_output("total");
    let compiled = noisy.compile()?;
    workspace.feed("x", vector(&[1.0, 1.0, 1.0, 1.0]))?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    Executor::new(&workspace).run(&plan)?;
    assert!(workspace.stats().pooled_buffers > 0);

    let mut quiet = Graph::new("quiet", registry());
    quiet.add_node(
        "Fill",
        Vec::<String>::new(),
        ["zeros"],
        OpConfig::new()
            .with("shape", vec![4usize])
            .with("value", 0.0),
    )?;
    quiet.add_node("Relu", ["zeros"], ["out"], OpConfig::new())?;
    quiet.mark_output("out");
    let compiled = quiet.compile()?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    let report = Executor::new(&workspace).run(&plan)?;
    assert!(report.reused_buffers > 0);
    assert_eq!(f32s(&workspace, "out"), vec![0.0; 4]);
    Ok(())
}
