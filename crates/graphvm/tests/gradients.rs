mod common;

use std::sync::Arc;

use anyhow::Result;
use graphvm::{
    gradient_name, EngineConfig, Error, Executor, ForwardContext, GradientRequest, Graph, OpConfig,
    OpSpec, Operator, ScheduleOptions, TensorMeta, Workspace,
};

use common::{f32s, f64s, plan_for, registry, vector, vector64};

#[test]
fn add_then_sum_produces_unit_gradients() -> Result<()> {
    let workspace = Workspace::new();
    let mut graph = Graph::in_workspace(&workspace, registry());
    graph.declare_input("A", true).declare_input("B", true);
    graph.add_node("Add", ["A", "B"], ["C"], OpConfig::new())?;
    graph.add_node("Sum", ["C"], ["L"], OpConfig::new())?;
    graph.mark_output("C").mark_output("L");
    let compiled =
        graph.compile_with_gradients(&GradientRequest::new(["L"]), &EngineConfig::default())?;

    workspace.feed("A", vector(&[1.0, 2.0]))?;
    workspace.feed("B", vector(&[3.0, 4.0]))?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    Executor::new(&workspace).run_with_gradients(&plan, &["L"])?;

    assert_eq!(f32s(&workspace, "C"), vec![4.0, 6.0]);
    assert_eq!(f32s(&workspace, "L"), vec![10.0]);
    assert_eq!(compiled.gradient_of("A"), Some("A_grad"));
    assert_eq!(f32s(&workspace, "A_grad"), vec![1.0, 1.0]);
    assert_eq!(f32s(&workspace, "B_grad"), vec![1.0, 1.0]);
    Ok(())
}

#[test]
fn shared_reads_are_accumulated_in_declaration_order() -> Result<()> {
    let workspace = Workspace::new();
    let mut graph = Graph::in_workspace(&workspace, registry());
    graph.declare_input("X", true);
    graph.add_node("Mul", ["X", "X"], ["Y"], OpConfig::new())?;
    graph.add_node("Add", ["Y", "X"], ["Z"], OpConfig::new())?;
    graph.add_node("Sum", ["Z"], ["L"], OpConfig::new())?;
    let compiled =
        graph.compile_with_gradients(&GradientRequest::new(["L"]), &EngineConfig::default())?;

    let accumulate = compiled
        .nodes()
        .iter()
        .find(|node| node.name() == "X_grad_sum")
        .expect("X is read three times");
    assert_eq!(accumulate.kind(), "GradientAccumulate");
    assert_eq!(accumulate.inputs(), ["X_grad_0", "X_grad_1", "X_grad_2"]);
    assert_eq!(accumulate.outputs(), [gradient_name("X")]);
    assert!(compiled
        .nodes()
        .iter()
        .all(|node| node.name() != "Y_grad_sum"));

    workspace.feed("X", vector(&[1.0, 2.0, 3.0]))?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    Executor::new(&workspace).run_with_gradients(&plan, &["L"])?;
    // d/dx (x^2 + x) = 2x + 1
    assert_eq!(f32s(&workspace, "X_grad"), vec![3.0, 5.0, 7.0]);
    Ok(())
}

/// Gradient of the shared input `T` when each `(other, alpha)` consumer computes
/// `alpha * (T + other)` and the consumers are summed into the loss.
fn shared_input_gradient(consumers: &[(&str, f64)]) -> Result<Vec<f32>> {
    let workspace = Workspace::new();
    let mut graph = Graph::in_workspace(&workspace, registry());
    graph.declare_input("T", true);
    workspace.feed("T", vector(&[0.5, -2.0]))?;
    let mut terms = Vec::new();
    for (index, (other, alpha)) in consumers.iter().enumerate() {
        graph.declare_input(*other, false);
        workspace.feed(other, vector(&[1.0 + index as f32, 3.0]))?;
        let sum = format!("sum_{index}");
        let term = format!("term_{index}");
        graph.add_node("Add", ["T", *other], [sum.as_str()], OpConfig::new())?;
        graph.add_node(
            "Scale",
            [sum.as_str()],
            [term.as_str()],
            OpConfig::new().with("alpha", *alpha),
        )?;
        terms.push(term);
    }
    let total = match terms.as_slice() {
        [single] => single.clone(),
        [first, second] => {
            graph.add_node("Add", [first, second], ["total"], OpConfig::new())?;
            "total".to_string()
        }
        _ => anyhow::bail!("expected one or two consumers"),
    };
    graph.add_node("Sum", [total.as_str()], ["L"], OpConfig::new())?;
    let compiled =
        graph.compile_with_gradients(&GradientRequest::new(["L"]), &EngineConfig::default())?;

    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    Executor::new(&workspace).run_with_gradients(&plan, &["L"])?;
    Ok(f32s(&workspace, "T_grad"))
}

#[test]
fn shared_input_gradient_is_the_sum_of_its_consumers() -> Result<()> {
    let alone_u = shared_input_gradient(&[("U", 3.0)])?;
    let alone_v = shared_input_gradient(&[("V", -0.5)])?;
    let both = shared_input_gradient(&[("U", 3.0), ("V", -0.5)])?;

    assert_eq!(alone_u, vec![3.0, 3.0]);
    assert_eq!(alone_v, vec![-0.5, -0.5]);
    let expected: Vec<f32> = alone_u.iter().zip(&alone_v).map(|(u, v)| u + v).collect();
    assert_eq!(both, expected);
    assert_eq!(both, vec![2.5, 2.5]);
    Ok(())
}

#[test]
fn matmul_gradient_matches_finite_differences() -> Result<()> {
    let workspace = Workspace::new();
    let mut graph = Graph::in_workspace(&workspace, registry());
    graph.declare_input("W", true).declare_input("X", false);
    graph.add_node("MatMul", ["W", "X"], ["Y"], OpConfig::new())?;
    graph.add_node("Mul", ["Y", "Y"], ["Y2"], OpConfig::new())?;
    graph.add_node("Sum", ["Y2"], ["L"], OpConfig::new())?;
    graph.mark_output("L");
    let compiled =
        graph.compile_with_gradients(&GradientRequest::new(["L"]), &EngineConfig::default())?;

    let w = vec![0.5, -1.0, 2.0, 0.25, 1.5, -0.75];
    let x = vec![1.0, 0.0, -2.0, 1.0, 0.5, 3.0];
    let feed = |w: &[f64]| -> graphvm::Result<()> {
        workspace.feed("W", graphvm::TensorValue::from_f64([2, 3], w.to_vec())?)?;
        workspace.feed("X", graphvm::TensorValue::from_f64([3, 2], x.clone())?)?;
        Ok(())
    };
    feed(&w)?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    let executor = Executor::new(&workspace);
    executor.run_with_gradients(&plan, &["L"])?;
    let analytic = f64s(&workspace, "W_grad");

    let eps = 1e-6;
    for index in 0..w.len() {
        let mut up = w.clone();
        up[index] += eps;
        feed(&up)?;
        executor.run(&plan)?;
        let high = f64s(&workspace, "L")[0];

        let mut down = w.clone();
        down[index] -= eps;
        feed(&down)?;
        executor.run(&plan)?;
        let low = f64s(&workspace, "L")[0];

        let numeric = (high - low) / (2.0 * eps);
        assert!(
            (numeric - analytic[index]).abs() < 1e-5,
            "W[{index}]: analytic {} vs numeric {numeric}",
            analytic[index]
        );
    }
    Ok(())
}

#[test]
fn disconnected_terminal_is_skipped_unless_strict() -> Result<()> {
    let build = || -> graphvm::Result<Graph> {
        let mut graph = Graph::new("disconnected", registry());
        graph.declare_input("A", true).declare_input("K", false);
        graph.add_node("Sum", ["A"], ["L"], OpConfig::new())?;
        graph.add_node("Sum", ["K"], ["M"], OpConfig::new())?;
        Ok(graph)
    };
    let request = GradientRequest::new(["L", "M"]);

    let compiled = build()?.compile_with_gradients(&request, &EngineConfig::default())?;
    assert_eq!(compiled.seeds().len(), 1);
    assert_eq!(compiled.seeds()[0].terminal, "L");

    let workspace = Workspace::new();
    workspace.feed("A", vector(&[2.0, 3.0]))?;
    workspace.feed("K", vector(&[5.0]))?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    Executor::new(&workspace).run_with_gradients(&plan, &["L", "M"])?;
    assert_eq!(f32s(&workspace, "A_grad"), vec![1.0, 1.0]);

    let strict = EngineConfig::default().with_strict_gradients(true);
    let err = build()?
        .compile_with_gradients(&request, &strict)
        .unwrap_err();
    assert!(matches!(err, Error::DisconnectedGraph { ref terminal } if terminal == "M"));
    Ok(())
}

#[test]
fn unreachable_target_gets_a_zero_gradient() -> Result<()> {
    let mut graph = Graph::new("unused", registry());
    graph.declare_input("A", true).declare_input("W", true);
    graph.add_node("Sum", ["A"], ["L"], OpConfig::new())?;
    let compiled =
        graph.compile_with_gradients(&GradientRequest::new(["L"]), &EngineConfig::default())?;
    assert!(compiled
        .nodes()
        .iter()
        .any(|node| node.name() == "W_grad_zeros" && node.kind() == "ZerosLike"));

    let workspace = Workspace::new();
    workspace.feed("A", vector(&[1.0]))?;
    workspace.feed("W", vector(&[4.0, 5.0, 6.0]))?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    Executor::new(&workspace).run_with_gradients(&plan, &["L"])?;
    assert_eq!(f32s(&workspace, "W_grad"), vec![0.0, 0.0, 0.0]);
    Ok(())
}

struct Opaque;

impl Operator for Opaque {
    fn kind(&self) -> &str {
        "Opaque"
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> graphvm::Result<Vec<TensorMeta>> {
        Ok(inputs.to_vec())
    }

    fn forward(&self, ctx: &mut ForwardContext<'_>) -> graphvm::Result<()> {
        let data = ctx.input(0)?.data().clone();
        ctx.set_output(0, data)
    }
}

#[test]
fn non_differentiable_kind_on_the_path_is_rejected() -> Result<()> {
    let registry = registry();
    registry.register("Opaque", |_: &OpSpec<'_>| {
        Ok(Arc::new(Opaque) as Arc<dyn Operator>)
    })?;
    let mut graph = Graph::new("opaque", registry);
    graph.declare_input("A", true);
    graph.add_node("Opaque", ["A"], ["B"], OpConfig::new())?;
    graph.add_node("Sum", ["B"], ["L"], OpConfig::new())?;
    let err = graph
        .compile_with_gradients(&GradientRequest::new(["L"]), &EngineConfig::default())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::NoGradientDefined { ref kind, ref node }
            if kind == "Opaque" && node == "Opaque_0"
    ));
    Ok(())
}

#[test]
fn discrete_branches_stop_gradient_flow() -> Result<()> {
    let mut graph = Graph::new("argmax", registry());
    graph.declare_input("A", true);
    graph.add_node("Mul", ["A", "A"], ["Y"], OpConfig::new())?;
    graph.add_node("ArgMax", ["Y"], ["I"], OpConfig::new())?;
    graph.add_node("Sum", ["Y"], ["L"], OpConfig::new())?;
    graph.mark_output("I");
    let compiled =
        graph.compile_with_gradients(&GradientRequest::new(["L"]), &EngineConfig::default())?;
    assert!(compiled
        .nodes()
        .iter()
        .all(|node| node.name() != "ArgMax_1_grad"));

    let workspace = Workspace::new();
    workspace.feed("A", vector(&[1.0, -3.0, 2.0]))?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    Executor::new(&workspace).run_with_gradients(&plan, &["L"])?;
    assert_eq!(
        workspace.fetch_value("I")?.to_f64_vec(),
        vec![1.0],
        "argmax of [1, 9, 4]"
    );
    assert_eq!(f32s(&workspace, "A_grad"), vec![2.0, -6.0, 4.0]);
    Ok(())
}

#[test]
fn unlisted_terminals_are_seeded_with_zero() -> Result<()> {
    let mut graph = Graph::new("two_losses", registry());
    graph.declare_input("A", true);
    graph.add_node("Sum", ["A"], ["L1"], OpConfig::new())?;
    graph.add_node("Mul", ["A", "A"], ["S"], OpConfig::new())?;
    graph.add_node("Sum", ["S"], ["L2"], OpConfig::new())?;
    let compiled = graph.compile_with_gradients(
        &GradientRequest::new(["L1", "L2"]),
        &EngineConfig::default(),
    )?;

    let workspace = Workspace::new();
    workspace.feed("A", vector64(&[3.0, 4.0]))?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    let executor = Executor::new(&workspace);

    executor.run_with_gradients(&plan, &["L1"])?;
    assert_eq!(f64s(&workspace, "A_grad"), vec![1.0, 1.0]);

    executor.run_with_gradients(&plan, &["L1", "L2"])?;
    assert_eq!(f64s(&workspace, "A_grad"), vec![7.0, 9.0]);

    let err = executor.run_with_gradients(&plan, &["S"]).unwrap_err();
    assert!(matches!(err, Error::NotATerminal { ref name } if name == "S"));
    Ok(())
}

#[test]
fn explicit_targets_may_include_intermediates() -> Result<()> {
    let mut graph = Graph::new("intermediate", registry());
    graph.declare_input("A", false);
    graph.add_node("Scale", ["A"], ["H"], OpConfig::new().with("alpha", 3.0))?;
    graph.add_node("Relu", ["H"], ["R"], OpConfig::new())?;
    graph.add_node("Sum", ["R"], ["L"], OpConfig::new())?;
    let request = GradientRequest::new(["L"]).with_respect_to(["H"]);
    let compiled = graph.compile_with_gradients(&request, &EngineConfig::default())?;
    assert!(compiled
        .nodes()
        .iter()
        .all(|node| node.name() != "Scale_0_grad"));

    let workspace = Workspace::new();
    workspace.feed("A", vector(&[1.0, -1.0]))?;
    let plan = plan_for(&workspace, &compiled, ScheduleOptions::default())?;
    Executor::new(&workspace).run_with_gradients(&plan, &["L"])?;
    assert_eq!(f32s(&workspace, "H_grad"), vec![1.0, 0.0]);
    Ok(())
}
