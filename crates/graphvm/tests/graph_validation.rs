mod common;

use std::sync::Arc;

use anyhow::Result;
use graphvm::{
    Error, ForwardContext, Graph, OpConfig, OpSpec, Operator, OperatorRegistry, TensorMeta,
    Workspace,
};

use common::registry;

#[test]
fn cycle_is_reported_with_its_members() -> Result<()> {
    let mut graph = Graph::new("cyclic", registry());
    graph.add_node("Relu", ["x"], ["y"], OpConfig::new())?;
    graph.add_node("Relu", ["y"], ["x"], OpConfig::new())?;
    let err = graph.compile().unwrap_err();
    match err {
        Error::CyclicGraph { cycle } => {
            assert_eq!(cycle.len(), 3, "closed cycle repeats its first node: {cycle:?}");
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.iter().any(|name| name == "Relu_0"));
            assert!(cycle.iter().any(|name| name == "Relu_1"));
        }
        other => panic!("expected a cycle, got {other}"),
    }
    Ok(())
}

#[test]
fn unknown_reads_are_dangling() -> Result<()> {
    let mut graph = Graph::new("dangling", registry());
    graph.declare_input("x", false);
    graph.add_node("Add", ["x", "ghost"], ["y"], OpConfig::new())?;
    let err = graph.compile().unwrap_err();
    assert!(matches!(
        err,
        Error::DanglingInput { ref node, ref tensor } if node == "Add_0" && tensor == "ghost"
    ));
    assert!(err.is_structural());
    Ok(())
}

#[test]
fn second_writer_of_a_tensor_is_rejected() -> Result<()> {
    let mut graph = Graph::new("double_write", registry());
    graph.declare_input("x", false);
    graph.add_node("Relu", ["x"], ["y"], OpConfig::new())?;
    graph.add_node("Scale", ["x"], ["y"], OpConfig::new().with("alpha", 2.0))?;
    let err = graph.compile().unwrap_err();
    assert!(matches!(err, Error::MultipleProducers { ref tensor, .. } if tensor == "y"));
    Ok(())
}

#[test]
fn unknown_kind_fails_when_the_node_is_added() {
    let mut graph = Graph::new("unknown", registry());
    let err = graph
        .add_node("Softmax", ["x"], ["y"], OpConfig::new())
        .unwrap_err();
    assert!(matches!(err, Error::UnknownKind { ref kind } if kind == "Softmax"));
    assert!(graph.nodes().is_empty());
}

struct Impostor;

impl Operator for Impostor {
    fn kind(&self) -> &str {
        "Impostor"
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> graphvm::Result<Vec<TensorMeta>> {
        Ok(inputs.to_vec())
    }

    fn forward(&self, _ctx: &mut ForwardContext<'_>) -> graphvm::Result<()> {
        Ok(())
    }
}

#[test]
fn duplicate_registration_keeps_the_first_factory() -> Result<()> {
    let registry = OperatorRegistry::new();
    graphvm_ops_ref_cpu::register_all(&registry)?;
    let err = registry
        .register("Add", |_: &OpSpec<'_>| {
            Ok(Arc::new(Impostor) as Arc<dyn Operator>)
        })
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateKind { ref kind } if kind == "Add"));

    let op = registry.create(
        "Add",
        &["a".to_string(), "b".to_string()],
        &["c".to_string()],
        &OpConfig::new(),
    )?;
    assert_eq!(op.kind(), "Add");
    Ok(())
}

#[test]
fn factories_validate_configuration() {
    let mut graph = Graph::new("config", registry());
    let err = graph
        .add_node("Dropout", ["x"], ["y"], OpConfig::new().with("prob", 1.5))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { ref kind, .. } if kind == "Dropout"));

    let err = graph
        .add_node("Add", ["x"], ["y"], OpConfig::new())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));
}

#[test]
fn independent_nodes_run_in_declaration_order() -> Result<()> {
    let mut graph = Graph::new("ties", registry());
    graph.declare_input("x", false);
    graph.add_node("Relu", ["x"], ["a"], OpConfig::new())?;
    graph.add_node("Relu", ["x"], ["b"], OpConfig::new())?;
    graph.add_node("Relu", ["x"], ["c"], OpConfig::new())?;
    let compiled = graph.compile()?;
    assert_eq!(compiled.node_names(), vec!["Relu_0", "Relu_1", "Relu_2"]);
    Ok(())
}

#[test]
fn consumers_declared_first_still_run_after_producers() -> Result<()> {
    let mut graph = Graph::new("out_of_order", registry());
    graph.declare_input("x", false);
    graph.add_named_node("consume", "Relu", ["t"], ["y"], OpConfig::new())?;
    graph.add_named_node("produce", "Relu", ["x"], ["t"], OpConfig::new())?;
    graph.add_named_node("side", "Relu", ["x"], ["s"], OpConfig::new())?;
    let compiled = graph.compile()?;
    assert_eq!(compiled.node_names(), vec!["produce", "consume", "side"]);
    Ok(())
}

#[test]
fn workspace_names_graphs_sequentially() {
    let workspace = Workspace::new();
    let first = Graph::in_workspace(&workspace, registry());
    let second = Graph::in_workspace(&workspace, registry());
    assert_eq!(first.name(), "Graph_0");
    assert_eq!(second.name(), "Graph_1");
}

#[test]
fn editing_a_graph_invalidates_its_compilation() -> Result<()> {
    let mut graph = Graph::new("edits", registry());
    graph.declare_input("x", false);
    graph.add_node("Relu", ["x"], ["y"], OpConfig::new())?;
    let first = graph.compile()?;
    assert!(Arc::ptr_eq(&first, &graph.compile()?));

    graph.add_node("Relu", ["y"], ["z"], OpConfig::new())?;
    let second = graph.compile()?;
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.version() > first.version());
    assert_eq!(second.nodes().len(), 2);
    Ok(())
}
