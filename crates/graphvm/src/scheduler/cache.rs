//! Plan caching keyed by a hashed specialisation signature.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde::Serialize;
use tracing::debug;

use super::{ExecutionPlan, InputSignature, ScheduleOptions};
use crate::error::Result;
use crate::graph::{CompiledGraph, GradientSeed, Invocation};
use crate::hashing::{fnv1a_hash, hash_serializable};
use crate::ops::{OpConfig, Phase};

/// Stable cache key built from the compiled graph structure and the input signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PlanKey {
    pub graph_hash: u64,
    pub signature_hash: u64,
    pub options_hash: u64,
    pub hash: u64,
}

/// Everything about a compiled graph that can change the plan or its results.
#[derive(Serialize)]
struct GraphSignatureData<'a> {
    name: &'a str,
    version: u64,
    nodes: Vec<GraphSignatureNode<'a>>,
    order: &'a [usize],
    forward_len: usize,
    inputs: &'a [String],
    seeds: &'a [GradientSeed],
    terminals: &'a [String],
    gradients: &'a BTreeMap<String, String>,
    retained: &'a BTreeSet<String>,
    phase: Phase,
}

#[derive(Serialize)]
struct GraphSignatureNode<'a> {
    name: &'a str,
    kind: &'a str,
    inputs: &'a [String],
    outputs: &'a [String],
    config: &'a OpConfig,
    invocation: &'a Invocation,
    gradient: bool,
}

impl<'a> GraphSignatureData<'a> {
    fn from_graph(graph: &'a CompiledGraph) -> Self {
        GraphSignatureData {
            name: &graph.name,
            version: graph.version,
            nodes: graph
                .nodes
                .iter()
                .map(|node| GraphSignatureNode {
                    name: &node.name,
                    kind: &node.kind,
                    inputs: &node.inputs,
                    outputs: &node.outputs,
                    config: &node.config,
                    invocation: &node.invocation,
                    gradient: node.gradient,
                })
                .collect(),
            order: &graph.order,
            forward_len: graph.forward_len,
            inputs: &graph.inputs,
            seeds: &graph.seeds,
            terminals: &graph.terminals,
            gradients: &graph.gradients,
            retained: &graph.retained,
            phase: graph.phase,
        }
    }
}

#[derive(Serialize)]
struct OptionBits {
    debug_mode: bool,
    isolate_gradients: bool,
}

impl PlanKey {
    pub fn new(
        graph: &CompiledGraph,
        inputs: &InputSignature,
        options: ScheduleOptions,
    ) -> Result<Self> {
        let graph_hash = hash_serializable(&GraphSignatureData::from_graph(graph))?;
        let signature_hash = hash_serializable(inputs)?;
        let options_hash = hash_serializable(&OptionBits {
            debug_mode: options.debug_mode,
            isolate_gradients: options.isolate_gradients,
        })?;
        let mut combined = [0u8; 24];
        combined[..8].copy_from_slice(&graph_hash.to_le_bytes());
        combined[8..16].copy_from_slice(&signature_hash.to_le_bytes());
        combined[16..].copy_from_slice(&options_hash.to_le_bytes());
        Ok(PlanKey {
            graph_hash,
            signature_hash,
            options_hash,
            hash: fnv1a_hash(&combined),
        })
    }
}

/// LRU cache of scheduled plans.
pub struct PlanCache {
    entries: LruCache<PlanKey, Arc<ExecutionPlan>>,
    hits: u64,
    misses: u64,
}

impl PlanCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        PlanCache {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, key: &PlanKey) -> Option<Arc<ExecutionPlan>> {
        let plan = self.entries.get(key).cloned();
        if plan.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        plan
    }

    pub fn insert(&mut self, key: PlanKey, plan: Arc<ExecutionPlan>) {
        if let Some((evicted, _)) = self.entries.push(key, plan) {
            if evicted != key {
                debug!(hash = evicted.hash, "evicted execution plan");
            }
        }
    }

    /// Returns the cached plan for `inputs`, scheduling and caching it on a miss.
    pub fn get_or_schedule(
        &mut self,
        graph: &Arc<CompiledGraph>,
        inputs: &InputSignature,
        options: ScheduleOptions,
    ) -> Result<Arc<ExecutionPlan>> {
        let key = PlanKey::new(graph, inputs, options)?;
        if let Some(plan) = self.get(&key) {
            return Ok(plan);
        }
        debug!(graph = %graph.name, hash = key.hash, "plan cache miss");
        let plan = Arc::new(ExecutionPlan::new(Arc::clone(graph), inputs, options)?);
        self.insert(key, Arc::clone(&plan));
        Ok(plan)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::gradient::GradientRequest;
    use crate::graph::Graph;
    use crate::ops::{BackwardContext, ForwardContext, OpSpec, Operator, OperatorRegistry};
    use crate::tensor::{DType, TensorMeta};

    struct Same(&'static str);

    impl Operator for Same {
        fn kind(&self) -> &str {
            self.0
        }

        fn infer_outputs(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>> {
            Ok(inputs.to_vec())
        }

        fn forward(&self, _ctx: &mut ForwardContext<'_>) -> Result<()> {
            Ok(())
        }

        fn differentiable(&self) -> bool {
            true
        }

        fn backward(&self, _ctx: &mut BackwardContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> Arc<OperatorRegistry> {
        let registry = OperatorRegistry::new();
        registry
            .register("Same", |_: &OpSpec<'_>| {
                Ok(Arc::new(Same("Same")) as Arc<dyn Operator>)
            })
            .unwrap();
        registry
            .register("Other", |_: &OpSpec<'_>| {
                Ok(Arc::new(Same("Other")) as Arc<dyn Operator>)
            })
            .unwrap();
        Arc::new(registry)
    }

    fn single(kind: &str, config: OpConfig) -> Arc<CompiledGraph> {
        let mut graph = Graph::new("cached", registry());
        graph.declare_input("x", false);
        graph.add_node(kind, ["x"], ["y"], config).unwrap();
        graph.compile().unwrap()
    }

    fn compiled() -> Arc<CompiledGraph> {
        single("Same", OpConfig::new())
    }

    fn signature(len: usize) -> InputSignature {
        InputSignature::from([("x".to_string(), TensorMeta::host([len], DType::F32))])
    }

    #[test]
    fn same_signature_hits_and_new_shape_misses() {
        let graph = compiled();
        let mut cache = PlanCache::new(4);
        let first = cache
            .get_or_schedule(&graph, &signature(3), ScheduleOptions::default())
            .unwrap();
        let again = cache
            .get_or_schedule(&graph, &signature(3), ScheduleOptions::default())
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        cache
            .get_or_schedule(&graph, &signature(5), ScheduleOptions::default())
            .unwrap();
        assert_eq!((cache.hits(), cache.misses(), cache.len()), (1, 2, 2));
    }

    #[test]
    fn capacity_bounds_the_cache() {
        let graph = compiled();
        let mut cache = PlanCache::new(1);
        for len in 1..4 {
            cache
                .get_or_schedule(&graph, &signature(len), ScheduleOptions::default())
                .unwrap();
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn key_is_stable_across_calls() {
        let graph = compiled();
        let a = PlanKey::new(&graph, &signature(2), ScheduleOptions::default()).unwrap();
        let b = PlanKey::new(&graph, &signature(2), ScheduleOptions::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn lookalike_graphs_do_not_share_plans() {
        let same = compiled();
        let other = single("Other", OpConfig::new());
        let configured = single("Same", OpConfig::new().with("alpha", 2.0));
        assert_eq!(same.name, other.name);
        assert_eq!(same.nodes.len(), other.nodes.len());

        let mut cache = PlanCache::new(4);
        let mut plans = Vec::new();
        for graph in [&same, &other, &configured] {
            plans.push(
                cache
                    .get_or_schedule(graph, &signature(3), ScheduleOptions::default())
                    .unwrap(),
            );
        }
        assert_eq!((cache.hits(), cache.misses(), cache.len()), (0, 3, 3));
        assert!(Arc::ptr_eq(plans[1].graph(), &other));
        assert!(Arc::ptr_eq(plans[2].graph(), &configured));
    }

    #[test]
    fn gradient_targets_are_part_of_the_key() {
        let build = |wrt: &str| {
            let mut graph = Graph::new("cached", registry());
            graph.declare_input("a", true);
            graph.declare_input("b", true);
            graph.add_node("Same", ["a"], ["p"], OpConfig::new()).unwrap();
            graph.add_node("Same", ["b"], ["q"], OpConfig::new()).unwrap();
            let request = GradientRequest::new(["p", "q"]).with_respect_to([wrt]);
            graph
                .compile_with_gradients(&request, &EngineConfig::default())
                .unwrap()
        };
        let wrt_a = build("a");
        let wrt_b = build("b");
        assert_eq!(wrt_a.nodes.len(), wrt_b.nodes.len());

        let signature = InputSignature::from([
            ("a".to_string(), TensorMeta::host([2], DType::F32)),
            ("b".to_string(), TensorMeta::host([2], DType::F32)),
        ]);
        let options = ScheduleOptions::default();
        let key_a = PlanKey::new(&wrt_a, &signature, options).unwrap();
        let key_b = PlanKey::new(&wrt_b, &signature, options).unwrap();
        assert_ne!(key_a.graph_hash, key_b.graph_hash);
        assert_ne!(key_a, key_b);
    }
}
