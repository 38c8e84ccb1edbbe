//! Static computation-graph execution engine.
//!
//! A [`Graph`] of operator nodes connected by named tensors is compiled once, specialised per
//! input signature into an [`ExecutionPlan`] that reuses buffers between tensors whose live
//! ranges do not overlap, and replayed by an [`Executor`] against a shared [`Workspace`].
//! Reverse-mode gradients are synthesised as ordinary backward nodes appended to the graph.

pub mod config;
mod env;
pub mod error;
pub mod executor;
pub mod function;
pub mod gradient;
pub mod graph;
pub mod hashing;
pub mod ops;
pub mod scheduler;
pub mod tensor;
pub mod timing;
pub mod update;
pub mod workspace;

pub use config::{DeviceBudget, EngineConfig};
pub use error::{Error, Result};
pub use executor::{compile_graph, run, run_with_gradients, CancelToken, Executor, RunReport};
pub use function::{Function, FunctionBuilder};
pub use gradient::{gradient_name, GradientRequest};
pub use graph::{CompiledGraph, Graph, Node};
pub use ops::{
    BackwardContext, ConfigValue, ForwardContext, OpConfig, OpSpec, Operator, OperatorRegistry,
    Phase, TensorView,
};
pub use scheduler::{ExecutionPlan, InputSignature, PlanCache, ScheduleOptions};
pub use tensor::{DType, Device, Shape, Tensor, TensorData, TensorMeta, TensorValue};
pub use update::{history_name, UpdateTarget, Updater};
pub use workspace::{TensorSnapshot, Workspace, WorkspaceStats};
