#![allow(dead_code)]

use std::sync::Arc;

use graphvm::{
    CompiledGraph, ExecutionPlan, Executor, OperatorRegistry, ScheduleOptions, TensorValue,
    Workspace,
};

pub fn registry() -> Arc<OperatorRegistry> {
    graphvm_ops_ref_cpu::registry().expect("reference kernels register into a fresh registry")
}

pub fn vector(values: &[f32]) -> TensorValue {
    TensorValue::from_f32([values.len()], values.to_vec()).expect("valid f32 vector")
}

pub fn vector64(values: &[f64]) -> TensorValue {
    TensorValue::from_f64([values.len()], values.to_vec()).expect("valid f64 vector")
}

/// Schedules `compiled` for whatever its inputs are currently bound to in `workspace`.
pub fn plan_for(
    workspace: &Workspace,
    compiled: &Arc<CompiledGraph>,
    options: ScheduleOptions,
) -> graphvm::Result<ExecutionPlan> {
    let signature = Executor::new(workspace).signature(compiled)?;
    ExecutionPlan::new(Arc::clone(compiled), &signature, options)
}

pub fn f32s(workspace: &Workspace, name: &str) -> Vec<f32> {
    workspace
        .fetch_value(name)
        .unwrap_or_else(|err| panic!("fetch {name}: {err}"))
        .to_f32_vec()
        .unwrap_or_else(|| panic!("{name} is not f32"))
}

pub fn f64s(workspace: &Workspace, name: &str) -> Vec<f64> {
    workspace
        .fetch_value(name)
        .unwrap_or_else(|err| panic!("fetch {name}: {err}"))
        .to_f64_vec()
}
