//! Session-wide registry owning every tensor binding and the physical buffer pool.
//!
//! All binding and pool mutation goes through a single mutex, so several executors may
//! allocate concurrently. Tensor contents live behind per-buffer locks, which lets kernels
//! compute in parallel once their buffers are bound.
//!
//! ```text
//! name ──> Binding { meta, buffer, generation } ──> BufferArena entry ──> BufferCell
//!                                                        │
//!                                      refs == 0 ──> pool[(device, byte_len)]
//! ```

mod arena;
mod snapshot;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::tensor::{BufferId, DType, Device, Shape, Tensor, TensorData, TensorMeta, TensorValue};

pub use arena::AllocationStats;
pub use snapshot::TensorSnapshot;

use arena::BufferArena;

struct Binding {
    name: Arc<str>,
    meta: TensorMeta,
    buffer: BufferId,
    generation: u64,
}

struct WorkspaceInner {
    arena: BufferArena,
    bindings: HashMap<String, Binding>,
    persistent: BTreeSet<String>,
}

/// Point-in-time view of workspace occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceStats {
    pub bound_tensors: usize,
    pub live_buffers: usize,
    pub pooled_buffers: usize,
    pub allocations: AllocationStats,
}

/// Owner of all tensors and intermediate buffers for a session.
pub struct Workspace {
    inner: Mutex<WorkspaceInner>,
    graph_counter: AtomicUsize,
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Workspace {
    /// Creates an empty workspace without device budgets.
    pub fn new() -> Self {
        Self::with_config(&EngineConfig::default())
    }

    /// Creates a workspace enforcing the device budgets from `config`.
    pub fn with_config(config: &EngineConfig) -> Self {
        Workspace {
            inner: Mutex::new(WorkspaceInner {
                arena: BufferArena::new(config.budgets()),
                bindings: HashMap::new(),
                persistent: BTreeSet::new(),
            }),
            graph_counter: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkspaceInner> {
        self.inner.lock().expect("workspace poisoned")
    }

    /// Hands out sequential graph names (`Graph_0`, `Graph_1`, ...).
    pub fn next_graph_name(&self) -> String {
        let index = self.graph_counter.fetch_add(1, AtomicOrdering::Relaxed);
        format!("Graph_{index}")
    }

    /// Creates or resizes the buffer bound to `name`.
    ///
    /// A binding whose byte size and device already match is reshaped in place and keeps its
    /// contents (reinterpreted on the host when the dtype changes). Any other request binds a
    /// zeroed buffer, drawn from the reuse pool when one with the same signature is free.
    pub fn allocate(
        &self,
        name: &str,
        shape: impl Into<Shape>,
        dtype: DType,
        device: Device,
    ) -> Result<Tensor> {
        let meta = TensorMeta::new(shape, dtype, device);
        let mut inner = self.lock();
        inner.allocate(name, meta)
    }

    /// Binds `value` under `name`, allocating as needed.
    pub fn feed(&self, name: &str, value: TensorValue) -> Result<Tensor> {
        let tensor = {
            let mut inner = self.lock();
            inner.allocate(name, value.meta().clone())?
        };
        tensor.write(value)?;
        Ok(tensor)
    }

    /// Looks up the live binding for `name`.
    pub fn fetch(&self, name: &str) -> Result<Tensor> {
        let inner = self.lock();
        inner.tensor(name)
    }

    /// Copies the contents of `name` out of the workspace.
    pub fn fetch_value(&self, name: &str) -> Result<TensorValue> {
        self.fetch(name)?.to_value()
    }

    pub fn meta(&self, name: &str) -> Result<TensorMeta> {
        let inner = self.lock();
        inner
            .bindings
            .get(name)
            .map(|binding| binding.meta.clone())
            .ok_or_else(|| Error::unknown_tensor(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().bindings.contains_key(name)
    }

    /// Bound tensor names in sorted order.
    pub fn tensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().bindings.keys().cloned().collect();
        names.sort();
        names
    }

    /// Unbinds `name`; its buffer returns to the pool once no holder remains.
    pub fn release(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.unbind(name)
    }

    /// Marks a bound tensor for checkpointing.
    pub fn mark_persistent(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        if !inner.bindings.contains_key(name) {
            return Err(Error::unknown_tensor(name));
        }
        inner.persistent.insert(name.to_string());
        Ok(())
    }

    pub fn is_persistent(&self, name: &str) -> bool {
        self.lock().persistent.contains(name)
    }

    /// Names marked persistent that are currently bound.
    pub fn persistent_names(&self) -> Vec<String> {
        let inner = self.lock();
        inner
            .persistent
            .iter()
            .filter(|name| inner.bindings.contains_key(name.as_str()))
            .cloned()
            .collect()
    }

    /// Captures name, shape, dtype, and raw bytes of a bound tensor.
    pub fn snapshot(&self, name: &str) -> Result<TensorSnapshot> {
        let tensor = self.fetch(name)?;
        let data = tensor.read()?;
        Ok(TensorSnapshot {
            name: name.to_string(),
            shape: tensor.shape().clone(),
            dtype: tensor.dtype(),
            bytes: data.as_bytes().to_vec(),
        })
    }

    /// Binds the snapshot contents on `device` under the snapshot's name.
    pub fn restore(&self, snapshot: &TensorSnapshot, device: Device) -> Result<Tensor> {
        let data = TensorData::from_bytes(snapshot.dtype, &snapshot.bytes)?;
        let meta = TensorMeta::new(snapshot.shape.clone(), snapshot.dtype, device);
        let value = TensorValue::new(meta, data)
            .map_err(|_| Error::shape_mismatch(&snapshot.name, &snapshot.shape, "snapshot bytes"))?;
        self.feed(&snapshot.name, value)
    }

    /// Drops every binding and pooled buffer. Outstanding handles become stale.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.bindings.clear();
        inner.persistent.clear();
        inner.arena.clear();
    }

    pub fn stats(&self) -> WorkspaceStats {
        let inner = self.lock();
        WorkspaceStats {
            bound_tensors: inner.bindings.len(),
            live_buffers: inner.arena.live_buffers(),
            pooled_buffers: inner.arena.pooled_buffers(),
            allocations: inner.arena.stats,
        }
    }

    pub fn resident_bytes(&self, device: Device) -> u64 {
        self.lock().arena.resident_bytes(device)
    }

    /// Binds an executor output under `name`.
    ///
    /// `preferred` is the buffer the plan's slot held last: a buffer still bound to the dying
    /// input of an in-place node is shared directly, a pooled one is reclaimed, and anything else
    /// falls back to the pool or a fresh allocation.
    pub(crate) fn bind_output(
        &self,
        name: &str,
        meta: TensorMeta,
        preferred: Option<Preferred>,
    ) -> Result<Tensor> {
        let mut inner = self.lock();
        let byte_len = byte_len_of(&meta)?;
        if inner.bindings.contains_key(name) {
            inner.unbind(name)?;
        }
        let reused = match preferred {
            Some(Preferred::InPlace(id)) => inner.arena.is_held(id, &meta, byte_len).then_some(id),
            Some(Preferred::Slot(id)) => inner.arena.reclaim(id, &meta, byte_len).then_some(id),
            None => None,
        };
        let buffer = match reused {
            Some(id) => id,
            None => inner.arena.acquire(&meta, byte_len)?,
        };
        inner.bind_new(name, buffer, meta)
    }
}

/// Buffer an executor would like an output to land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Preferred {
    /// Currently bound to an input whose last use is the producing node.
    InPlace(BufferId),
    /// Previously held by the same plan slot and expected back in the pool.
    Slot(BufferId),
}

fn byte_len_of(meta: &TensorMeta) -> Result<usize> {
    meta.byte_len().ok_or(Error::OutOfMemory {
        device: meta.device,
        requested: u64::MAX,
        available: 0,
    })
}

impl WorkspaceInner {
    fn tensor(&self, name: &str) -> Result<Tensor> {
        let binding = self
            .bindings
            .get(name)
            .ok_or_else(|| Error::unknown_tensor(name))?;
        let entry = self
            .arena
            .entry(binding.buffer)
            .ok_or_else(|| Error::unknown_tensor(name))?;
        Ok(Tensor::new(
            Arc::clone(&binding.name),
            binding.meta.clone(),
            binding.buffer,
            binding.generation,
            Arc::clone(&entry.cell),
        ))
    }

    fn allocate(&mut self, name: &str, meta: TensorMeta) -> Result<Tensor> {
        let byte_len = byte_len_of(&meta)?;
        if let Some(binding) = self.bindings.get(name) {
            let existing = &binding.meta;
            if existing.dtype != meta.dtype && !existing.device.allows_reinterpret() {
                return Err(Error::shape_mismatch(name, existing, &meta));
            }
            let buffer = binding.buffer;
            let reusable = self
                .arena
                .entry(buffer)
                .map(|entry| entry.device == meta.device && entry.byte_len == byte_len)
                .unwrap_or(false);
            if reusable {
                return self.resize_in_place(name, buffer, meta);
            }
            self.unbind(name)?;
        }
        let buffer = self.arena.acquire(&meta, byte_len)?;
        self.bind_new(name, buffer, meta)
    }

    fn resize_in_place(
        &mut self,
        name: &str,
        buffer: BufferId,
        meta: TensorMeta,
    ) -> Result<Tensor> {
        let entry = self
            .arena
            .entry(buffer)
            .ok_or_else(|| Error::unknown_tensor(name))?;
        let cell = Arc::clone(&entry.cell);
        let target = meta.dtype;
        cell.with_data_mut(|data| -> Result<()> {
            if data.dtype() != target {
                *data = TensorData::from_bytes(target, data.as_bytes())?;
            }
            Ok(())
        })?;
        let generation = cell.bump();
        let binding = self
            .bindings
            .get_mut(name)
            .ok_or_else(|| Error::unknown_tensor(name))?;
        binding.meta = meta;
        binding.generation = generation;
        self.tensor(name)
    }

    fn bind_new(&mut self, name: &str, buffer: BufferId, meta: TensorMeta) -> Result<Tensor> {
        self.arena.retain(buffer);
        let generation = self
            .arena
            .entry(buffer)
            .map(|entry| entry.cell.bump())
            .ok_or_else(|| Error::unknown_tensor(name))?;
        self.bindings.insert(
            name.to_string(),
            Binding {
                name: Arc::from(name),
                meta,
                buffer,
                generation,
            },
        );
        self.tensor(name)
    }

    fn unbind(&mut self, name: &str) -> Result<()> {
        let binding = self
            .bindings
            .remove(name)
            .ok_or_else(|| Error::unknown_tensor(name))?;
        if let Some(entry) = self.arena.entry(binding.buffer) {
            // A newer binding may already own this buffer (in-place reuse); leave it valid.
            if entry.cell.generation() == binding.generation {
                entry.cell.bump();
            }
        }
        self.arena.release(binding.buffer);
        Ok(())
    }
}
