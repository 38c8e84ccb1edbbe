//! Generation-checked handles into workspace buffers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use super::{Device, Shape, TensorData, TensorMeta, TensorValue};
use crate::error::{Error, Result};

/// Index of a physical buffer inside a [`Workspace`](crate::Workspace) arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) usize);

impl BufferId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Physical buffer: storage plus the generation of its current binding.
///
/// Every bind and every return to the reuse pool bumps the generation, so a [`Tensor`] taken
/// from an earlier binding can detect that it no longer owns the contents.
pub(crate) struct BufferCell {
    generation: AtomicU64,
    data: RwLock<TensorData>,
}

impl BufferCell {
    pub(crate) fn new(data: TensorData) -> Self {
        BufferCell {
            generation: AtomicU64::new(0),
            data: RwLock::new(data),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn bump(&self) -> u64 {
        self.generation.fetch_add(1, AtomicOrdering::AcqRel) + 1
    }

    pub(crate) fn replace(&self, data: TensorData) {
        let mut guard = self.data.write().expect("buffer lock poisoned");
        *guard = data;
    }

    pub(crate) fn with_data_mut<R>(&self, f: impl FnOnce(&mut TensorData) -> R) -> R {
        let mut guard = self.data.write().expect("buffer lock poisoned");
        f(&mut guard)
    }
}

/// A named tensor bound in the workspace.
///
/// The handle borrows the workspace-owned buffer; it never owns the contents independently.
/// Reads and writes fail with [`Error::StaleTensor`] once the name has been released or rebound.
#[derive(Clone)]
pub struct Tensor {
    name: Arc<str>,
    meta: TensorMeta,
    buffer: BufferId,
    generation: u64,
    cell: Arc<BufferCell>,
}

impl Tensor {
    pub(crate) fn new(
        name: Arc<str>,
        meta: TensorMeta,
        buffer: BufferId,
        generation: u64,
        cell: Arc<BufferCell>,
    ) -> Self {
        Tensor {
            name,
            meta,
            buffer,
            generation,
            cell,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    pub fn shape(&self) -> &Shape {
        &self.meta.shape
    }

    pub fn dtype(&self) -> super::DType {
        self.meta.dtype
    }

    pub fn device(&self) -> Device {
        self.meta.device
    }

    /// Physical buffer currently backing this tensor.
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// Whether this handle still refers to the live binding.
    pub fn is_live(&self) -> bool {
        self.cell.generation() == self.generation
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(Error::StaleTensor {
                name: self.name.to_string(),
            })
        }
    }

    /// Acquires shared access to the contents.
    pub fn read(&self) -> Result<RwLockReadGuard<'_, TensorData>> {
        let guard = self.cell.data.read().expect("buffer lock poisoned");
        self.ensure_live()?;
        Ok(guard)
    }

    /// Copies the contents out as an owned value.
    pub fn to_value(&self) -> Result<TensorValue> {
        let data = self.read()?.clone();
        TensorValue::new(self.meta.clone(), data)
    }

    /// Replaces the contents; the value must match this tensor's metadata exactly.
    pub fn write(&self, value: TensorValue) -> Result<()> {
        if value.meta() != &self.meta {
            return Err(Error::shape_mismatch(
                self.name.to_string(),
                &self.meta,
                value.meta(),
            ));
        }
        let mut guard = self.cell.data.write().expect("buffer lock poisoned");
        self.ensure_live()?;
        *guard = value.into_data();
        Ok(())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("name", &self.name)
            .field("meta", &self.meta)
            .field("buffer", &self.buffer)
            .field("generation", &self.generation)
            .finish()
    }
}
