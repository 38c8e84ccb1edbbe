//! Physical buffer arena with a (device, byte size) keyed reuse pool.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::tensor::{BufferCell, BufferId, Device, TensorData, TensorMeta};

type PoolKey = (Device, usize);

pub(super) struct BufferEntry {
    pub(super) device: Device,
    pub(super) byte_len: usize,
    /// Bindings currently holding the buffer.
    pub(super) refs: usize,
    pub(super) cell: Arc<BufferCell>,
}

/// Counters describing allocator behaviour since the workspace was created or reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub fresh: u64,
    pub reused: u64,
    pub trimmed: u64,
}

pub(super) struct BufferArena {
    next_id: usize,
    entries: HashMap<BufferId, BufferEntry>,
    pool: HashMap<PoolKey, Vec<BufferId>>,
    resident: HashMap<Device, u64>,
    budgets: HashMap<Device, u64>,
    pub(super) stats: AllocationStats,
}

impl BufferArena {
    pub(super) fn new(budgets: HashMap<Device, u64>) -> Self {
        BufferArena {
            next_id: 0,
            entries: HashMap::new(),
            pool: HashMap::new(),
            resident: HashMap::new(),
            budgets,
            stats: AllocationStats::default(),
        }
    }

    pub(super) fn entry(&self, id: BufferId) -> Option<&BufferEntry> {
        self.entries.get(&id)
    }

    /// Hands out a zeroed buffer for `meta` with no holders; callers retain it immediately.
    pub(super) fn acquire(&mut self, meta: &TensorMeta, byte_len: usize) -> Result<BufferId> {
        let key = (meta.device, byte_len);
        if let Some(id) = self.pool.get_mut(&key).and_then(Vec::pop) {
            if let Some(entry) = self.entries.get(&id) {
                // Pooled contents belong to a released tensor and must never leak.
                entry
                    .cell
                    .replace(TensorData::zeros(meta.dtype, meta.num_elements()));
                self.stats.reused += 1;
                return Ok(id);
            }
        }

        self.reserve(meta.device, byte_len as u64)?;
        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            BufferEntry {
                device: meta.device,
                byte_len,
                refs: 0,
                cell: Arc::new(BufferCell::new(TensorData::zeros(
                    meta.dtype,
                    meta.num_elements(),
                ))),
            },
        );
        self.stats.fresh += 1;
        Ok(id)
    }

    /// Takes `id` back out of the reuse pool, zeroed, if it is still pooled with a matching
    /// signature. Fails softly when another holder picked it up in the meantime.
    pub(super) fn reclaim(&mut self, id: BufferId, meta: &TensorMeta, byte_len: usize) -> bool {
        let key = (meta.device, byte_len);
        let Some(pooled) = self.pool.get_mut(&key) else {
            return false;
        };
        let Some(position) = pooled.iter().position(|candidate| *candidate == id) else {
            return false;
        };
        pooled.remove(position);
        if let Some(entry) = self.entries.get(&id) {
            entry
                .cell
                .replace(TensorData::zeros(meta.dtype, meta.num_elements()));
        }
        self.stats.reused += 1;
        true
    }

    /// Whether `id` is currently held and matches the requested signature.
    pub(super) fn is_held(&self, id: BufferId, meta: &TensorMeta, byte_len: usize) -> bool {
        self.entries
            .get(&id)
            .map(|entry| {
                entry.refs > 0 && entry.device == meta.device && entry.byte_len == byte_len
            })
            .unwrap_or(false)
    }

    fn reserve(&mut self, device: Device, requested: u64) -> Result<()> {
        let Some(budget) = self.budgets.get(&device).copied() else {
            *self.resident.entry(device).or_default() += requested;
            return Ok(());
        };
        if self.resident_bytes(device) + requested > budget {
            self.trim(device);
        }
        let resident = self.resident_bytes(device);
        if resident + requested > budget {
            return Err(Error::OutOfMemory {
                device,
                requested,
                available: budget.saturating_sub(resident),
            });
        }
        *self.resident.entry(device).or_default() += requested;
        Ok(())
    }

    pub(super) fn retain(&mut self, id: BufferId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.refs += 1;
        }
    }

    /// Drops one holder; the last holder returns the buffer to the reuse pool.
    pub(super) fn release(&mut self, id: BufferId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            entry.cell.bump();
            self.pool
                .entry((entry.device, entry.byte_len))
                .or_default()
                .push(id);
        }
    }

    /// Frees every pooled buffer on `device`, returning the reclaimed byte count.
    pub(super) fn trim(&mut self, device: Device) -> u64 {
        let mut freed = 0u64;
        let keys: Vec<PoolKey> = self
            .pool
            .keys()
            .filter(|(pool_device, _)| *pool_device == device)
            .copied()
            .collect();
        for key in keys {
            for id in self.pool.remove(&key).unwrap_or_default() {
                if let Some(entry) = self.entries.remove(&id) {
                    freed += entry.byte_len as u64;
                    self.stats.trimmed += 1;
                }
            }
        }
        if let Some(resident) = self.resident.get_mut(&device) {
            *resident = resident.saturating_sub(freed);
        }
        freed
    }

    pub(super) fn resident_bytes(&self, device: Device) -> u64 {
        self.resident.get(&device).copied().unwrap_or(0)
    }

    pub(super) fn live_buffers(&self) -> usize {
        self.entries.values().filter(|entry| entry.refs > 0).count()
    }

    pub(super) fn pooled_buffers(&self) -> usize {
        self.pool.values().map(Vec::len).sum()
    }

    pub(super) fn clear(&mut self) {
        for entry in self.entries.values() {
            entry.cell.bump();
        }
        self.entries.clear();
        self.pool.clear();
        self.resident.clear();
        self.stats = AllocationStats::default();
    }
}
