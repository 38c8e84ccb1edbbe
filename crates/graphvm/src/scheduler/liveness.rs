//! Live ranges and greedy slot assignment.
//!
//! Positions are plan step indices. A tensor is live from the step that produces it through
//! the step that last reads it; tensors that must survive the run end at [`LiveRange::OPEN`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::tensor::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub start: usize,
    pub end: usize,
}

impl LiveRange {
    pub const OPEN: usize = usize::MAX;

    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn is_open(&self) -> bool {
        self.end == Self::OPEN
    }

    pub fn contains(&self, position: usize) -> bool {
        self.start <= position && position <= self.end
    }
}

/// Physical buffer class: outputs may only share a slot of the same class.
pub(crate) type SlotKey = (Device, usize);

/// One output as seen by the slot allocator.
pub(crate) struct SlotRequest<'a> {
    pub(crate) tensor: &'a str,
    pub(crate) key: SlotKey,
    /// May take a free slot.
    pub(crate) shares: bool,
    /// Dying input whose slot this output may take over in place.
    pub(crate) in_place_of: Option<&'a str>,
}

/// Slots handed out for a step's outputs, and whether each was taken over in place.
pub(crate) struct StepSlots {
    pub(crate) slots: Vec<usize>,
    pub(crate) in_place: Vec<bool>,
}

/// Greedy allocator over slots keyed by (device, byte length).
///
/// Always hands out the lowest-numbered free slot so plans are reproducible.
#[derive(Default)]
pub(crate) struct SlotAllocator {
    keys: Vec<SlotKey>,
    free: BTreeMap<SlotKey, BTreeSet<usize>>,
    owner: HashMap<usize, String>,
    assigned: HashMap<String, usize>,
}

impl SlotAllocator {
    pub(crate) fn slot_count(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn slot_of(&self, tensor: &str) -> Option<usize> {
        self.assigned.get(tensor).copied()
    }

    pub(crate) fn assign(&mut self, requests: &[SlotRequest<'_>]) -> StepSlots {
        let mut slots = Vec::with_capacity(requests.len());
        let mut in_place = Vec::with_capacity(requests.len());
        for request in requests {
            let inherited = request.in_place_of.and_then(|input| {
                let slot = self.slot_of(input)?;
                let owned = self.owner.get(&slot).map(String::as_str) == Some(input);
                (owned && self.keys[slot] == request.key).then_some(slot)
            });
            let slot = match inherited {
                Some(slot) => slot,
                None => self.take(request),
            };
            self.owner.insert(slot, request.tensor.to_string());
            self.assigned.insert(request.tensor.to_string(), slot);
            slots.push(slot);
            in_place.push(inherited.is_some());
        }
        StepSlots { slots, in_place }
    }

    fn take(&mut self, request: &SlotRequest<'_>) -> usize {
        if request.shares {
            if let Some(free) = self.free.get_mut(&request.key) {
                if let Some(slot) = free.pop_first() {
                    return slot;
                }
            }
        }
        let slot = self.keys.len();
        self.keys.push(request.key);
        slot
    }

    /// Returns the slot of a dead tensor to the free list, unless another tensor took it over.
    pub(crate) fn free(&mut self, tensor: &str) {
        let Some(slot) = self.slot_of(tensor) else {
            return;
        };
        if self.owner.get(&slot).map(String::as_str) != Some(tensor) {
            return;
        }
        self.owner.remove(&slot);
        self.free.entry(self.keys[slot]).or_default().insert(slot);
    }
}

/// Maximum number of ranges covering any single position.
pub(crate) fn max_overlap<'a>(
    ranges: impl IntoIterator<Item = &'a LiveRange>,
    steps: usize,
) -> usize {
    let mut delta = vec![0isize; steps + 1];
    for range in ranges {
        if range.start >= steps {
            continue;
        }
        let end = range.end.min(steps - 1);
        delta[range.start] += 1;
        delta[end + 1] -= 1;
    }
    let mut live = 0isize;
    let mut peak = 0isize;
    for change in delta.iter().take(steps) {
        live += change;
        peak = peak.max(live);
    }
    peak as usize
}
