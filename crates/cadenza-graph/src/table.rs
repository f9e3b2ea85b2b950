//! The processor table: a fixed-capacity slab of node slots with an
//! occupancy bitmap and per-slot routing masks.
//!
//! The occupancy bit is the publication point between the control thread
//! and the RT thread. The control thread fills a slot and then sets its
//! bit (release); the RT thread loads the bit (acquire) before touching
//! the slot. Removal clears the bit immediately but defers dropping the
//! node by one full RT cycle, so a traversal that observed the bit just
//! before it cleared can finish the callback on a still-valid box.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use cadenza_core::bitset::AtomicBitSet;
use cadenza_core::node::AudioProcessor;
use cadenza_core::{ProcessorId, MAX_PROCESSORS};

use crate::error::{NodeError, RouteError};

struct Slot {
    node: UnsafeCell<Option<Box<dyn AudioProcessor>>>,
    input: AtomicBitSet,
    output: AtomicBitSet,
    uses_on_cycle: AtomicBool,
}

// SAFETY: access to `node` is governed by the occupancy protocol described
// in the module docs; the masks and flags are atomics.
unsafe impl Sync for Slot {}
unsafe impl Send for Slot {}

/// A removed slot awaiting reclamation. The node box stays in the slot
/// until the RT cycle counter has advanced past `removed_at_cycle`.
///
/// Whether an RT thread was running is recorded here, at removal time:
/// that is the only moment a traversal could have picked up the slot, so
/// later callers need not (and must not) re-derive it.
struct Retired {
    id: ProcessorId,
    removed_at_cycle: u64,
    rt_active_at_removal: bool,
}

pub(crate) struct ProcessorTable {
    slots: Box<[Slot]>,
    occupancy: AtomicBitSet,
    /// Incremented by the RT thread at the end of every full callback.
    cycle: AtomicU64,
    /// Control-thread-only bookkeeping of slots pending reclamation.
    retired: Mutex<Vec<Retired>>,
}

impl ProcessorTable {
    pub fn new() -> Self {
        let slots = (0..MAX_PROCESSORS)
            .map(|_| Slot {
                node: UnsafeCell::new(None),
                input: AtomicBitSet::new(),
                output: AtomicBitSet::new(),
                uses_on_cycle: AtomicBool::new(false),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            occupancy: AtomicBitSet::new(),
            cycle: AtomicU64::new(0),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Insert a node into the lowest free slot and return its ID.
    pub fn insert(&self, node: Box<dyn AudioProcessor>) -> Result<ProcessorId, NodeError> {
        let mut retired = self.retired.lock().unwrap();
        self.reclaim(&mut retired);

        // A retired slot's occupancy bit is already clear, but the slot
        // cannot be reused until its old box has been reclaimed.
        let id = (0..MAX_PROCESSORS)
            .find(|&bit| !self.occupancy.get(bit) && !retired.iter().any(|r| r.id as usize == bit))
            .ok_or(NodeError::TableFull {
                capacity: MAX_PROCESSORS,
            })?;

        let slot = &self.slots[id];
        let info = node.info();

        slot.input.clear_all();
        slot.output.clear_all();
        slot.uses_on_cycle
            .store(info.uses_on_cycle, Ordering::Release);
        // SAFETY: the slot is unoccupied and reclaimed, so neither the RT
        // thread nor a worker can be touching it.
        unsafe {
            *slot.node.get() = Some(node);
        }

        // Publish. From the next acquire load of the occupancy bitmap the
        // RT thread may traverse this slot.
        self.occupancy.set(id);

        Ok(id as ProcessorId)
    }

    /// Remove a node: unpublish its slot, sweep every peer mask bit that
    /// references it, and schedule the box for reclamation.
    ///
    /// `rt_active` states whether an RT thread may be traversing the
    /// table right now; it determines how long the box must outlive the
    /// slot.
    pub fn remove(&self, id: ProcessorId, rt_active: bool) -> Result<(), NodeError> {
        let index = id as usize;
        if index >= MAX_PROCESSORS || !self.occupancy.get(index) {
            return Err(NodeError::DeadSlot(id));
        }

        self.occupancy.clear(index);

        // Sweep stale edges so no traversal can reach the dead slot.
        let slot = &self.slots[index];
        for peer in slot.input.iter_ones() {
            self.slots[peer].output.clear(index);
        }
        for peer in slot.output.iter_ones() {
            self.slots[peer].input.clear(index);
        }
        slot.input.clear_all();
        slot.output.clear_all();

        let mut retired = self.retired.lock().unwrap();
        retired.push(Retired {
            id,
            removed_at_cycle: self.cycle.load(Ordering::Acquire),
            rt_active_at_removal: rt_active,
        });
        self.reclaim(&mut retired);

        Ok(())
    }

    /// Drop the boxes of retired slots the RT thread can no longer reach:
    /// either no RT thread was running when the slot was retired, or at
    /// least one full callback has completed since its occupancy bit was
    /// cleared.
    fn reclaim(&self, retired: &mut Vec<Retired>) {
        let cycle = self.cycle.load(Ordering::Acquire);

        retired.retain(|r| {
            if r.rt_active_at_removal && cycle <= r.removed_at_cycle {
                return true;
            }

            // SAFETY: the occupancy bit has been clear for a full cycle
            // (or the RT thread is not running), so nothing dereferences
            // this slot anymore.
            unsafe {
                *self.slots[r.id as usize].node.get() = None;
            }
            false
        });
    }

    /// Set or clear the directed edge `src -> dst`.
    ///
    /// Enabling an edge validates that the graph stays a DAG.
    pub fn route(&self, src: ProcessorId, dst: ProcessorId, enable: bool) -> Result<(), RouteError> {
        if (src as usize) >= MAX_PROCESSORS || !self.occupancy.get(src as usize) {
            return Err(RouteError::DeadSource(src));
        }
        if (dst as usize) >= MAX_PROCESSORS || !self.occupancy.get(dst as usize) {
            return Err(RouteError::DeadDestination(dst));
        }
        if src == dst {
            return Err(RouteError::SelfLoop(src));
        }

        if enable {
            if self.reaches(dst, src) {
                return Err(RouteError::WouldCycle { src, dst });
            }

            // The pair of mask updates is two independent atomic writes;
            // the RT traversal only reads `output` and tolerates seeing
            // one half a cycle before the other.
            self.slots[src as usize].output.set(dst as usize);
            self.slots[dst as usize].input.set(src as usize);
        } else {
            self.slots[src as usize].output.clear(dst as usize);
            self.slots[dst as usize].input.clear(src as usize);
        }

        Ok(())
    }

    /// Whether `to` is reachable from `from` along output edges.
    fn reaches(&self, from: ProcessorId, to: ProcessorId) -> bool {
        let mut visited = [0u64; MAX_PROCESSORS / 64];
        let mut stack = vec![from];

        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            let (word, bit) = (id as usize / 64, id as usize % 64);
            if visited[word] & (1 << bit) != 0 {
                continue;
            }
            visited[word] |= 1 << bit;

            for child in self.slots[id as usize].output.iter_ones() {
                stack.push(child as ProcessorId);
            }
        }

        false
    }

    #[inline]
    pub fn is_live(&self, id: usize) -> bool {
        id < MAX_PROCESSORS && self.occupancy.get(id)
    }

    pub fn output_mask(&self, id: ProcessorId) -> &AtomicBitSet {
        &self.slots[id as usize].output
    }

    pub fn input_mask(&self, id: ProcessorId) -> &AtomicBitSet {
        &self.slots[id as usize].input
    }

    pub fn uses_on_cycle(&self, id: ProcessorId) -> bool {
        self.slots[id as usize].uses_on_cycle.load(Ordering::Acquire)
    }

    /// Iterate the IDs of all live slots in ascending order.
    pub fn live_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.occupancy.iter_ones()
    }

    pub fn count(&self) -> usize {
        self.occupancy.count_ones()
    }

    /// Mutable access to a live slot's node.
    ///
    /// # Safety
    ///
    /// Only the RT thread may call this, and only for an `id` whose
    /// occupancy bit it observed set during the current callback. The
    /// returned reference must not outlive the callback.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn node_mut(&self, id: ProcessorId) -> Option<&mut (dyn AudioProcessor + 'static)> {
        (*self.slots[id as usize].node.get())
            .as_mut()
            .map(|boxed| boxed.as_mut())
    }

    /// Mark the end of one full RT callback.
    pub fn end_cycle(&self) {
        self.cycle.fetch_add(1, Ordering::Release);
    }

    pub fn current_cycle(&self) -> u64 {
        self.cycle.load(Ordering::Acquire)
    }

    /// Drop every node in the table, live or retired.
    ///
    /// Must only be called when no RT thread is running; this is the
    /// engine deinit path, where each remaining node is destroyed exactly
    /// once.
    pub fn clear_all(&self) {
        let mut retired = self.retired.lock().unwrap();
        retired.clear();

        for slot in self.slots.iter() {
            // SAFETY: no RT thread is running (caller contract).
            unsafe {
                *slot.node.get() = None;
            }
            slot.input.clear_all();
            slot.output.clear_all();
        }
        self.occupancy.clear_all();
    }
}
