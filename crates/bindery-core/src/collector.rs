//! Cycle collector for the host heap.
//!
//! Reference counting is the primary mechanism; this collector is the backup
//! for reference cycles, including cycles that run through keep-alive edges.
//!
//! ## Algorithm (trial deletion)
//!
//! 1. Snapshot: every live, mortal object is a candidate.
//! 2. Count internal references: for each candidate, count how many of its
//!    references come from other candidates (container items, attributes,
//!    bound-method parts, keep-alive patients).
//! 3. Mark roots: a candidate whose reference count exceeds its internal count
//!    is referenced from outside the heap (native code, a cleanup list, a
//!    caller's handle) and is live.
//! 4. Propagate liveness along references from the roots.
//! 5. Break cycles: unmarked candidates are garbage. All their outgoing
//!    references are detached first; container references are released
//!    before keep-alive patients, and payloads are dropped last, so a nurse
//!    is finalized before what it keeps alive wherever the cycle allows.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::heap::{Handle, HostHeap};
use crate::keep_alive::Patient;

/// Statistics from the cycle collector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStatistics {
    /// Number of completed collections
    pub collections: u64,
    /// Mortal objects examined by the last collection
    pub current_size: u32,
    /// Total objects freed as a consequence of collections
    pub total_destroyed: u64,
    /// Objects found unreachable inside reference cycles
    pub total_detected_as_garbage: u64,
}

/// Trial-deletion cycle collector.
#[derive(Debug, Default)]
pub struct CycleCollector {
    stats: CollectorStatistics,
}

impl CycleCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get statistics
    pub fn statistics(&self) -> CollectorStatistics {
        self.stats
    }

    /// All outgoing references of an object, one entry per held reference.
    fn references(heap: &HostHeap, handle: Handle) -> Vec<Handle> {
        let mut refs = heap.get(handle).map(|o| o.references()).unwrap_or_default();
        refs.extend(heap.keep_alive_graph().patients(handle));
        refs
    }

    /// Run a full collection. Returns the number of garbage objects found.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn collect(&mut self, heap: &mut HostHeap) -> u32 {
        heap.reset_allocation_counter();

        // Step 1: candidates
        let candidates: Vec<Handle> = heap
            .live_handles()
            .filter(|handle| !heap.is_immortal(*handle))
            .collect();
        let candidate_set: FxHashSet<Handle> = candidates.iter().copied().collect();

        // Step 2: internal reference counts
        let mut internal: FxHashMap<Handle, u32> = FxHashMap::default();
        let mut edges: FxHashMap<Handle, Vec<Handle>> = FxHashMap::default();
        for &handle in &candidates {
            let refs = Self::references(heap, handle);
            for target in &refs {
                if candidate_set.contains(target) {
                    *internal.entry(*target).or_default() += 1;
                }
            }
            edges.insert(handle, refs);
        }

        // Step 3: roots
        let mut live: FxHashSet<Handle> = FxHashSet::default();
        let mut work_queue: VecDeque<Handle> = VecDeque::new();
        for &handle in &candidates {
            let ref_count = heap.ref_count(handle).unwrap_or(0);
            let internal_count = internal.get(&handle).copied().unwrap_or(0);
            if ref_count > internal_count {
                live.insert(handle);
                work_queue.push_back(handle);
            }
        }

        // Step 4: propagate
        while let Some(handle) = work_queue.pop_front() {
            for target in edges.get(&handle).into_iter().flatten() {
                if candidate_set.contains(target) && live.insert(*target) {
                    work_queue.push_back(*target);
                }
            }
        }

        // Step 5: break cycles
        let garbage: Vec<Handle> = candidates
            .iter()
            .copied()
            .filter(|handle| !live.contains(handle))
            .collect();

        let freed_before = heap.statistics().total_freed;
        if !garbage.is_empty() {
            Self::break_cycles(heap, &garbage);
        }
        let destroyed = heap.statistics().total_freed - freed_before;

        self.stats.collections += 1;
        self.stats.current_size = candidates.len() as u32;
        self.stats.total_destroyed += destroyed;
        self.stats.total_detected_as_garbage += garbage.len() as u64;

        tracing::debug!(
            candidates = candidates.len(),
            garbage = garbage.len(),
            destroyed,
            "cycle collection finished"
        );
        garbage.len() as u32
    }

    fn break_cycles(heap: &mut HostHeap, garbage: &[Handle]) {
        let mut container_refs = Vec::new();
        let mut patient_refs = Vec::new();
        let mut payloads = Vec::new();

        for &handle in garbage {
            if let Some(object) = heap.get_mut(handle) {
                container_refs.extend(object.take_references());
            }
            for patient in heap.keep_alive_graph_mut().detach(handle) {
                match patient {
                    Patient::Object(patient) => patient_refs.push(patient),
                    Patient::Payload(payload) => payloads.push(payload),
                }
            }
        }

        heap.release_all(container_refs);
        heap.release_all(patient_refs);
        drop(payloads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::HostObject;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn acyclic_garbage_is_left_to_refcounting() {
        let mut heap = HostHeap::new();
        let a = heap.allocate(HostObject::Int(1));
        let list = heap.new_list(vec![a]);

        let mut gc = CycleCollector::new();
        assert_eq!(gc.collect(&mut heap), 0);
        assert!(heap.is_live(list));
        assert!(heap.is_live(a));
    }

    #[test]
    fn self_referencing_list_is_collected() {
        let mut heap = HostHeap::new();
        let list = heap.new_list(Vec::new());
        heap.add_ref(list);
        heap.list_push(list, list).unwrap();
        heap.release(list);
        assert!(heap.is_live(list));

        let mut gc = CycleCollector::new();
        assert_eq!(gc.collect(&mut heap), 1);
        assert!(!heap.is_live(list));
        assert_eq!(gc.statistics().total_destroyed, 1);
    }

    #[test]
    fn externally_referenced_cycle_survives() {
        let mut heap = HostHeap::new();
        let a = heap.new_list(Vec::new());
        let b = heap.new_list(Vec::new());
        heap.add_ref(a);
        heap.add_ref(b);
        heap.list_push(a, b).unwrap();
        heap.list_push(b, a).unwrap();
        // keep our reference to `a`, drop the one to `b`
        heap.release(b);

        let mut gc = CycleCollector::new();
        assert_eq!(gc.collect(&mut heap), 0);
        assert!(heap.is_live(a));
        assert!(heap.is_live(b));

        heap.release(a);
        assert_eq!(gc.collect(&mut heap), 2);
        assert!(!heap.is_live(a));
        assert!(!heap.is_live(b));
    }

    #[test]
    fn keep_alive_cycle_is_collected() {
        let mut heap = HostHeap::new();
        let a = heap.allocate(HostObject::Int(1));
        let b = heap.allocate(HostObject::Int(2));
        heap.keep_alive(a, b);
        heap.keep_alive(b, a);
        heap.release(a);
        heap.release(b);
        assert!(heap.is_live(a) && heap.is_live(b));

        let mut gc = CycleCollector::new();
        assert_eq!(gc.collect(&mut heap), 2);
        assert!(!heap.is_live(a));
        assert!(!heap.is_live(b));
        assert_eq!(heap.keep_alive_graph().nurse_count(), 0);
    }

    #[test]
    fn payload_of_garbage_nurse_is_dropped() {
        let mut heap = HostHeap::new();
        let list = heap.new_list(Vec::new());
        heap.add_ref(list);
        heap.list_push(list, list).unwrap();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        heap.keep_alive_finalizer(list, move || flag.set(true));
        heap.release(list);

        CycleCollector::new().collect(&mut heap);
        assert!(fired.get());
    }

    #[test]
    fn reachable_from_live_root_is_kept() {
        let mut heap = HostHeap::new();
        let root = heap.new_list(Vec::new());
        let cycle = heap.new_list(Vec::new());
        heap.add_ref(cycle);
        heap.list_push(cycle, cycle).unwrap();
        // root holds our remaining reference to the cycle
        heap.list_push(root, cycle).unwrap();

        let mut gc = CycleCollector::new();
        assert_eq!(gc.collect(&mut heap), 0);
        assert!(heap.is_live(cycle));
    }

    #[test]
    fn collection_resets_allocation_counter() {
        let mut heap = HostHeap::new();
        heap.allocate(HostObject::Int(1));
        assert_eq!(heap.allocations_since_collect(), 1);
        CycleCollector::new().collect(&mut heap);
        assert_eq!(heap.allocations_since_collect(), 0);
    }
}
