//! Generational, reference-counted host object heap.
//!
//! This is the host runtime every bridge component talks to. Objects live in
//! slots addressed by [`Handle`]; a freed slot is reused with a bumped
//! generation so stale handles are detected instead of aliasing new objects.
//!
//! ## Reference Counting
//!
//! `allocate` returns a handle owning one reference. `add_ref` and `release`
//! adjust the count; when it reaches zero the object is freed:
//!
//! 1. The object's own finalizer runs (native destructor for host-owned
//!    instances, `Drop` for capsules).
//! 2. References it held (container items, attributes, bound-method parts)
//!    are released.
//! 3. Its keep-alive patients are released, payloads dropped last.
//!
//! Freeing cascades iteratively, never recursively. Reference cycles are
//! reclaimed by the [`CycleCollector`](crate::CycleCollector).

use std::fmt;
use std::ptr::NonNull;

use crate::error::BridgeError;
use crate::keep_alive::{KeepAliveGraph, Patient};
use crate::object::HostObject;

/// Reference to an object in the [`HostHeap`].
///
/// Handles are plain copyable indices. Reference counts are managed
/// explicitly through the heap; the generation detects use-after-free.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    /// Index into the heap's slots
    pub index: u32,
    /// Generation for use-after-free detection
    pub generation: u32,
}

impl Handle {
    /// Handle that never refers to a live object.
    pub const NULL: Handle = Handle {
        index: u32::MAX,
        generation: u32::MAX,
    };

    /// Create a new handle.
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Check if this is the null handle.
    pub fn is_null(&self) -> bool {
        *self == Handle::NULL
    }
}

/// Counters maintained by the heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStatistics {
    /// Objects currently alive (immortals included).
    pub live_objects: u32,
    /// Objects allocated since creation.
    pub total_allocated: u64,
    /// Objects freed since creation.
    pub total_freed: u64,
}

struct HeapSlot {
    generation: u32,
    object: Option<HostObject>,
    ref_count: u32,
    immortal: bool,
}

/// Host object storage with reference counting and keep-alive edges.
pub struct HostHeap {
    slots: Vec<HeapSlot>,
    free_list: Vec<u32>,
    keep_alive: KeepAliveGraph,
    stats: HeapStatistics,
    allocations_since_collect: u32,
    /// Instances freed since the last drain: (native address, wrapper).
    freed_instances: Vec<(NonNull<u8>, Handle)>,
    none: Handle,
}

impl HostHeap {
    /// Create a heap holding only the `None` singleton.
    pub fn new() -> Self {
        let mut heap = Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            keep_alive: KeepAliveGraph::default(),
            stats: HeapStatistics::default(),
            allocations_since_collect: 0,
            freed_instances: Vec::new(),
            none: Handle::NULL,
        };
        heap.none = heap.allocate_immortal(HostObject::None);
        heap
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate an object; the returned handle owns one reference.
    pub fn allocate(&mut self, object: HostObject) -> Handle {
        self.allocations_since_collect = self.allocations_since_collect.saturating_add(1);
        self.insert(object, false)
    }

    /// Allocate an object that is never freed (singletons, type objects).
    pub fn allocate_immortal(&mut self, object: HostObject) -> Handle {
        self.insert(object, true)
    }

    fn insert(&mut self, object: HostObject, immortal: bool) -> Handle {
        self.stats.live_objects += 1;
        self.stats.total_allocated += 1;

        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            slot.ref_count = 1;
            slot.immortal = immortal;
            Handle::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(HeapSlot {
                generation: 0,
                object: Some(object),
                ref_count: 1,
                immortal,
            });
            Handle::new(index, 0)
        }
    }

    /// The `None` singleton.
    ///
    /// Immortal, so callers need not balance references to it.
    #[inline]
    pub fn none(&self) -> Handle {
        self.none
    }

    // =========================================================================
    // Access
    // =========================================================================

    fn slot(&self, handle: Handle) -> Option<&HeapSlot> {
        let slot = self.slots.get(handle.index as usize)?;
        (slot.generation == handle.generation && slot.object.is_some()).then_some(slot)
    }

    fn slot_mut(&mut self, handle: Handle) -> Option<&mut HeapSlot> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        (slot.generation == handle.generation && slot.object.is_some()).then_some(slot)
    }

    /// Get an object, or `None` if the handle is stale.
    pub fn get(&self, handle: Handle) -> Option<&HostObject> {
        self.slot(handle)?.object.as_ref()
    }

    /// Get an object mutably, or `None` if the handle is stale.
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut HostObject> {
        self.slot_mut(handle)?.object.as_mut()
    }

    /// Get an object or report a stale handle.
    pub fn try_get(&self, handle: Handle) -> Result<&HostObject, BridgeError> {
        self.get(handle).ok_or(BridgeError::StaleHandle {
            index: handle.index,
        })
    }

    /// Get an object mutably or report a stale handle.
    pub fn try_get_mut(&mut self, handle: Handle) -> Result<&mut HostObject, BridgeError> {
        let index = handle.index;
        self.get_mut(handle).ok_or(BridgeError::StaleHandle { index })
    }

    /// Check whether a handle refers to a live object.
    pub fn is_live(&self, handle: Handle) -> bool {
        self.slot(handle).is_some()
    }

    /// Check whether a handle refers to an immortal object.
    pub fn is_immortal(&self, handle: Handle) -> bool {
        self.slot(handle).is_some_and(|slot| slot.immortal)
    }

    /// Host type name of the object, `"<freed>"` for stale handles.
    pub fn kind_name(&self, handle: Handle) -> &'static str {
        self.get(handle).map_or("<freed>", HostObject::kind_name)
    }

    /// Handles of every live object.
    pub fn live_handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.object
                .as_ref()
                .map(|_| Handle::new(index as u32, slot.generation))
        })
    }

    /// Heap counters.
    pub fn statistics(&self) -> HeapStatistics {
        self.stats
    }

    /// Allocations since the last cycle collection.
    pub fn allocations_since_collect(&self) -> u32 {
        self.allocations_since_collect
    }

    pub(crate) fn reset_allocation_counter(&mut self) {
        self.allocations_since_collect = 0;
    }

    /// Take the (address, wrapper) pairs of instances freed since the last call.
    ///
    /// Address indexes hold wrappers weakly and use this to drop their entries.
    pub fn drain_freed_instances(&mut self) -> Vec<(NonNull<u8>, Handle)> {
        std::mem::take(&mut self.freed_instances)
    }

    pub(crate) fn keep_alive_graph(&self) -> &KeepAliveGraph {
        &self.keep_alive
    }

    pub(crate) fn keep_alive_graph_mut(&mut self) -> &mut KeepAliveGraph {
        &mut self.keep_alive
    }

    // =========================================================================
    // Reference Counting
    // =========================================================================

    /// Increment the reference count. Returns false for stale handles.
    pub fn add_ref(&mut self, handle: Handle) -> bool {
        match self.slot_mut(handle) {
            Some(slot) => {
                if !slot.immortal {
                    slot.ref_count = slot.ref_count.saturating_add(1);
                }
                true
            }
            None => false,
        }
    }

    /// Reference count of a live object.
    pub fn ref_count(&self, handle: Handle) -> Option<u32> {
        self.slot(handle).map(|slot| slot.ref_count)
    }

    /// Decrement the reference count, freeing the object when it reaches zero.
    ///
    /// Returns true if the object was freed.
    pub fn release(&mut self, handle: Handle) -> bool {
        if self.decrement(handle) {
            self.free(handle);
            return true;
        }
        false
    }

    /// Decrement without freeing; true when the count reached zero.
    fn decrement(&mut self, handle: Handle) -> bool {
        match self.slot_mut(handle) {
            Some(slot) if !slot.immortal => {
                slot.ref_count = slot.ref_count.saturating_sub(1);
                slot.ref_count == 0
            }
            _ => false,
        }
    }

    /// Remove the object from its slot and retire the slot.
    fn take(&mut self, handle: Handle) -> Option<HostObject> {
        let slot = self.slot_mut(handle)?;
        let object = slot.object.take();
        slot.generation = slot.generation.wrapping_add(1);
        slot.ref_count = 0;
        self.free_list.push(handle.index);
        if let Some(HostObject::Instance(record)) = &object {
            self.freed_instances.push((record.addr(), handle));
        }
        self.stats.live_objects = self.stats.live_objects.saturating_sub(1);
        self.stats.total_freed += 1;
        object
    }

    /// Free an object whose count reached zero, cascading iteratively.
    fn free(&mut self, root: Handle) {
        let mut pending = vec![root];
        let mut payloads = Vec::new();

        while let Some(handle) = pending.pop() {
            let Some(mut object) = self.take(handle) else {
                continue;
            };

            // The nurse is finalized before anything it keeps alive.
            if let HostObject::Instance(record) = &mut object {
                record.finalize();
            }
            let children = object.take_references();
            drop(object);

            for child in children {
                if self.decrement(child) {
                    pending.push(child);
                }
            }
            for patient in self.keep_alive.detach(handle) {
                match patient {
                    Patient::Object(patient) => {
                        if self.decrement(patient) {
                            pending.push(patient);
                        }
                    }
                    Patient::Payload(payload) => payloads.push(payload),
                }
            }
        }

        drop(payloads);
    }

    /// Release a batch of references (collector clear phase).
    pub(crate) fn release_all(&mut self, handles: impl IntoIterator<Item = Handle>) {
        for handle in handles {
            self.release(handle);
        }
    }

    // =========================================================================
    // Convenience Constructors
    // =========================================================================

    /// Allocate a tuple, taking over the references of `items`.
    pub fn new_tuple(&mut self, items: Vec<Handle>) -> Handle {
        self.allocate(HostObject::Tuple(items))
    }

    /// Allocate a list, taking over the references of `items`.
    pub fn new_list(&mut self, items: Vec<Handle>) -> Handle {
        self.allocate(HostObject::List(items))
    }

    /// Allocate a dict, taking over the references of the values.
    pub fn new_dict(&mut self, entries: Vec<(String, Handle)>) -> Handle {
        self.allocate(HostObject::Dict(entries))
    }

    /// Append to a list, taking over the reference of `item`.
    pub fn list_push(&mut self, list: Handle, item: Handle) -> Result<(), BridgeError> {
        match self.try_get_mut(list)? {
            HostObject::List(items) => {
                items.push(item);
                Ok(())
            }
            other => Err(BridgeError::TypeMismatch {
                expected: "list".to_string(),
                actual: other.kind_name().to_string(),
            }),
        }
    }
}

impl Default for HostHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHeap")
            .field("slot_count", &self.slots.len())
            .field("free_count", &self.free_list.len())
            .field("keep_alive_nurses", &self.keep_alive.nurse_count())
            .field("stats", &self.stats)
            .finish()
    }
}
