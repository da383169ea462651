//! Address index over live instance records.
//!
//! Maps a native address to the wrappers currently bound to it, so publishing
//! the same object twice yields the same host object. Several records may
//! share an address (a `#[repr(C)]` value and its leading base field, or
//! borrowed views of different types).
//!
//! Entries are weak. The heap reports freed instances through
//! [`HostHeap::drain_freed_instances`], and [`InstanceIndex::forget_freed`]
//! drops their entries; lookups also validate handles against the heap and
//! prune whatever has not been drained yet.

use std::any::TypeId;
use std::ptr::NonNull;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use bindery_core::{Handle, HostHeap, HostObject, InstanceRecord, InstanceState, Ownership};

#[derive(Debug, Default)]
pub struct InstanceIndex {
    by_addr: FxHashMap<usize, SmallVec<[Handle; 1]>>,
}

fn live_record(heap: &HostHeap, handle: Handle) -> Option<&InstanceRecord> {
    heap.get(handle).and_then(HostObject::as_instance)
}

impl InstanceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed addresses, stale entries included.
    pub fn address_count(&self) -> usize {
        self.by_addr.len()
    }

    /// Drop the entries of every wrapper the heap freed since the last call.
    pub fn forget_freed(&mut self, heap: &mut HostHeap) {
        for (addr, handle) in heap.drain_freed_instances() {
            self.remove(addr, handle);
        }
    }

    pub fn insert(&mut self, addr: NonNull<u8>, handle: Handle) {
        self.by_addr
            .entry(addr.as_ptr() as usize)
            .or_default()
            .push(handle);
    }

    /// Forget one wrapper for `addr`.
    pub fn remove(&mut self, addr: NonNull<u8>, handle: Handle) {
        let key = addr.as_ptr() as usize;
        if let Some(handles) = self.by_addr.get_mut(&key) {
            handles.retain(|h| *h != handle);
            if handles.is_empty() {
                self.by_addr.remove(&key);
            }
        }
    }

    fn prune(&mut self, heap: &HostHeap, key: usize) {
        if let Some(handles) = self.by_addr.get_mut(&key) {
            handles.retain(|h| {
                live_record(heap, *h).is_some_and(|r| r.state() != InstanceState::Relinquished)
            });
            if handles.is_empty() {
                self.by_addr.remove(&key);
            }
        }
    }

    /// Newest live wrapper of exactly `type_id` at `addr`.
    ///
    /// Placeholders are skipped: they are not bound to a value yet.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn find(&mut self, heap: &HostHeap, addr: NonNull<u8>, type_id: TypeId) -> Option<Handle> {
        let key = addr.as_ptr() as usize;
        self.prune(heap, key);
        self.by_addr.get(&key)?.iter().rev().copied().find(|h| {
            live_record(heap, *h).is_some_and(|r| r.type_id() == type_id && r.is_ready())
        })
    }

    /// Live wrapper of any type that owns the memory at `addr`.
    pub fn find_owner(&mut self, heap: &HostHeap, addr: NonNull<u8>) -> Option<Handle> {
        let key = addr.as_ptr() as usize;
        self.prune(heap, key);
        self.by_addr.get(&key)?.iter().copied().find(|h| {
            live_record(heap, *h).is_some_and(|r| r.ownership() == Ownership::HostOwned)
        })
    }

    /// Live wrappers bound to `addr`, in insertion order.
    pub fn wrappers(&mut self, heap: &HostHeap, addr: NonNull<u8>) -> Vec<Handle> {
        let key = addr.as_ptr() as usize;
        self.prune(heap, key);
        self.by_addr.get(&key).map(|h| h.to_vec()).unwrap_or_default()
    }
}
