//! Temporaries created during one boundary call.
//!
//! Slot zero holds the call's receiver (or [`Handle::NULL`]); it is borrowed
//! and never released. Every other entry owns one reference that is released
//! exactly once when the list is released. The first six entries live inline.

use smallvec::SmallVec;

use bindery_core::{Handle, HostHeap};

/// Inline capacity, receiver slot included.
pub const INLINE_CAPACITY: usize = 6;

pub struct CleanupList {
    handles: SmallVec<[Handle; INLINE_CAPACITY]>,
}

impl CleanupList {
    /// Create a list for a call on `receiver`, or a plain call when `None`.
    pub fn new(receiver: Option<Handle>) -> Self {
        let mut handles = SmallVec::new();
        handles.push(receiver.unwrap_or(Handle::NULL));
        Self { handles }
    }

    /// The call's receiver, if any.
    #[inline]
    pub fn receiver(&self) -> Option<Handle> {
        self.handles.first().copied().filter(|h| !h.is_null())
    }

    /// Take over one reference to `handle` until the list is released.
    #[inline]
    pub fn append(&mut self, handle: Handle) {
        self.handles.push(handle);
    }

    /// Number of owned temporaries (receiver excluded).
    pub fn len(&self) -> usize {
        self.handles.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the temporaries have spilled out of the inline buffer.
    pub fn spilled(&self) -> bool {
        self.handles.spilled()
    }

    /// Release every temporary.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn release(mut self, heap: &mut HostHeap) {
        let handles = std::mem::take(&mut self.handles);
        for handle in handles.into_iter().skip(1) {
            heap.release(handle);
        }
    }
}

impl Drop for CleanupList {
    fn drop(&mut self) {
        if self.handles.len() > 1 {
            tracing::error!(
                leaked = self.handles.len() - 1,
                "cleanup list dropped without release; temporaries leaked"
            );
        }
    }
}

impl std::fmt::Debug for CleanupList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupList")
            .field("receiver", &self.receiver())
            .field("temporaries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bindery_core::HostObject;

    #[test]
    fn release_skips_receiver() {
        let mut heap = HostHeap::new();
        let receiver = heap.allocate(HostObject::Int(0));
        let temp = heap.allocate(HostObject::Int(1));

        let mut cleanup = CleanupList::new(Some(receiver));
        cleanup.append(temp);
        assert_eq!(cleanup.receiver(), Some(receiver));
        assert_eq!(cleanup.len(), 1);

        cleanup.release(&mut heap);
        assert!(heap.is_live(receiver));
        assert!(!heap.is_live(temp));
    }

    #[test]
    fn no_receiver() {
        let cleanup = CleanupList::new(None);
        assert_eq!(cleanup.receiver(), None);
        assert!(cleanup.is_empty());
    }

    #[test]
    fn spills_past_inline_capacity() {
        let mut heap = HostHeap::new();
        let mut cleanup = CleanupList::new(None);
        let temps: Vec<Handle> = (0..20).map(|i| heap.allocate(HostObject::Int(i))).collect();

        for (i, temp) in temps.iter().enumerate() {
            cleanup.append(*temp);
            assert_eq!(cleanup.spilled(), i + 2 > INLINE_CAPACITY);
        }

        cleanup.release(&mut heap);
        assert!(temps.iter().all(|t| !heap.is_live(*t)));
        assert_eq!(heap.statistics().live_objects, 1);
    }

    #[test]
    fn duplicate_entries_release_each_reference() {
        let mut heap = HostHeap::new();
        let temp = heap.allocate(HostObject::Int(1));
        heap.add_ref(temp);
        heap.add_ref(temp);

        let mut cleanup = CleanupList::new(None);
        cleanup.append(temp);
        cleanup.append(temp);
        cleanup.release(&mut heap);
        assert_eq!(heap.ref_count(temp), Some(1));
    }
}
