//! Keep-alive edges: a nurse object keeps its patients alive.
//!
//! Edges live in a side table keyed by the nurse handle, so any host object
//! can be a nurse, not only native instances. Each edge to a handle patient
//! owns one reference to that patient. Payload patients are arbitrary native
//! values whose `Drop` is their destructor.
//!
//! The heap consults this table when freeing a nurse (patients are released
//! after the nurse is finalized) and the cycle collector traverses it, so an
//! edge never pins a garbage cycle that runs through its nurse.

use std::any::Any;
use std::fmt;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::heap::{Handle, HostHeap};

/// The dependent end of a keep-alive edge.
pub enum Patient {
    /// A host object, holding one reference.
    Object(Handle),
    /// A native payload dropped when the nurse is freed.
    Payload(Box<dyn Any>),
}

impl fmt::Debug for Patient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Patient::Object(handle) => write!(f, "Object({handle:?})"),
            Patient::Payload(_) => write!(f, "Payload(...)"),
        }
    }
}

/// Runs a closure when dropped; lets a callback act as a payload destructor.
pub struct Finalizer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Finalizer<F> {
    pub fn new(callback: F) -> Self {
        Self(Some(callback))
    }
}

impl<F: FnOnce()> Drop for Finalizer<F> {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback();
        }
    }
}

/// Side table of keep-alive edges, keyed by nurse.
#[derive(Default)]
pub struct KeepAliveGraph {
    edges: FxHashMap<Handle, SmallVec<[Patient; 2]>>,
}

impl KeepAliveGraph {
    /// Number of nurses with at least one edge.
    pub fn nurse_count(&self) -> usize {
        self.edges.len()
    }

    /// Number of edges leaving `nurse`.
    pub fn edge_count(&self, nurse: Handle) -> usize {
        self.edges.get(&nurse).map_or(0, SmallVec::len)
    }

    /// Whether `nurse` keeps `patient` alive.
    pub fn links(&self, nurse: Handle, patient: Handle) -> bool {
        self.edges.get(&nurse).is_some_and(|patients| {
            patients
                .iter()
                .any(|p| matches!(p, Patient::Object(h) if *h == patient))
        })
    }

    /// Handle patients of `nurse`, one entry per edge (collector traversal).
    pub fn patients(&self, nurse: Handle) -> impl Iterator<Item = Handle> + '_ {
        self.edges.get(&nurse).into_iter().flatten().filter_map(|p| match p {
            Patient::Object(handle) => Some(*handle),
            Patient::Payload(_) => None,
        })
    }

    fn insert(&mut self, nurse: Handle, patient: Patient) {
        self.edges.entry(nurse).or_default().push(patient);
    }

    /// Remove and return every edge leaving `nurse`.
    pub(crate) fn detach(&mut self, nurse: Handle) -> SmallVec<[Patient; 2]> {
        self.edges.remove(&nurse).unwrap_or_default()
    }
}

impl HostHeap {
    /// Ensure `patient` is not freed while `nurse` is alive.
    ///
    /// No-op when either side is immortal or stale, or when they are the same
    /// object. Returns true if an edge was installed.
    pub fn keep_alive(&mut self, nurse: Handle, patient: Handle) -> bool {
        if nurse == patient
            || !self.is_live(nurse)
            || !self.is_live(patient)
            || self.is_immortal(nurse)
            || self.is_immortal(patient)
        {
            return false;
        }
        self.add_ref(patient);
        self.keep_alive_graph_mut()
            .insert(nurse, Patient::Object(patient));
        tracing::trace!(?nurse, ?patient, "keep-alive edge installed");
        true
    }

    /// Keep a native payload alive until `nurse` is freed.
    ///
    /// If the nurse is immortal the payload is never dropped; if it is stale
    /// the payload is dropped immediately.
    pub fn keep_alive_payload(&mut self, nurse: Handle, payload: Box<dyn Any>) {
        if !self.is_live(nurse) {
            drop(payload);
            return;
        }
        if self.is_immortal(nurse) {
            std::mem::forget(payload);
            return;
        }
        self.keep_alive_graph_mut()
            .insert(nurse, Patient::Payload(payload));
    }

    /// Run `callback` once `nurse` has been freed.
    pub fn keep_alive_finalizer(&mut self, nurse: Handle, callback: impl FnOnce() + 'static) {
        self.keep_alive_payload(nurse, Box::new(Finalizer::new(callback)));
    }

    /// Whether `nurse` currently keeps `patient` alive.
    pub fn is_kept_alive_by(&self, patient: Handle, nurse: Handle) -> bool {
        self.keep_alive_graph().links(nurse, patient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::HostObject;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn patient_survives_until_nurse_freed() {
        let mut heap = HostHeap::new();
        let nurse = heap.allocate(HostObject::Int(1));
        let patient = heap.allocate(HostObject::Int(2));

        assert!(heap.keep_alive(nurse, patient));
        heap.release(patient);
        assert!(heap.is_live(patient));

        heap.release(nurse);
        assert!(!heap.is_live(patient));
    }

    #[test]
    fn self_edge_and_immortal_are_noops() {
        let mut heap = HostHeap::new();
        let obj = heap.allocate(HostObject::Int(1));
        let none = heap.none();

        assert!(!heap.keep_alive(obj, obj));
        assert!(!heap.keep_alive(none, obj));
        assert!(!heap.keep_alive(obj, none));
        assert_eq!(heap.ref_count(obj), Some(1));
    }

    #[test]
    fn payload_dropped_with_nurse() {
        let mut heap = HostHeap::new();
        let nurse = heap.allocate(HostObject::Int(1));
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();

        heap.keep_alive_finalizer(nurse, move || flag.set(true));
        assert!(!fired.get());

        heap.release(nurse);
        assert!(fired.get());
    }

    #[test]
    fn payload_on_stale_nurse_drops_immediately() {
        let mut heap = HostHeap::new();
        let nurse = heap.allocate(HostObject::Int(1));
        heap.release(nurse);

        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        heap.keep_alive_finalizer(nurse, move || flag.set(true));
        assert!(fired.get());
    }

    #[test]
    fn duplicate_edges_hold_one_reference_each() {
        let mut heap = HostHeap::new();
        let nurse = heap.allocate(HostObject::Int(1));
        let patient = heap.allocate(HostObject::Int(2));

        heap.keep_alive(nurse, patient);
        heap.keep_alive(nurse, patient);
        assert_eq!(heap.ref_count(patient), Some(3));
        assert_eq!(heap.keep_alive_graph().patients(nurse).count(), 2);

        heap.release(nurse);
        assert_eq!(heap.ref_count(patient), Some(1));
    }

    #[test]
    fn chained_nurses_release_in_order() {
        let mut heap = HostHeap::new();
        let a = heap.allocate(HostObject::Int(1));
        let b = heap.allocate(HostObject::Int(2));
        let c = heap.allocate(HostObject::Int(3));
        heap.keep_alive(a, b);
        heap.keep_alive(b, c);
        heap.release(b);
        heap.release(c);

        assert!(heap.is_kept_alive_by(b, a));
        heap.release(a);
        assert!(!heap.is_live(b));
        assert!(!heap.is_live(c));
        assert_eq!(heap.keep_alive_graph().nurse_count(), 0);
    }
}
