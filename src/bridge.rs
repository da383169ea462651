//! The bridge context.
//!
//! [`Bridge`] owns every piece of boundary state: the host heap, the type
//! registry, the instance index, the function and override tables and the
//! cycle collector. There are no process-wide singletons; several bridges can
//! coexist, and exclusive access (`&mut Bridge`) is what serialises boundary
//! operations.

use std::any::TypeId;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use bindery_core::{
    BridgeError, CollectorStatistics, CycleCollector, Handle, HostHeap, HostObject, Ownership,
    RegistrationError, Result,
};

use crate::cleanup::CleanupList;
use crate::config::BridgeProperty;
use crate::dispatch::FunctionTable;
use crate::instances::InstanceIndex;
use crate::overrides::OverrideTable;
use crate::registry::{
    ConversionSource, ConvertFn, ImplicitConversion, PredicateFn, TypeDescriptor, TypeRegistry,
};

/// Native/host object bridge.
pub struct Bridge {
    pub(crate) heap: HostHeap,
    pub(crate) registry: TypeRegistry,
    pub(crate) instances: InstanceIndex,
    pub(crate) functions: FunctionTable,
    pub(crate) overrides: OverrideTable,
    collector: CycleCollector,
    properties: FxHashMap<BridgeProperty, usize>,
}

impl Bridge {
    pub fn new() -> Self {
        Self {
            heap: HostHeap::new(),
            registry: TypeRegistry::new(),
            instances: InstanceIndex::new(),
            functions: FunctionTable::default(),
            overrides: OverrideTable::default(),
            collector: CycleCollector::new(),
            properties: FxHashMap::default(),
        }
    }

    pub fn heap(&self) -> &HostHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut HostHeap {
        &mut self.heap
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub fn set_property(&mut self, property: BridgeProperty, value: usize) {
        self.properties.insert(property, value);
    }

    pub fn property(&self, property: BridgeProperty) -> usize {
        self.properties
            .get(&property)
            .copied()
            .unwrap_or_else(|| property.default_value())
    }

    pub(crate) fn is_enabled(&self, property: BridgeProperty) -> bool {
        self.property(property) != 0
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a native type. Aborts on duplicate or invalid registration.
    pub fn register(&mut self, descriptor: TypeDescriptor) -> Handle {
        self.registry.register(&mut self.heap, descriptor)
    }

    pub fn try_register(
        &mut self,
        descriptor: TypeDescriptor,
    ) -> std::result::Result<Handle, RegistrationError> {
        self.registry.try_register(&mut self.heap, descriptor)
    }

    /// Host type object of a registered type.
    pub fn type_handle<T: 'static>(&self) -> Option<Handle> {
        self.registry
            .lookup(TypeId::of::<T>())
            .map(|descriptor| descriptor.type_handle)
    }

    /// Let `S` instances be passed where a `D` is expected.
    pub fn implicitly_convertible<S: 'static, D: 'static>(
        &mut self,
    ) -> std::result::Result<(), RegistrationError>
    where
        D: for<'a> From<&'a S>,
    {
        let convert: ConvertFn = Arc::new(|bridge: &mut Bridge, handle: Handle| {
            let value = D::from(bridge.borrow::<S>(handle)?);
            bridge.publish_value(value)
        });
        self.registry.add_conversion(
            TypeId::of::<D>(),
            ImplicitConversion {
                source: ConversionSource::Type(TypeId::of::<S>()),
                convert,
            },
        )
    }

    /// Let any object accepted by `predicate` be passed where a `D` is
    /// expected, building the `D` with `construct`.
    ///
    /// The predicate sees the call's cleanup list and may park temporaries
    /// there; they are released with the call.
    pub fn implicitly_convertible_if<D, P, F>(
        &mut self,
        predicate: P,
        construct: F,
    ) -> std::result::Result<(), RegistrationError>
    where
        D: 'static,
        P: Fn(&mut Bridge, Handle, &mut CleanupList) -> bool + 'static,
        F: Fn(&mut Bridge, Handle) -> Result<D> + 'static,
    {
        let predicate: PredicateFn = Arc::new(predicate);
        let convert: ConvertFn = Arc::new(move |bridge: &mut Bridge, handle: Handle| {
            let value = construct(bridge, handle)?;
            bridge.publish_value(value)
        });
        self.registry.add_conversion(
            TypeId::of::<D>(),
            ImplicitConversion {
                source: ConversionSource::Predicate(predicate),
                convert,
            },
        )
    }

    pub fn set_extra<E: 'static>(
        &mut self,
        type_id: TypeId,
        extra: E,
    ) -> std::result::Result<(), RegistrationError> {
        self.registry.set_extra(type_id, Box::new(extra))
    }

    pub fn extra<E: 'static>(&self, type_id: TypeId) -> Option<&E> {
        self.registry.extra(type_id)
    }

    // =========================================================================
    // Boundary Calls
    // =========================================================================

    /// Run `f` with a fresh cleanup list, releasing its temporaries on every
    /// exit path. A panic in `f` is resumed after the release.
    pub fn with_cleanup<R>(
        &mut self,
        receiver: Option<Handle>,
        f: impl FnOnce(&mut Bridge, &mut CleanupList) -> Result<R>,
    ) -> Result<R> {
        let mut cleanup = CleanupList::new(receiver);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(self, &mut cleanup)));
        cleanup.release(&mut self.heap);
        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Tie the lifetime of `patient` to `nurse`.
    pub fn keep_alive(&mut self, nurse: Handle, patient: Handle) -> bool {
        self.heap.keep_alive(nurse, patient)
    }

    // =========================================================================
    // Dynamic Attributes
    // =========================================================================

    fn attribute_error(&self, handle: Handle, name: &str) -> BridgeError {
        BridgeError::AttributeError {
            type_name: self.heap.kind_name(handle).to_string(),
            name: name.to_string(),
        }
    }

    /// Store a per-instance attribute, taking over the reference to `value`.
    ///
    /// On error the reference stays with the caller.
    pub fn set_attr(&mut self, handle: Handle, name: &str, value: Handle) -> Result<()> {
        let displaced = self
            .heap
            .try_get_mut(handle)?
            .as_instance_mut()
            .map(|record| record.set_attr(name, value));
        match displaced {
            Some(Ok(Some(old))) => {
                self.heap.release(old);
                Ok(())
            }
            Some(Ok(None)) => Ok(()),
            Some(Err(_)) | None => Err(self.attribute_error(handle, name)),
        }
    }

    /// Read a per-instance attribute as a new reference.
    pub fn get_attr(&mut self, handle: Handle, name: &str) -> Result<Handle> {
        let value = self
            .heap
            .try_get(handle)?
            .as_instance()
            .and_then(|record| record.attr(name));
        match value {
            Some(value) => {
                self.heap.add_ref(value);
                Ok(value)
            }
            None => Err(self.attribute_error(handle, name)),
        }
    }

    // =========================================================================
    // Garbage Collection
    // =========================================================================

    /// Run a full cycle collection. Returns the number of garbage objects.
    ///
    /// Also drops address-index entries of every wrapper freed so far.
    pub fn collect(&mut self) -> u32 {
        let garbage = self.collector.collect(&mut self.heap);
        self.instances.forget_freed(&mut self.heap);
        garbage
    }

    /// Collect if automatic collection is on and enough objects were allocated.
    pub fn maybe_collect(&mut self) -> bool {
        if !self.is_enabled(BridgeProperty::AutoCollect) {
            return false;
        }
        let threshold = self.property(BridgeProperty::CollectThreshold).max(1);
        if (self.heap.allocations_since_collect() as usize) < threshold {
            return false;
        }
        self.collect();
        true
    }

    pub fn collector_statistics(&self) -> CollectorStatistics {
        self.collector.statistics()
    }

    /// Native addresses with at least one indexed wrapper.
    pub fn indexed_addresses(&mut self) -> usize {
        self.instances.forget_freed(&mut self.heap);
        self.instances.address_count()
    }

    /// Live wrappers of native values (placeholders and relinquished shells excluded).
    pub fn instance_count(&self) -> usize {
        self.heap
            .live_handles()
            .filter_map(|h| self.heap.get(h).and_then(HostObject::as_instance))
            .filter(|record| record.is_ready())
            .count()
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let callables: Vec<Handle> = self.overrides.drain().collect();
        for callable in callables {
            self.heap.release(callable);
        }

        if !self.is_enabled(BridgeProperty::LeakWarnings) {
            return;
        }
        let leaked: Vec<&'static str> = self
            .heap
            .live_handles()
            .filter_map(|h| self.heap.get(h).and_then(HostObject::as_instance))
            .filter(|record| record.is_ready() && record.ownership() == Ownership::HostOwned)
            .map(|record| record.type_name())
            .collect();
        if !leaked.is_empty() {
            tracing::warn!(
                count = leaked.len(),
                types = ?leaked,
                "bridge dropped with live host-owned instances"
            );
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("heap", &self.heap)
            .field("registry", &self.registry)
            .field("functions", &self.functions.len())
            .field("overrides", &self.overrides.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TypeBuilder;
    use bindery_core::{FromHost, IntoHost};

    #[derive(Default)]
    struct Record {
        id: u32,
    }

    fn bridge() -> Bridge {
        let mut bridge = Bridge::new();
        bridge.register(TypeBuilder::<Record>::new("Record").dynamic_attrs().build());
        bridge
    }

    #[test]
    fn properties_fall_back_to_defaults() {
        let mut bridge = Bridge::new();
        assert_eq!(bridge.property(BridgeProperty::CollectThreshold), 100);
        bridge.set_property(BridgeProperty::CollectThreshold, 5);
        assert_eq!(bridge.property(BridgeProperty::CollectThreshold), 5);
    }

    #[test]
    fn dynamic_attributes() {
        let mut bridge = bridge();
        let record = bridge.publish_value(Record { id: 1 }).unwrap();
        let value = "tag".into_host(bridge.heap_mut());

        bridge.set_attr(record, "label", value).unwrap();
        let read = bridge.get_attr(record, "label").unwrap();
        assert_eq!(String::from_host(bridge.heap(), read).unwrap(), "tag");
        bridge.heap_mut().release(read);

        let err = bridge.get_attr(record, "missing").unwrap_err();
        assert_eq!(
            err,
            BridgeError::AttributeError {
                type_name: "Record".to_string(),
                name: "missing".to_string()
            }
        );

        bridge.heap_mut().release(record);
        assert!(!bridge.heap().is_live(value));
    }

    #[test]
    fn attributes_need_a_table() {
        struct Plain;
        let mut bridge = bridge();
        bridge.register(TypeBuilder::<Plain>::new("Plain").build());
        let plain = bridge.publish_value(Plain).unwrap();
        let value = 1i64.into_host(bridge.heap_mut());

        assert!(bridge.set_attr(plain, "x", value).is_err());
        assert!(bridge.heap().is_live(value));
    }

    #[test]
    fn with_cleanup_releases_on_error() {
        let mut bridge = bridge();
        let mut temp = Handle::NULL;
        let result: Result<()> = bridge.with_cleanup(None, |bridge, cleanup| {
            temp = bridge.publish_value(Record { id: 2 })?;
            cleanup.append(temp);
            Err(BridgeError::raise("failed"))
        });
        assert!(result.is_err());
        assert!(!bridge.heap().is_live(temp));
    }

    #[test]
    fn with_cleanup_releases_on_panic() {
        let mut bridge = bridge();
        let temp = bridge.publish_value(Record { id: 3 }).unwrap();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let _: Result<()> = bridge.with_cleanup(None, |_, cleanup| {
                cleanup.append(temp);
                panic!("native failure");
            });
        }));
        assert!(outcome.is_err());
        assert!(!bridge.heap().is_live(temp));
    }

    #[test]
    fn auto_collect_respects_threshold() {
        let mut bridge = bridge();
        bridge.set_property(BridgeProperty::CollectThreshold, 3);
        assert!(!bridge.maybe_collect());
        for id in 0..3 {
            let h = bridge.publish_value(Record { id }).unwrap();
            bridge.heap_mut().release(h);
        }
        assert!(bridge.maybe_collect());
        assert_eq!(bridge.collector_statistics().collections, 1);

        bridge.set_property(BridgeProperty::AutoCollect, 0);
        for _ in 0..5 {
            bridge.heap_mut().allocate(HostObject::Int(0));
        }
        assert!(!bridge.maybe_collect());
    }

    #[test]
    fn instance_count_tracks_wrappers() {
        let mut bridge = bridge();
        assert_eq!(bridge.instance_count(), 0);
        let a = bridge.publish_value(Record { id: 1 }).unwrap();
        let b = bridge.publish_value(Record { id: 2 }).unwrap();
        assert_eq!(bridge.instance_count(), 2);
        assert_eq!(bridge.borrow::<Record>(b).unwrap().id, 2);
        bridge.heap_mut().release(a);
        bridge.heap_mut().release(b);
        assert_eq!(bridge.instance_count(), 0);
    }
}
