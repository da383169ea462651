//! Casting engine: moving values across the boundary.
//!
//! - **Host -> native** ([`Bridge::obtain`]): find the native address behind a
//!   handle, trying implicit conversions when allowed. Never transfers
//!   ownership; the address is borrowed for the duration of the call.
//! - **Native -> host** ([`Bridge::publish`]): find or create the wrapper for
//!   a native value according to a [`ReturnPolicy`].
//! - **Ownership transfer back** ([`Bridge::relinquish`]): hand a host-owned
//!   value back to native code.
//!
//! ## Wrapper Identity
//!
//! Publishing an address that already has a live wrapper of the same type
//! returns that wrapper with one more reference, so host-side identity
//! follows native identity. Copies and moves always create a new wrapper.

use std::any::TypeId;
use std::ptr::NonNull;

use bitflags::bitflags;

use bindery_core::{
    BridgeError, Handle, HostObject, InstanceRecord, InstanceState, NativeVTable, Ownership,
    Result, fatal,
};

use crate::Bridge;
use crate::cleanup::CleanupList;
use crate::config::BridgeProperty;
use crate::registry::{ConversionSource, TypeFlags};

bitflags! {
    /// Options for host -> native casts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CastFlags: u8 {
        /// Try implicit conversions when the object is not an instance of the type.
        const CONVERT = 1 << 0;
        /// Report a failed cast as the overload-fallback signal.
        const NEXT_OVERLOAD = 1 << 1;
        /// Accept only placeholders awaiting construction.
        const CONSTRUCT = 1 << 2;
    }
}

/// How a native value becomes a host object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnPolicy {
    /// Pointer results: same as `TakeOwnership`.
    Automatic,
    /// Pointer results: same as `Reference`.
    AutomaticReference,
    /// The host destroys the value when the wrapper is freed.
    TakeOwnership,
    /// Clone into a new host-owned instance.
    Copy,
    /// Move into a new host-owned instance, falling back to copy.
    Move,
    /// Wrap without ownership; native code keeps the value alive.
    Reference,
    /// `Reference`, plus the wrapper keeps the call's receiver alive.
    ReferenceInternal,
}

impl ReturnPolicy {
    /// Replace the automatic policies with what they stand for.
    pub fn resolve(self) -> Self {
        match self {
            ReturnPolicy::Automatic => ReturnPolicy::TakeOwnership,
            ReturnPolicy::AutomaticReference => ReturnPolicy::Reference,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnPolicy::Automatic => "automatic",
            ReturnPolicy::AutomaticReference => "automatic_reference",
            ReturnPolicy::TakeOwnership => "take_ownership",
            ReturnPolicy::Copy => "copy",
            ReturnPolicy::Move => "move",
            ReturnPolicy::Reference => "reference",
            ReturnPolicy::ReferenceInternal => "reference_internal",
        }
    }
}

impl Bridge {
    // =========================================================================
    // Host -> Native
    // =========================================================================

    /// Address of the instance behind `handle` if it is a `type_id` (or subtype).
    fn match_instance(
        &self,
        handle: Handle,
        type_id: TypeId,
        flags: CastFlags,
    ) -> Result<Option<NonNull<u8>>> {
        let Some(record) = self.heap.try_get(handle)?.as_instance() else {
            return Ok(None);
        };
        if !self.registry.is_subtype(record.type_id(), type_id) {
            return Ok(None);
        }
        let constructing = flags.contains(CastFlags::CONSTRUCT);
        let state = match (record.state(), constructing) {
            (InstanceState::Ready, false) | (InstanceState::Placeholder, true) => {
                return Ok(Some(record.addr()));
            }
            (InstanceState::Ready, true) => "already constructed",
            (state, _) => state.as_str(),
        };
        if flags.contains(CastFlags::NEXT_OVERLOAD) {
            return Err(BridgeError::NextOverload);
        }
        Err(BridgeError::InstanceNotReady {
            type_name: record.type_name().to_string(),
            state,
        })
    }

    /// Native address of a `type_id` value for `handle`.
    ///
    /// Implicit conversions are tried only with [`CastFlags::CONVERT`] and a
    /// cleanup list to hold the converted temporary.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn obtain_raw(
        &mut self,
        handle: Handle,
        type_id: TypeId,
        flags: CastFlags,
        cleanup: Option<&mut CleanupList>,
    ) -> Result<NonNull<u8>> {
        if !self.registry.contains(type_id) {
            return Err(BridgeError::NotRegistered {
                type_name: format!("{type_id:?}"),
            });
        }
        if let Some(addr) = self.match_instance(handle, type_id, flags)? {
            return Ok(addr);
        }

        if flags.contains(CastFlags::CONVERT)
            && !flags.contains(CastFlags::CONSTRUCT)
            && self.is_enabled(BridgeProperty::ImplicitConversions)
            && let Some(cleanup) = cleanup
            && let Some(addr) = self.try_convert(handle, type_id, cleanup)?
        {
            return Ok(addr);
        }

        if flags.contains(CastFlags::NEXT_OVERLOAD) {
            return Err(BridgeError::NextOverload);
        }
        Err(BridgeError::TypeMismatch {
            expected: self.registry.type_name(type_id),
            actual: self.heap.kind_name(handle).to_string(),
        })
    }

    fn try_convert(
        &mut self,
        handle: Handle,
        type_id: TypeId,
        cleanup: &mut CleanupList,
    ) -> Result<Option<NonNull<u8>>> {
        let conversions = self.registry.conversions(type_id).to_vec();
        for conversion in conversions {
            let applies = match &conversion.source {
                ConversionSource::Type(source) => {
                    self.heap
                        .get(handle)
                        .and_then(HostObject::as_instance)
                        .is_some_and(|r| {
                            r.is_ready() && self.registry.is_subtype(r.type_id(), *source)
                        })
                }
                ConversionSource::Predicate(predicate) => predicate(self, handle, &mut *cleanup),
            };
            if !applies {
                continue;
            }

            match (conversion.convert)(self, handle) {
                Ok(converted) => {
                    cleanup.append(converted);
                    let matched = self.match_instance(converted, type_id, CastFlags::empty())?;
                    if let Some(addr) = matched {
                        tracing::trace!(
                            from = self.heap.kind_name(handle),
                            to = %self.registry.type_name(type_id),
                            "implicit conversion"
                        );
                        return Ok(Some(addr));
                    }
                }
                Err(err) => {
                    tracing::trace!(%err, "implicit conversion failed, trying next");
                }
            }
        }
        Ok(None)
    }

    /// Typed [`obtain_raw`](Self::obtain_raw).
    pub fn obtain<T: 'static>(
        &mut self,
        handle: Handle,
        flags: CastFlags,
        cleanup: Option<&mut CleanupList>,
    ) -> Result<NonNull<T>> {
        self.obtain_raw(handle, TypeId::of::<T>(), flags, cleanup)
            .map(NonNull::cast)
    }

    /// As [`obtain`](Self::obtain), mapping the host `None` object to `None`.
    pub fn obtain_optional<T: 'static>(
        &mut self,
        handle: Handle,
        flags: CastFlags,
        cleanup: Option<&mut CleanupList>,
    ) -> Result<Option<NonNull<T>>> {
        if matches!(self.heap.try_get(handle)?, HostObject::None) {
            return Ok(None);
        }
        self.obtain(handle, flags, cleanup).map(Some)
    }

    fn expect_instance(&self, handle: Handle, type_id: TypeId) -> Result<NonNull<u8>> {
        self.match_instance(handle, type_id, CastFlags::empty())?
            .ok_or_else(|| BridgeError::TypeMismatch {
                expected: self.registry.type_name(type_id),
                actual: self.heap.kind_name(handle).to_string(),
            })
    }

    /// Borrow the `T` behind `handle` (exact type or registered subtype).
    pub fn borrow<T: 'static>(&self, handle: Handle) -> Result<&T> {
        let addr = self.expect_instance(handle, TypeId::of::<T>())?;
        // SAFETY: a ready record points at an initialised value of its type,
        // and registered subtypes start with their base at offset zero.
        Ok(unsafe { addr.cast::<T>().as_ref() })
    }

    pub fn borrow_mut<T: 'static>(&mut self, handle: Handle) -> Result<&mut T> {
        let addr = self.expect_instance(handle, TypeId::of::<T>())?;
        // SAFETY: as in `borrow`; `&mut self` keeps other bridge access out.
        Ok(unsafe { addr.cast::<T>().as_mut() })
    }

    // =========================================================================
    // Native -> Host
    // =========================================================================

    /// Create and index a new ready wrapper.
    fn wrap(
        &mut self,
        addr: NonNull<u8>,
        type_id: TypeId,
        vtable: NativeVTable,
        ownership: Ownership,
        dynamic_attrs: bool,
    ) -> Handle {
        let record = InstanceRecord::new(
            addr,
            type_id,
            vtable,
            ownership,
            InstanceState::Ready,
            dynamic_attrs,
        );
        self.instances.forget_freed(&mut self.heap);
        let handle = self.heap.allocate(HostObject::Instance(record));
        self.instances.insert(addr, handle);
        tracing::trace!(
            type_name = vtable.type_name,
            ?addr,
            ownership = ownership.as_str(),
            "published new wrapper"
        );
        handle
    }

    /// Abort if any wrapper, of any type, already owns the memory at `ptr`.
    fn claim_ownership(&mut self, ptr: NonNull<u8>) {
        if let Some(owner) = self.instances.find_owner(&self.heap, ptr) {
            fatal(format_args!(
                "double ownership claim: {ptr:?} is already owned by '{}' ({owner:?})",
                self.heap.kind_name(owner)
            ));
        }
    }

    /// Hand out another reference to an existing wrapper.
    fn reuse(&mut self, existing: Handle, ptr: NonNull<u8>, policy: ReturnPolicy) {
        if policy == ReturnPolicy::TakeOwnership {
            self.claim_ownership(ptr);
            if let Some(record) = self
                .heap
                .get_mut(existing)
                .and_then(HostObject::as_instance_mut)
            {
                record.set_ownership(Ownership::HostOwned);
            }
        }
        self.heap.add_ref(existing);
    }

    fn allocate_storage(vtable: &NativeVTable) -> Result<NonNull<u8>> {
        vtable.allocate().ok_or_else(|| BridgeError::AllocationFailed {
            type_name: vtable.type_name.to_string(),
            size: vtable.layout.size(),
        })
    }

    /// Publish the native value at `ptr`, statically typed as `type_id`.
    ///
    /// Polymorphic types are first resolved to their most-derived registered
    /// type. `cleanup` supplies the receiver for
    /// [`ReturnPolicy::ReferenceInternal`].
    ///
    /// # Safety
    ///
    /// `ptr` must point at an initialised value of `type_id`. With
    /// `TakeOwnership` it must come from `Box` (or the global allocator with
    /// the type's layout) and the caller gives up ownership. With `Reference`
    /// policies it must stay valid while the wrapper can reach it.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub unsafe fn publish_raw(
        &mut self,
        type_id: TypeId,
        ptr: NonNull<u8>,
        policy: ReturnPolicy,
        cleanup: Option<&CleanupList>,
    ) -> Result<Handle> {
        let mut descriptor =
            self.registry
                .lookup(type_id)
                .ok_or_else(|| BridgeError::NotRegistered {
                    type_name: format!("{type_id:?}"),
                })?;
        if let Some(lineage) = descriptor.lineage {
            // SAFETY: forwarded from the caller.
            let lineage = unsafe { lineage(ptr.as_ptr()) };
            let dynamic = self.registry.most_derived(type_id, &lineage);
            if let Some(derived) = self.registry.lookup(dynamic) {
                descriptor = derived;
            }
        }
        let type_id = descriptor.type_id;
        let vtable = descriptor.vtable;
        let copy = descriptor.copy;
        let move_fn = descriptor.move_fn;
        let dynamic_attrs = descriptor.has_flag(TypeFlags::DYNAMIC_ATTR);

        match policy.resolve() {
            policy @ (ReturnPolicy::TakeOwnership
            | ReturnPolicy::Reference
            | ReturnPolicy::ReferenceInternal
            | ReturnPolicy::Automatic
            | ReturnPolicy::AutomaticReference) => {
                let parent = match policy {
                    ReturnPolicy::ReferenceInternal => Some(
                        cleanup
                            .and_then(CleanupList::receiver)
                            .ok_or(BridgeError::MissingReceiver)?,
                    ),
                    _ => None,
                };

                let handle = match self.instances.find(&self.heap, ptr, type_id) {
                    Some(existing) => {
                        self.reuse(existing, ptr, policy);
                        existing
                    }
                    None => {
                        let ownership = if policy == ReturnPolicy::TakeOwnership {
                            self.claim_ownership(ptr);
                            Ownership::HostOwned
                        } else {
                            Ownership::Borrowed
                        };
                        self.wrap(ptr, type_id, vtable, ownership, dynamic_attrs)
                    }
                };

                // The wrapper borrows storage owned by the receiver.
                if let Some(parent) = parent {
                    self.heap.keep_alive(handle, parent);
                }
                Ok(handle)
            }
            ReturnPolicy::Copy => {
                let copy = copy.ok_or_else(|| BridgeError::NotCopyable {
                    type_name: vtable.type_name.to_string(),
                    policy: "copy",
                })?;
                let storage = Self::allocate_storage(&vtable)?;
                // SAFETY: `ptr` holds a value of `type_id`, `storage` fits one.
                unsafe { copy(ptr.as_ptr(), storage.as_ptr()) };
                Ok(self.wrap(storage, type_id, vtable, Ownership::HostOwned, dynamic_attrs))
            }
            ReturnPolicy::Move => {
                if move_fn.is_none() && copy.is_none() {
                    return Err(BridgeError::NotCopyable {
                        type_name: vtable.type_name.to_string(),
                        policy: "move",
                    });
                }
                let storage = Self::allocate_storage(&vtable)?;
                // SAFETY: as for copy; the source stays initialised either way.
                unsafe {
                    match (move_fn, copy) {
                        (Some(move_fn), _) => move_fn(ptr.as_ptr(), storage.as_ptr()),
                        (None, Some(copy)) => copy(ptr.as_ptr(), storage.as_ptr()),
                        (None, None) => {}
                    }
                }
                Ok(self.wrap(storage, type_id, vtable, Ownership::HostOwned, dynamic_attrs))
            }
        }
    }

    /// Typed [`publish_raw`](Self::publish_raw).
    ///
    /// # Safety
    ///
    /// See [`publish_raw`](Self::publish_raw).
    pub unsafe fn publish<T: 'static>(
        &mut self,
        ptr: NonNull<T>,
        policy: ReturnPolicy,
        cleanup: Option<&CleanupList>,
    ) -> Result<Handle> {
        // SAFETY: forwarded from the caller.
        unsafe { self.publish_raw(TypeId::of::<T>(), ptr.cast(), policy, cleanup) }
    }

    /// Hand a boxed value to the host, which destroys it with the wrapper.
    pub fn publish_box<T: 'static>(&mut self, value: Box<T>) -> Result<Handle> {
        let type_id = TypeId::of::<T>();
        let Some(descriptor) = self.registry.lookup(type_id) else {
            return Err(BridgeError::NotRegistered {
                type_name: std::any::type_name::<T>().to_string(),
            });
        };
        let vtable = descriptor.vtable;
        let dynamic_attrs = descriptor.has_flag(TypeFlags::DYNAMIC_ATTR);
        let addr = NonNull::from(Box::leak(value)).cast::<u8>();
        Ok(self.wrap(addr, type_id, vtable, Ownership::HostOwned, dynamic_attrs))
    }

    /// Move a by-value result into a fresh host-owned instance.
    pub fn publish_value<T: 'static>(&mut self, value: T) -> Result<Handle> {
        self.publish_box(Box::new(value))
    }

    /// Publish a clone of `value`.
    pub fn publish_copy<T: 'static>(&mut self, value: &T) -> Result<Handle> {
        // SAFETY: `Copy` only reads through the pointer.
        unsafe { self.publish(NonNull::from(value), ReturnPolicy::Copy, None) }
    }

    // =========================================================================
    // Ownership Transfer
    // =========================================================================

    /// Take a host-owned `T` back from the wrapper.
    ///
    /// The wrapper stays alive as an empty shell: it no longer frees the value
    /// and no longer resolves to its address.
    pub fn relinquish<T: 'static>(&mut self, handle: Handle) -> Result<Box<T>> {
        let expected = self.registry.type_name(TypeId::of::<T>());
        let object = self.heap.try_get_mut(handle)?;
        let actual = object.kind_name().to_string();
        let Some(record) = object.as_instance_mut() else {
            return Err(BridgeError::TypeMismatch { expected, actual });
        };
        if record.type_id() != TypeId::of::<T>() {
            return Err(BridgeError::TypeMismatch { expected, actual });
        }
        if !record.is_ready() {
            return Err(BridgeError::InstanceNotReady {
                type_name: actual,
                state: record.state().as_str(),
            });
        }
        if record.ownership() != Ownership::HostOwned {
            return Err(BridgeError::NotOwned { type_name: actual });
        }

        record.set_ownership(Ownership::NativeOwned);
        record.set_state(InstanceState::Relinquished);
        let addr = record.addr();
        self.instances.remove(addr, handle);
        tracing::trace!(type_name = %actual, ?addr, "ownership relinquished");

        // SAFETY: host-owned storage came from the global allocator with T's
        // layout, and the record no longer frees it.
        Ok(unsafe { Box::from_raw(addr.cast::<T>().as_ptr()) })
    }

    // =========================================================================
    // Placeholder Construction
    // =========================================================================

    /// Allocate an unconstructed instance of a `CONSTRUCTIBLE` type.
    pub fn alloc_placeholder(&mut self, type_id: TypeId) -> Result<Handle> {
        let descriptor = self
            .registry
            .lookup(type_id)
            .ok_or_else(|| BridgeError::NotRegistered {
                type_name: format!("{type_id:?}"),
            })?;
        if !descriptor.has_flag(TypeFlags::CONSTRUCTIBLE) {
            return Err(BridgeError::NotConstructible {
                type_name: descriptor.name.to_string(),
            });
        }
        let vtable = descriptor.vtable;
        let dynamic_attrs = descriptor.has_flag(TypeFlags::DYNAMIC_ATTR);
        let storage = Self::allocate_storage(&vtable)?;
        let record = InstanceRecord::new(
            storage,
            type_id,
            vtable,
            Ownership::HostOwned,
            InstanceState::Placeholder,
            dynamic_attrs,
        );
        Ok(self.heap.allocate(HostObject::Instance(record)))
    }

    /// Initialise a placeholder and make it ready.
    pub fn construct<T: 'static>(&mut self, handle: Handle, value: T) -> Result<()> {
        let type_id = TypeId::of::<T>();
        let expected = self.registry.type_name(type_id);
        let object = self.heap.try_get_mut(handle)?;
        let actual = object.kind_name().to_string();
        let record = match object.as_instance_mut() {
            Some(record) if record.type_id() == type_id => record,
            _ => return Err(BridgeError::TypeMismatch { expected, actual }),
        };
        let state = match record.state() {
            InstanceState::Placeholder => None,
            InstanceState::Ready => Some("already constructed"),
            other => Some(other.as_str()),
        };
        if let Some(state) = state {
            return Err(BridgeError::InstanceNotReady {
                type_name: actual,
                state,
            });
        }

        let addr = record.addr();
        // SAFETY: placeholder storage was allocated with T's layout and holds
        // no value yet.
        unsafe { addr.cast::<T>().as_ptr().write(value) };
        record.set_state(InstanceState::Ready);
        self.instances.insert(addr, handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TypeBuilder;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Counter {
        value: i32,
        drops: Option<Rc<Cell<u32>>>,
    }

    impl Clone for Counter {
        fn clone(&self) -> Self {
            Self {
                value: self.value,
                drops: self.drops.clone(),
            }
        }
    }

    impl Drop for Counter {
        fn drop(&mut self) {
            if let Some(drops) = &self.drops {
                drops.set(drops.get() + 1);
            }
        }
    }

    fn bridge() -> Bridge {
        let mut bridge = Bridge::new();
        bridge.register(
            TypeBuilder::<Counter>::new("Counter")
                .copyable()
                .movable()
                .constructible()
                .build(),
        );
        bridge
    }

    #[test]
    fn resolve_automatic_policies() {
        assert_eq!(ReturnPolicy::Automatic.resolve(), ReturnPolicy::TakeOwnership);
        assert_eq!(ReturnPolicy::AutomaticReference.resolve(), ReturnPolicy::Reference);
        assert_eq!(ReturnPolicy::Move.resolve(), ReturnPolicy::Move);
    }

    #[test]
    fn obtain_exact_type_returns_same_address() {
        let mut bridge = bridge();
        let mut value = Counter {
            value: 3,
            drops: None,
        };
        let ptr = NonNull::from(&mut value);
        let handle = unsafe { bridge.publish(ptr, ReturnPolicy::Reference, None) }.unwrap();

        let obtained = bridge.obtain::<Counter>(handle, CastFlags::empty(), None).unwrap();
        assert_eq!(obtained, ptr);
        assert_eq!(bridge.borrow::<Counter>(handle).unwrap().value, 3);
        bridge.heap_mut().release(handle);
    }

    #[test]
    fn obtain_mismatch_or_fallback_signal() {
        let mut bridge = bridge();
        let int = bridge.heap_mut().allocate(HostObject::Int(1));

        let err = bridge.obtain::<Counter>(int, CastFlags::empty(), None).unwrap_err();
        assert_eq!(
            err,
            BridgeError::TypeMismatch {
                expected: "Counter".to_string(),
                actual: "int".to_string()
            }
        );
        let err = bridge
            .obtain::<Counter>(int, CastFlags::NEXT_OVERLOAD, None)
            .unwrap_err();
        assert!(err.is_next_overload());
    }

    #[test]
    fn obtain_optional_maps_none() {
        let mut bridge = bridge();
        let none = bridge.heap().none();
        assert_eq!(
            bridge.obtain_optional::<Counter>(none, CastFlags::empty(), None).unwrap(),
            None
        );
    }

    #[test]
    fn copy_creates_distinct_owned_wrapper() {
        let mut bridge = bridge();
        let drops = Rc::new(Cell::new(0));
        let value = Counter {
            value: 9,
            drops: Some(drops.clone()),
        };

        let copy = bridge.publish_copy(&value).unwrap();
        assert_eq!(bridge.borrow::<Counter>(copy).unwrap().value, 9);
        bridge.heap_mut().release(copy);
        assert_eq!(drops.get(), 1);
        drop(value);
        assert_eq!(drops.get(), 2);
    }

    #[test]
    fn reference_internal_requires_receiver() {
        let mut bridge = bridge();
        let mut value = Counter::default();
        let cleanup = CleanupList::new(None);
        let err = unsafe {
            bridge.publish(
                NonNull::from(&mut value),
                ReturnPolicy::ReferenceInternal,
                Some(&cleanup),
            )
        }
        .unwrap_err();
        assert_eq!(err, BridgeError::MissingReceiver);
        cleanup.release(bridge.heap_mut());
    }

    #[test]
    fn placeholder_lifecycle() {
        let mut bridge = bridge();
        let handle = bridge.alloc_placeholder(TypeId::of::<Counter>()).unwrap();

        let err = bridge.obtain::<Counter>(handle, CastFlags::empty(), None).unwrap_err();
        assert!(matches!(err, BridgeError::InstanceNotReady { .. }));
        let err = bridge
            .obtain::<Counter>(handle, CastFlags::NEXT_OVERLOAD, None)
            .unwrap_err();
        assert!(err.is_next_overload());
        assert!(
            bridge
                .obtain::<Counter>(handle, CastFlags::CONSTRUCT, None)
                .is_ok()
        );

        bridge
            .construct(
                handle,
                Counter {
                    value: 4,
                    drops: None,
                },
            )
            .unwrap();
        assert_eq!(bridge.borrow::<Counter>(handle).unwrap().value, 4);

        let err = bridge.construct(handle, Counter::default()).unwrap_err();
        assert_eq!(
            err,
            BridgeError::InstanceNotReady {
                type_name: "Counter".to_string(),
                state: "already constructed"
            }
        );
        bridge.heap_mut().release(handle);
    }

    #[test]
    fn placeholder_requires_constructible() {
        struct Plain;
        let mut bridge = Bridge::new();
        bridge.register(TypeBuilder::<Plain>::new("Plain").build());
        let err = bridge.alloc_placeholder(TypeId::of::<Plain>()).unwrap_err();
        assert!(matches!(err, BridgeError::NotConstructible { .. }));
    }

    #[test]
    fn relinquish_rejects_borrowed() {
        let mut bridge = bridge();
        let mut value = Counter::default();
        let handle =
            unsafe { bridge.publish(NonNull::from(&mut value), ReturnPolicy::Reference, None) }
                .unwrap();
        let result = bridge.relinquish::<Counter>(handle);
        assert!(matches!(result, Err(BridgeError::NotOwned { .. })));
        bridge.heap_mut().release(handle);
    }

    #[test]
    fn unregistered_type_is_reported() {
        struct Unknown;
        let mut bridge = bridge();
        let err = bridge.publish_value(Unknown).unwrap_err();
        assert!(matches!(err, BridgeError::NotRegistered { .. }));
    }
}
