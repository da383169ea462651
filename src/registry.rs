//! Type registry: native type identity to descriptor and host type object.
//!
//! # Storage Model
//!
//! - **Descriptors**: one [`TypeDescriptor`] per native type, keyed by `TypeId`
//! - **Reverse indexes**: host type-object handle and name hash to `TypeId`
//! - **Implicit conversions**: per destination type, in registration order
//!
//! Descriptors are immutable after registration apart from the opaque `extra`
//! payload slot.
//!
//! # Inheritance
//!
//! Base types are declared on the [`TypeBuilder`] and must be registered
//! first. Upcasts reuse the native address unchanged, so a derived type must
//! place its base at offset zero (`#[repr(C)]`, base as the first field).
//! When a lineage offers several registered ancestors at the same distance,
//! the first-declared base wins.

use std::any::{Any, TypeId};
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use bitflags::bitflags;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use bindery_core::{
    Handle, HostHeap, HostObject, NativeVTable, RegistrationError, Result, TypeHash, TypeObject,
    fatal,
};

use crate::Bridge;
use crate::cleanup::CleanupList;

bitflags! {
    /// Capabilities declared when a native type is registered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeFlags: u32 {
        /// Values can be cloned into a new host-owned instance.
        const COPYABLE = 1 << 0;
        /// Values can be moved out, leaving `Default` behind.
        const MOVABLE = 1 << 1;
        /// Storage can be allocated before the value is constructed.
        const CONSTRUCTIBLE = 1 << 2;
        /// No type may declare this one as a base.
        const FINAL = 1 << 3;
        /// Instances carry a per-instance attribute table.
        const DYNAMIC_ATTR = 1 << 4;
        /// Values report their dynamic type at runtime.
        const POLYMORPHIC = 1 << 5;
    }
}

/// A native type whose values know their dynamic type.
///
/// Implemented by base types that may be published through a pointer to a
/// more-derived value.
pub trait Polymorphic: 'static {
    /// The dynamic type of this value followed by its ancestors, nearest first.
    ///
    /// Types in the lineage need not be registered.
    fn lineage(&self) -> Vec<TypeId>;
}

/// Clones the value at `src` into uninitialised storage at `dst`.
pub type CopyFn = unsafe fn(src: *const u8, dst: *mut u8);
/// Moves the value at `src` into `dst`, leaving `Default` at `src`.
pub type MoveFn = unsafe fn(src: *mut u8, dst: *mut u8);
/// Reports the runtime lineage of the value at `ptr`.
pub type LineageFn = unsafe fn(ptr: *const u8) -> Vec<TypeId>;

/// Creates a new instance of the destination type from a host object.
///
/// Returns a handle owning one reference.
pub type ConvertFn = Arc<dyn Fn(&mut Bridge, Handle) -> Result<Handle>>;
/// Decides whether a host object is a candidate for a conversion.
///
/// May create temporaries while testing; they go to the call's cleanup list.
pub type PredicateFn = Arc<dyn Fn(&mut Bridge, Handle, &mut CleanupList) -> bool>;

/// Registration record for one native type.
pub struct TypeDescriptor {
    /// Native identity.
    pub type_id: TypeId,
    /// Registered name.
    pub name: &'static str,
    /// Hash of the registered name.
    pub hash: TypeHash,
    /// Host type object, set at registration.
    pub type_handle: Handle,
    /// Layout and destructor.
    pub vtable: NativeVTable,
    pub copy: Option<CopyFn>,
    pub move_fn: Option<MoveFn>,
    /// Declared bases, in declaration order.
    pub bases: SmallVec<[TypeId; 2]>,
    pub flags: TypeFlags,
    pub lineage: Option<LineageFn>,
    extra: Option<Box<dyn Any>>,
}

impl TypeDescriptor {
    pub fn has_flag(&self, flag: TypeFlags) -> bool {
        self.flags.contains(flag)
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("hash", &self.hash)
            .field("type_handle", &self.type_handle)
            .field("size", &self.vtable.layout.size())
            .field("bases", &self.bases.len())
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Builder
// ============================================================================

unsafe fn copy_thunk<T: Clone>(src: *const u8, dst: *mut u8) {
    // SAFETY: caller passes an initialised T and T-sized storage.
    unsafe { dst.cast::<T>().write((*src.cast::<T>()).clone()) }
}

unsafe fn move_thunk<T: Default>(src: *mut u8, dst: *mut u8) {
    // SAFETY: caller passes an initialised T and T-sized storage.
    unsafe { dst.cast::<T>().write(std::mem::take(&mut *src.cast::<T>())) }
}

unsafe fn lineage_thunk<T: Polymorphic>(ptr: *const u8) -> Vec<TypeId> {
    // SAFETY: caller passes an initialised T.
    unsafe { (*ptr.cast::<T>()).lineage() }
}

/// Builds a [`TypeDescriptor`] for `T`.
///
/// ```ignore
/// let descriptor = TypeBuilder::<Widget>::new("Widget")
///     .copyable()
///     .movable()
///     .build();
/// bridge.register(descriptor);
/// ```
pub struct TypeBuilder<T> {
    name: &'static str,
    flags: TypeFlags,
    copy: Option<CopyFn>,
    move_fn: Option<MoveFn>,
    bases: SmallVec<[TypeId; 2]>,
    lineage: Option<LineageFn>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> TypeBuilder<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            flags: TypeFlags::empty(),
            copy: None,
            move_fn: None,
            bases: SmallVec::new(),
            lineage: None,
            _marker: PhantomData,
        }
    }

    /// Allow placeholder allocation followed by in-place construction.
    pub fn constructible(mut self) -> Self {
        self.flags |= TypeFlags::CONSTRUCTIBLE;
        self
    }

    pub fn final_type(mut self) -> Self {
        self.flags |= TypeFlags::FINAL;
        self
    }

    /// Give every instance a per-instance attribute table.
    pub fn dynamic_attrs(mut self) -> Self {
        self.flags |= TypeFlags::DYNAMIC_ATTR;
        self
    }

    /// Declare `B` as a base type.
    ///
    /// # Safety
    ///
    /// A `T` must be usable as a `B` at the same address: `T` is `#[repr(C)]`
    /// (or `#[repr(transparent)]`) with a `B` as its first field, transitively.
    pub unsafe fn base<B: 'static>(mut self) -> Self {
        self.bases.push(TypeId::of::<B>());
        self
    }

    pub fn build(self) -> TypeDescriptor {
        TypeDescriptor {
            type_id: TypeId::of::<T>(),
            name: self.name,
            hash: TypeHash::from_name(self.name),
            type_handle: Handle::NULL,
            vtable: NativeVTable::of::<T>(self.name),
            copy: self.copy,
            move_fn: self.move_fn,
            bases: self.bases,
            flags: self.flags,
            lineage: self.lineage,
            extra: None,
        }
    }
}

impl<T: Clone + 'static> TypeBuilder<T> {
    pub fn copyable(mut self) -> Self {
        self.flags |= TypeFlags::COPYABLE;
        self.copy = Some(copy_thunk::<T>);
        self
    }
}

impl<T: Default + 'static> TypeBuilder<T> {
    /// Moves use `mem::take`, so the source keeps `T::default()`.
    pub fn movable(mut self) -> Self {
        self.flags |= TypeFlags::MOVABLE;
        self.move_fn = Some(move_thunk::<T>);
        self
    }
}

impl<T: Polymorphic> TypeBuilder<T> {
    pub fn polymorphic(mut self) -> Self {
        self.flags |= TypeFlags::POLYMORPHIC;
        self.lineage = Some(lineage_thunk::<T>);
        self
    }
}

// ============================================================================
// Implicit Conversions
// ============================================================================

/// Which host objects an implicit conversion applies to.
#[derive(Clone)]
pub enum ConversionSource {
    /// Instances of a registered type or its subtypes.
    Type(TypeId),
    /// Objects accepted by a predicate.
    Predicate(PredicateFn),
}

/// Edge allowing objects of one kind to be used where another type is expected.
#[derive(Clone)]
pub struct ImplicitConversion {
    pub source: ConversionSource,
    pub convert: ConvertFn,
}

impl fmt::Debug for ImplicitConversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ConversionSource::Type(id) => write!(f, "ImplicitConversion(from {id:?})"),
            ConversionSource::Predicate(_) => write!(f, "ImplicitConversion(predicate)"),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Registered native types of one bridge.
#[derive(Default)]
pub struct TypeRegistry {
    types: FxHashMap<TypeId, TypeDescriptor>,
    /// Reverse index: host type object -> native type.
    by_handle: FxHashMap<Handle, TypeId>,
    /// Reverse index: name hash -> native type.
    by_hash: FxHashMap<TypeHash, TypeId>,
    /// Destination type -> conversions, in registration order.
    conversions: FxHashMap<TypeId, Vec<ImplicitConversion>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    // ==========================================================================
    // Registration
    // ==========================================================================

    /// Register a descriptor, allocating its host type object.
    ///
    /// Aborts the process if the type or its name is already registered or
    /// its bases are invalid; a mis-registered binding cannot be used safely.
    pub fn register(&mut self, heap: &mut HostHeap, descriptor: TypeDescriptor) -> Handle {
        match self.try_register(heap, descriptor) {
            Ok(handle) => handle,
            Err(err) => fatal(err),
        }
    }

    /// Register a descriptor, reporting configuration problems as errors.
    pub fn try_register(
        &mut self,
        heap: &mut HostHeap,
        mut descriptor: TypeDescriptor,
    ) -> std::result::Result<Handle, RegistrationError> {
        if self.types.contains_key(&descriptor.type_id) {
            return Err(RegistrationError::DuplicateType(descriptor.name.to_string()));
        }
        if self.by_hash.contains_key(&descriptor.hash) {
            return Err(RegistrationError::DuplicateName(descriptor.name.to_string()));
        }
        for base in &descriptor.bases {
            let Some(base_descriptor) = self.types.get(base) else {
                return Err(RegistrationError::UnknownBase {
                    type_name: descriptor.name.to_string(),
                    base: format!("{base:?}"),
                });
            };
            if base_descriptor.has_flag(TypeFlags::FINAL) {
                return Err(RegistrationError::FinalBase {
                    type_name: descriptor.name.to_string(),
                    base: base_descriptor.name.to_string(),
                });
            }
        }

        let handle = heap.allocate_immortal(HostObject::Type(TypeObject {
            type_id: descriptor.type_id,
            name: descriptor.name,
        }));
        descriptor.type_handle = handle;

        tracing::debug!(
            name = descriptor.name,
            hash = %descriptor.hash,
            bases = descriptor.bases.len(),
            "registered native type"
        );

        self.by_handle.insert(handle, descriptor.type_id);
        self.by_hash.insert(descriptor.hash, descriptor.type_id);
        self.types.insert(descriptor.type_id, descriptor);
        Ok(handle)
    }

    /// Append an implicit conversion to `dest`.
    pub fn add_conversion(
        &mut self,
        dest: TypeId,
        conversion: ImplicitConversion,
    ) -> std::result::Result<(), RegistrationError> {
        if !self.types.contains_key(&dest) {
            return Err(RegistrationError::NotRegistered(format!("{dest:?}")));
        }
        if let ConversionSource::Type(source) = &conversion.source
            && !self.types.contains_key(source)
        {
            return Err(RegistrationError::NotRegistered(format!("{source:?}")));
        }
        self.conversions.entry(dest).or_default().push(conversion);
        Ok(())
    }

    // ==========================================================================
    // Lookup
    // ==========================================================================

    pub fn lookup(&self, type_id: TypeId) -> Option<&TypeDescriptor> {
        self.types.get(&type_id)
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.types.contains_key(&type_id)
    }

    /// Native type represented by a host type object.
    pub fn lookup_by_handle(&self, handle: Handle) -> Option<TypeId> {
        self.by_handle.get(&handle).copied()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<&TypeDescriptor> {
        self.by_hash
            .get(&TypeHash::from_name(name))
            .and_then(|id| self.types.get(id))
    }

    /// Registered name, or the `TypeId` debug form for unknown types.
    pub fn type_name(&self, type_id: TypeId) -> String {
        self.types
            .get(&type_id)
            .map_or_else(|| format!("{type_id:?}"), |d| d.name.to_string())
    }

    /// Conversions targeting `dest`, in registration order.
    pub fn conversions(&self, dest: TypeId) -> &[ImplicitConversion] {
        self.conversions.get(&dest).map_or(&[], Vec::as_slice)
    }

    // ==========================================================================
    // Inheritance
    // ==========================================================================

    /// `type_id` followed by its registered ancestors, breadth-first.
    ///
    /// Bases at the same depth keep declaration order; shared ancestors
    /// (diamonds) appear once.
    pub fn ancestors(&self, type_id: TypeId) -> Vec<TypeId> {
        let mut order = Vec::new();
        let mut seen = FxHashSet::default();
        let mut queue = VecDeque::from([type_id]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            order.push(current);
            if let Some(descriptor) = self.types.get(&current) {
                queue.extend(descriptor.bases.iter().copied());
            }
        }
        order
    }

    /// Whether `derived` is `base` or declares it as an ancestor.
    pub fn is_subtype(&self, derived: TypeId, base: TypeId) -> bool {
        derived == base || self.ancestors(derived).contains(&base)
    }

    /// Most specific registered type in `lineage` that is `static_id` or derives from it.
    ///
    /// `lineage` is the runtime-reported dynamic type followed by its
    /// ancestors, nearest first. Defaults to `static_id`.
    pub fn most_derived(&self, static_id: TypeId, lineage: &[TypeId]) -> TypeId {
        lineage
            .iter()
            .copied()
            .find(|id| self.types.contains_key(id) && self.is_subtype(*id, static_id))
            .unwrap_or(static_id)
    }

    // ==========================================================================
    // Extra Payload
    // ==========================================================================

    /// Attach an opaque payload to a registered type, replacing any previous one.
    pub fn set_extra(
        &mut self,
        type_id: TypeId,
        extra: Box<dyn Any>,
    ) -> std::result::Result<(), RegistrationError> {
        let descriptor = self
            .types
            .get_mut(&type_id)
            .ok_or_else(|| RegistrationError::NotRegistered(format!("{type_id:?}")))?;
        descriptor.extra = Some(extra);
        Ok(())
    }

    pub fn extra<E: 'static>(&self, type_id: TypeId) -> Option<&E> {
        self.types.get(&type_id)?.extra.as_ref()?.downcast_ref()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.types.len())
            .field("conversions", &self.conversions.len())
            .finish()
    }
}
