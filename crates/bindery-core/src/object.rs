//! Host object model and the per-instance record binding a host object to
//! native memory.

use std::alloc::{self, Layout};
use std::any::{Any, TypeId};
use std::fmt;
use std::ptr::NonNull;

use crate::Handle;

/// Who is responsible for destroying the native memory behind an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// Native code frees the memory; the wrapper never does.
    NativeOwned,
    /// The memory is destroyed when the host wrapper is freed.
    HostOwned,
    /// Neither side deletes through this record.
    Borrowed,
}

impl Ownership {
    /// Human-readable name used in diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Ownership::NativeOwned => "native-owned",
            Ownership::HostOwned => "host-owned",
            Ownership::Borrowed => "borrowed",
        }
    }
}

/// Construction state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    /// Storage is allocated but the value has not been constructed yet.
    Placeholder,
    /// Fully constructed and usable.
    Ready,
    /// Ownership was handed back to native code; the wrapper is a dead shell.
    Relinquished,
}

impl InstanceState {
    /// Human-readable name used in diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Placeholder => "not yet constructed",
            InstanceState::Ready => "ready",
            InstanceState::Relinquished => "relinquished to native code",
        }
    }
}

/// Type-erased layout and destructor of a native type.
///
/// Copied into every [`InstanceRecord`] so the heap can destroy host-owned
/// instances without consulting the type registry.
#[derive(Clone, Copy)]
pub struct NativeVTable {
    /// Registered type name.
    pub type_name: &'static str,
    /// Size and alignment of the native value.
    pub layout: Layout,
    /// Drops the value in place without freeing its storage.
    pub drop_in_place: unsafe fn(*mut u8),
}

impl NativeVTable {
    /// Build the vtable for a concrete Rust type.
    pub fn of<T: 'static>(type_name: &'static str) -> Self {
        unsafe fn drop_thunk<T>(ptr: *mut u8) {
            // SAFETY: caller guarantees `ptr` points at an initialised T.
            unsafe { std::ptr::drop_in_place(ptr.cast::<T>()) }
        }

        Self {
            type_name,
            layout: Layout::new::<T>(),
            drop_in_place: drop_thunk::<T>,
        }
    }

    /// Allocate uninitialised storage for one value.
    ///
    /// Zero-sized types get a dangling, well-aligned address. Returns `None`
    /// when the global allocator fails.
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        if self.layout.size() == 0 {
            // Non-zero alignment is a power of two, so this is a valid dangling address.
            return NonNull::new(self.layout.align() as *mut u8);
        }
        // SAFETY: layout has non-zero size.
        NonNull::new(unsafe { alloc::alloc(self.layout) })
    }

    /// Free storage obtained from [`NativeVTable::allocate`] or `Box::<T>::new`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from the global allocator with this layout and must not
    /// be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        if self.layout.size() != 0 {
            // SAFETY: forwarded from the caller.
            unsafe { alloc::dealloc(ptr.as_ptr(), self.layout) }
        }
    }
}

impl fmt::Debug for NativeVTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeVTable")
            .field("type_name", &self.type_name)
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

/// Record binding a host object to a native address.
pub struct InstanceRecord {
    addr: NonNull<u8>,
    type_id: TypeId,
    vtable: NativeVTable,
    ownership: Ownership,
    state: InstanceState,
    /// Per-instance attributes, present only for types declaring dynamic attributes.
    attrs: Option<Vec<(String, Handle)>>,
}

impl InstanceRecord {
    /// Create a record for a native value at `addr`.
    pub fn new(
        addr: NonNull<u8>,
        type_id: TypeId,
        vtable: NativeVTable,
        ownership: Ownership,
        state: InstanceState,
        dynamic_attrs: bool,
    ) -> Self {
        Self {
            addr,
            type_id,
            vtable,
            ownership,
            state,
            attrs: dynamic_attrs.then(Vec::new),
        }
    }

    /// Native address of the wrapped value.
    #[inline]
    pub fn addr(&self) -> NonNull<u8> {
        self.addr
    }

    /// Native type of the wrapped value.
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Registered type name.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.vtable.type_name
    }

    #[inline]
    pub fn vtable(&self) -> &NativeVTable {
        &self.vtable
    }

    #[inline]
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    #[inline]
    pub fn state(&self) -> InstanceState {
        self.state
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == InstanceState::Ready
    }

    pub fn set_ownership(&mut self, ownership: Ownership) {
        self.ownership = ownership;
    }

    pub fn set_state(&mut self, state: InstanceState) {
        self.state = state;
    }

    /// Whether this instance carries a dynamic attribute table.
    pub fn has_dynamic_attrs(&self) -> bool {
        self.attrs.is_some()
    }

    /// Look up a dynamic attribute.
    pub fn attr(&self, name: &str) -> Option<Handle> {
        self.attrs
            .as_ref()?
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    }

    /// Store a dynamic attribute, returning the displaced value.
    ///
    /// The record takes over the caller's reference to `value`; the returned
    /// handle's reference now belongs to the caller. Returns `Err(value)` when
    /// the instance has no attribute table.
    pub fn set_attr(&mut self, name: &str, value: Handle) -> Result<Option<Handle>, Handle> {
        let Some(attrs) = self.attrs.as_mut() else {
            return Err(value);
        };
        if let Some(slot) = attrs.iter_mut().find(|(key, _)| key == name) {
            return Ok(Some(std::mem::replace(&mut slot.1, value)));
        }
        attrs.push((name.to_string(), value));
        Ok(None)
    }

    /// Destroy the native value if the host owns it.
    ///
    /// Placeholders only release their storage. Called exactly once, by the
    /// heap, when the wrapper is freed.
    pub(crate) fn finalize(&mut self) {
        if self.ownership != Ownership::HostOwned {
            return;
        }
        // SAFETY: a host-owned record is the unique owner of `addr`, which was
        // allocated with `vtable.layout`; the value is initialised iff Ready.
        unsafe {
            if self.state == InstanceState::Ready {
                (self.vtable.drop_in_place)(self.addr.as_ptr());
            }
            self.vtable.deallocate(self.addr);
        }
        self.ownership = Ownership::Borrowed;
        self.state = InstanceState::Relinquished;
    }
}

impl fmt::Debug for InstanceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRecord")
            .field("type", &self.vtable.type_name)
            .field("addr", &self.addr)
            .field("ownership", &self.ownership)
            .field("state", &self.state)
            .finish()
    }
}

/// Index into the bridge's function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

/// Host type object standing for a registered native type.
#[derive(Debug, Clone)]
pub struct TypeObject {
    /// The native type.
    pub type_id: TypeId,
    /// The registered name.
    pub name: &'static str,
}

/// An object living in the host heap.
pub enum HostObject {
    /// The `None` singleton.
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Handle>),
    List(Vec<Handle>),
    /// String-keyed mapping, insertion ordered.
    Dict(Vec<(String, Handle)>),
    /// Wrapper around a native value.
    Instance(InstanceRecord),
    /// Type object of a registered native type.
    Type(TypeObject),
    /// Callable entry in the bridge's function table.
    Function(FunctionId),
    /// A function bound to a receiver.
    BoundMethod { receiver: Handle, function: Handle },
    /// Opaque native payload owned by the host, dropped when freed.
    Capsule(Box<dyn Any>),
}

impl HostObject {
    /// Host-side type name of this object.
    pub fn kind_name(&self) -> &'static str {
        match self {
            HostObject::None => "NoneType",
            HostObject::Bool(_) => "bool",
            HostObject::Int(_) => "int",
            HostObject::Float(_) => "float",
            HostObject::Str(_) => "str",
            HostObject::Tuple(_) => "tuple",
            HostObject::List(_) => "list",
            HostObject::Dict(_) => "dict",
            HostObject::Instance(record) => record.type_name(),
            HostObject::Type(_) => "type",
            HostObject::Function(_) => "function",
            HostObject::BoundMethod { .. } => "method",
            HostObject::Capsule(_) => "capsule",
        }
    }

    /// The instance record, if this object wraps a native value.
    pub fn as_instance(&self) -> Option<&InstanceRecord> {
        match self {
            HostObject::Instance(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_instance_mut(&mut self) -> Option<&mut InstanceRecord> {
        match self {
            HostObject::Instance(record) => Some(record),
            _ => None,
        }
    }

    /// Handles this object holds a reference to (collector traversal).
    pub fn references(&self) -> Vec<Handle> {
        match self {
            HostObject::Tuple(items) | HostObject::List(items) => items.clone(),
            HostObject::Dict(entries) => entries.iter().map(|(_, value)| *value).collect(),
            HostObject::BoundMethod { receiver, function } => vec![*receiver, *function],
            HostObject::Instance(record) => record
                .attrs
                .as_ref()
                .map(|attrs| attrs.iter().map(|(_, value)| *value).collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Detach every held reference, leaving the object empty (collector clear).
    ///
    /// The caller becomes responsible for releasing the returned handles.
    pub fn take_references(&mut self) -> Vec<Handle> {
        match self {
            HostObject::Tuple(items) | HostObject::List(items) => std::mem::take(items),
            HostObject::Dict(entries) => std::mem::take(entries)
                .into_iter()
                .map(|(_, value)| value)
                .collect(),
            HostObject::BoundMethod { receiver, function } => {
                let refs = vec![*receiver, *function];
                *receiver = Handle::NULL;
                *function = Handle::NULL;
                refs
            }
            HostObject::Instance(record) => record
                .attrs
                .as_mut()
                .map(|attrs| std::mem::take(attrs).into_iter().map(|(_, v)| v).collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostObject::None => write!(f, "None"),
            HostObject::Bool(v) => write!(f, "Bool({v})"),
            HostObject::Int(v) => write!(f, "Int({v})"),
            HostObject::Float(v) => write!(f, "Float({v})"),
            HostObject::Str(s) => write!(f, "Str({s:?})"),
            HostObject::Tuple(items) => write!(f, "Tuple({items:?})"),
            HostObject::List(items) => write!(f, "List({items:?})"),
            HostObject::Dict(entries) => write!(f, "Dict({entries:?})"),
            HostObject::Instance(record) => write!(f, "{record:?}"),
            HostObject::Type(ty) => write!(f, "Type({})", ty.name),
            HostObject::Function(id) => write!(f, "Function({})", id.0),
            HostObject::BoundMethod { receiver, function } => {
                write!(f, "BoundMethod({receiver:?}, {function:?})")
            }
            HostObject::Capsule(_) => write!(f, "Capsule(...)"),
        }
    }
}
