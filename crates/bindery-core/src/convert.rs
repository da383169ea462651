//! Conversion traits between host primitive objects and Rust values.
//!
//! - [`FromHost`]: read a Rust value out of a host object
//! - [`IntoHost`]: allocate a host object for a Rust value
//!
//! These cover the primitive kinds only. Registered native types go through
//! the casting engine, which knows about identity and ownership.
//!
//! ## Example
//!
//! ```ignore
//! let handle = 42i32.into_host(&mut heap);
//! let value = i32::from_host(&heap, handle)?;
//! ```

use crate::error::ConversionError;
use crate::heap::{Handle, HostHeap};
use crate::object::HostObject;

/// Extract a value from a host object.
pub trait FromHost: Sized {
    /// Read the object behind `handle`.
    ///
    /// Stale handles report a mismatch against `"<freed>"`.
    fn from_host(heap: &HostHeap, handle: Handle) -> Result<Self, ConversionError>;
}

/// Convert a value into a new host object.
pub trait IntoHost {
    /// Allocate the host object; the returned handle owns one reference.
    fn into_host(self, heap: &mut HostHeap) -> Handle;
}

fn mismatch(heap: &HostHeap, handle: Handle, expected: &'static str) -> ConversionError {
    ConversionError::TypeMismatch {
        expected,
        actual: heap.kind_name(handle),
    }
}

// ============================================================================
// Integer implementations
// ============================================================================

macro_rules! impl_host_int {
    ($($ty:ty),*) => {
        $(
            impl FromHost for $ty {
                fn from_host(heap: &HostHeap, handle: Handle) -> Result<Self, ConversionError> {
                    match heap.get(handle) {
                        Some(HostObject::Int(v)) => <$ty>::try_from(*v).map_err(|_| {
                            ConversionError::IntegerOverflow {
                                value: *v,
                                target_type: stringify!($ty),
                            }
                        }),
                        _ => Err(mismatch(heap, handle, "int")),
                    }
                }
            }

            impl IntoHost for $ty {
                fn into_host(self, heap: &mut HostHeap) -> Handle {
                    heap.allocate(HostObject::Int(self as i64))
                }
            }
        )*
    };
}

impl_host_int!(i8, i16, i32, i64, u8, u16, u32);

// u64 reinterprets the bits so the full range survives a round trip.
impl FromHost for u64 {
    fn from_host(heap: &HostHeap, handle: Handle) -> Result<Self, ConversionError> {
        match heap.get(handle) {
            Some(HostObject::Int(v)) => Ok(*v as u64),
            _ => Err(mismatch(heap, handle, "int")),
        }
    }
}

impl IntoHost for u64 {
    fn into_host(self, heap: &mut HostHeap) -> Handle {
        heap.allocate(HostObject::Int(self as i64))
    }
}

// ============================================================================
// Float implementations
// ============================================================================

impl FromHost for f64 {
    fn from_host(heap: &HostHeap, handle: Handle) -> Result<Self, ConversionError> {
        match heap.get(handle) {
            Some(HostObject::Float(v)) => Ok(*v),
            Some(HostObject::Int(v)) => Ok(*v as f64),
            _ => Err(mismatch(heap, handle, "float")),
        }
    }
}

impl IntoHost for f64 {
    fn into_host(self, heap: &mut HostHeap) -> Handle {
        heap.allocate(HostObject::Float(self))
    }
}

impl FromHost for f32 {
    fn from_host(heap: &HostHeap, handle: Handle) -> Result<Self, ConversionError> {
        f64::from_host(heap, handle).map(|v| v as f32)
    }
}

impl IntoHost for f32 {
    fn into_host(self, heap: &mut HostHeap) -> Handle {
        heap.allocate(HostObject::Float(self as f64))
    }
}

// ============================================================================
// Bool, strings and unit
// ============================================================================

impl FromHost for bool {
    fn from_host(heap: &HostHeap, handle: Handle) -> Result<Self, ConversionError> {
        match heap.get(handle) {
            Some(HostObject::Bool(v)) => Ok(*v),
            _ => Err(mismatch(heap, handle, "bool")),
        }
    }
}

impl IntoHost for bool {
    fn into_host(self, heap: &mut HostHeap) -> Handle {
        heap.allocate(HostObject::Bool(self))
    }
}

impl FromHost for String {
    fn from_host(heap: &HostHeap, handle: Handle) -> Result<Self, ConversionError> {
        match heap.get(handle) {
            Some(HostObject::Str(s)) => Ok(s.clone()),
            _ => Err(mismatch(heap, handle, "str")),
        }
    }
}

impl IntoHost for String {
    fn into_host(self, heap: &mut HostHeap) -> Handle {
        heap.allocate(HostObject::Str(self))
    }
}

impl IntoHost for &str {
    fn into_host(self, heap: &mut HostHeap) -> Handle {
        heap.allocate(HostObject::Str(self.to_string()))
    }
}

impl FromHost for () {
    fn from_host(heap: &HostHeap, handle: Handle) -> Result<Self, ConversionError> {
        match heap.get(handle) {
            Some(HostObject::None) => Ok(()),
            _ => Err(mismatch(heap, handle, "NoneType")),
        }
    }
}

impl IntoHost for () {
    fn into_host(self, heap: &mut HostHeap) -> Handle {
        heap.none()
    }
}

/// `None` maps to `Option::None`; anything else must convert to `T`.
impl<T: FromHost> FromHost for Option<T> {
    fn from_host(heap: &HostHeap, handle: Handle) -> Result<Self, ConversionError> {
        match heap.get(handle) {
            Some(HostObject::None) => Ok(None),
            _ => T::from_host(heap, handle).map(Some),
        }
    }
}

impl<T: IntoHost> IntoHost for Option<T> {
    fn into_host(self, heap: &mut HostHeap) -> Handle {
        match self {
            Some(value) => value.into_host(heap),
            None => heap.none(),
        }
    }
}
