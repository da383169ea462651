//! Host runtime primitives for bindery.
//!
//! The object heap every bridge component talks to: generational handles,
//! reference counting, native instance records, keep-alive edges and the
//! cycle collector that reclaims cycles running through them.

mod collector;
mod convert;
mod error;
mod heap;
mod keep_alive;
mod object;
mod type_hash;

pub use collector::{CollectorStatistics, CycleCollector};
pub use convert::{FromHost, IntoHost};
pub use error::{BridgeError, ConversionError, RegistrationError, fatal};
pub use heap::{Handle, HeapStatistics, HostHeap};
pub use keep_alive::{Finalizer, KeepAliveGraph, Patient};
pub use object::{
    FunctionId, HostObject, InstanceRecord, InstanceState, NativeVTable, Ownership, TypeObject,
};
pub use type_hash::{TypeHash, hash_constants};

/// Result alias for boundary operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
