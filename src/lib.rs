//! Object lifetime and type-identity bridge between native Rust values and a
//! reference-counted host runtime.
//!
//! For every value crossing the boundary the bridge decides who owns the
//! memory, finds or creates the matching wrapper on the other side, keeps
//! dependent objects alive, and releases call temporaries on every exit path.
//!
//! ## Components
//!
//! - [`TypeRegistry`]: native type identity to descriptor and host type object
//! - [`InstanceIndex`]: native address to live wrappers (wrapper identity)
//! - [`CleanupList`]: temporaries of one boundary call
//! - keep-alive edges and the cycle collector, in [`bindery_core`]
//! - casting engine: [`Bridge::obtain`], [`Bridge::publish`], [`Bridge::relinquish`]
//! - call dispatch: [`CallBuilder`], [`Param`], [`CallFrame`], [`Bridge::call`]
//! - [`OverrideTable`]: host overrides of native virtual methods
//!
//! ## Example
//!
//! ```ignore
//! let mut bridge = Bridge::new();
//! bridge.register(TypeBuilder::<Widget>::new("Widget").copyable().build());
//!
//! let widget = bridge.publish_value(Widget::default())?;
//! let width = bridge
//!     .function("width")
//!     .overload("width(Widget)", &[Param::native::<Widget>()], |frame| {
//!         let w = frame.arg::<Widget>(0)?.width;
//!         Ok(frame.ret(w))
//!     })
//!     .build();
//! let result = bridge.call(width, CallBuilder::new().arg(widget))?;
//! ```

mod bridge;
mod cast;
mod cleanup;
mod config;
mod dispatch;
mod instances;
mod overrides;
mod registry;

pub use bridge::Bridge;
pub use cast::{CastFlags, ReturnPolicy};
pub use cleanup::{CleanupList, INLINE_CAPACITY};
pub use config::BridgeProperty;
pub use dispatch::{
    CallBuilder, CallFrame, FunctionBuilder, FunctionEntry, FunctionTable, Overload, OverloadBody,
    Param,
};
pub use instances::InstanceIndex;
pub use overrides::OverrideTable;
pub use registry::{
    ConversionSource, ConvertFn, CopyFn, ImplicitConversion, LineageFn, MoveFn, Polymorphic,
    PredicateFn, TypeBuilder, TypeDescriptor, TypeFlags, TypeRegistry,
};

pub use bindery_core::{
    BridgeError, CollectorStatistics, ConversionError, FromHost, FunctionId, Handle,
    HeapStatistics, HostHeap, HostObject, InstanceRecord, InstanceState, IntoHost, Ownership,
    RegistrationError, Result, TypeHash,
};
