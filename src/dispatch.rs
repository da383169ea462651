//! Call dispatch: outbound argument building, calls and overload fallback.
//!
//! ## Overload Resolution
//!
//! A function object owns its overloads in registration order. Each overload
//! declares one [`Param`] per positional argument, and every argument is cast
//! to its parameter before the body runs: a rejected candidate never executes.
//! Resolution runs in two passes:
//!
//! 1. Every candidate is tried with [`CastFlags::NEXT_OVERLOAD`]: arguments
//!    that do not match exactly yield to the next candidate.
//! 2. If nothing matched, every candidate is tried again with implicit
//!    conversions enabled ([`CastFlags::CONVERT`]).
//!
//! Candidates whose arity differs from the positional argument count are
//! skipped. Once its arguments match, a candidate is selected and any error
//! from its body ends the call; a body may still decline by returning
//! [`BridgeError::NextOverload`] itself. All candidates share the call's
//! cleanup list, so temporaries created for a rejected candidate are still
//! released exactly once.

use std::any::{Any, TypeId};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Arc;

use bindery_core::{
    BridgeError, FromHost, FunctionId, Handle, HostHeap, HostObject, IntoHost, Result,
};

use crate::Bridge;
use crate::cast::{CastFlags, ReturnPolicy};
use crate::cleanup::CleanupList;
use crate::config::BridgeProperty;

// ============================================================================
// Function Table
// ============================================================================

/// Native body of one overload. Returns a handle owning one reference.
pub type OverloadBody = Arc<dyn Fn(&mut CallFrame<'_>) -> Result<Handle>>;

/// Declared type of one positional parameter.
#[derive(Clone, Copy)]
pub enum Param {
    /// A registered native type, a subtype, or anything implicitly convertible to it.
    Native(TypeId),
    /// As `Native`, or the host `None` object.
    Optional(TypeId),
    /// A primitive read with [`CallFrame::arg_value`].
    Value {
        name: &'static str,
        accepts: fn(&HostHeap, Handle) -> bool,
    },
    /// Any object; the body inspects it itself.
    Any,
}

impl Param {
    pub fn native<T: 'static>() -> Self {
        Param::Native(TypeId::of::<T>())
    }

    pub fn optional<T: 'static>() -> Self {
        Param::Optional(TypeId::of::<T>())
    }

    pub fn value<T: FromHost>() -> Self {
        Param::Value {
            name: std::any::type_name::<T>(),
            accepts: |heap, handle| T::from_host(heap, handle).is_ok(),
        }
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Native(id) => write!(f, "Native({id:?})"),
            Param::Optional(id) => write!(f, "Optional({id:?})"),
            Param::Value { name, .. } => write!(f, "Value({name})"),
            Param::Any => write!(f, "Any"),
        }
    }
}

/// One candidate of an overloaded function.
#[derive(Clone)]
pub struct Overload {
    /// Human-readable signature, used in error messages.
    pub signature: String,
    /// Positional parameters, receiver included for methods.
    pub params: Vec<Param>,
    body: OverloadBody,
}

impl Overload {
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl fmt::Debug for Overload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Overload")
            .field("signature", &self.signature)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// A named function and its overloads.
#[derive(Debug)]
pub struct FunctionEntry {
    pub name: String,
    /// Host function object.
    pub handle: Handle,
    pub overloads: Vec<Overload>,
}

#[derive(Debug, Default)]
pub struct FunctionTable {
    entries: Vec<FunctionEntry>,
}

impl FunctionTable {
    pub fn get(&self, id: FunctionId) -> Option<&FunctionEntry> {
        self.entries.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_id(&self) -> FunctionId {
        FunctionId(self.entries.len() as u32)
    }

    fn push(&mut self, entry: FunctionEntry) {
        self.entries.push(entry);
    }
}

/// Collects overloads for a new host function object.
///
/// ```ignore
/// let (widget, float) = (Param::native::<Widget>(), Param::value::<f64>());
/// let scale = bridge
///     .function("scale")
///     .overload("scale(Widget, float)", &[widget, float], |frame| { ... })
///     .overload("scale(float, float)", &[float, float], |frame| { ... })
///     .build();
/// ```
pub struct FunctionBuilder<'b> {
    bridge: &'b mut Bridge,
    name: String,
    overloads: Vec<Overload>,
}

impl<'b> FunctionBuilder<'b> {
    pub(crate) fn new(bridge: &'b mut Bridge, name: &str) -> Self {
        Self {
            bridge,
            name: name.to_string(),
            overloads: Vec::new(),
        }
    }

    /// Append a candidate; candidates are tried in the order they are added.
    pub fn overload<F>(mut self, signature: &str, params: &[Param], body: F) -> Self
    where
        F: Fn(&mut CallFrame<'_>) -> Result<Handle> + 'static,
    {
        self.overloads.push(Overload {
            signature: signature.to_string(),
            params: params.to_vec(),
            body: Arc::new(body),
        });
        self
    }

    /// Create the function object. Function objects are immortal.
    pub fn build(self) -> Handle {
        let id = self.bridge.functions.next_id();
        let handle = self.bridge.heap.allocate_immortal(HostObject::Function(id));
        tracing::debug!(
            name = %self.name,
            overloads = self.overloads.len(),
            "registered function"
        );
        self.bridge.functions.push(FunctionEntry {
            name: self.name,
            handle,
            overloads: self.overloads,
        });
        handle
    }
}

// ============================================================================
// Call Builder
// ============================================================================

/// Arguments for an outbound call.
///
/// The builder owns one reference per argument; [`Bridge::call`] consumes it
/// and releases them after the call.
#[derive(Default)]
pub struct CallBuilder {
    receiver: Option<Handle>,
    args: Vec<Handle>,
    kwargs: Vec<(String, Handle)>,
}

impl CallBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A method call: `receiver` is passed as the first argument and becomes
    /// the call's receiver. Takes over one reference to it.
    pub fn method(receiver: Handle) -> Self {
        Self {
            receiver: Some(receiver),
            args: Vec::new(),
            kwargs: Vec::new(),
        }
    }

    /// Turn into a method call on `receiver`, taking over one reference to it.
    ///
    /// A previously set receiver becomes the first positional argument.
    pub fn with_receiver(mut self, receiver: Handle) -> Self {
        if let Some(previous) = self.receiver.replace(receiver) {
            self.args.insert(0, previous);
        }
        self
    }

    /// Append a positional argument, taking over the caller's reference.
    pub fn append_arg(&mut self, handle: Handle) {
        self.args.push(handle);
    }

    /// Chaining form of [`append_arg`](Self::append_arg).
    pub fn arg(mut self, handle: Handle) -> Self {
        self.append_arg(handle);
        self
    }

    /// Append every item of a tuple or list (`*args`). The sequence itself is borrowed.
    pub fn append_args(&mut self, heap: &mut HostHeap, sequence: Handle) -> Result<()> {
        let items = match heap.try_get(sequence)? {
            HostObject::Tuple(items) | HostObject::List(items) => items.clone(),
            other => {
                return Err(BridgeError::BadSplat {
                    splat: "*",
                    expected: "tuple or list",
                    actual: other.kind_name().to_string(),
                });
            }
        };
        for item in &items {
            heap.add_ref(*item);
        }
        self.args.extend(items);
        Ok(())
    }

    /// Append a keyword argument, taking over the caller's reference.
    ///
    /// On a duplicate name the reference stays with the caller.
    pub fn append_kwarg(&mut self, name: &str, value: Handle) -> Result<()> {
        if self.kwargs.iter().any(|(key, _)| key == name) {
            return Err(BridgeError::DuplicateKeyword {
                name: name.to_string(),
            });
        }
        self.kwargs.push((name.to_string(), value));
        Ok(())
    }

    /// Merge every entry of a dict (`**kwargs`). The dict itself is borrowed.
    ///
    /// Nothing is appended if any key is already present.
    pub fn append_kwargs(&mut self, heap: &mut HostHeap, mapping: Handle) -> Result<()> {
        let entries = match heap.try_get(mapping)? {
            HostObject::Dict(entries) => entries.clone(),
            other => {
                return Err(BridgeError::BadSplat {
                    splat: "**",
                    expected: "dict",
                    actual: other.kind_name().to_string(),
                });
            }
        };
        if let Some((name, _)) = entries
            .iter()
            .find(|(name, _)| self.kwargs.iter().any(|(key, _)| key == name))
        {
            return Err(BridgeError::DuplicateKeyword { name: name.clone() });
        }
        for (name, value) in entries {
            heap.add_ref(value);
            self.kwargs.push((name, value));
        }
        Ok(())
    }

    /// Positional arguments, receiver included.
    pub fn arg_count(&self) -> usize {
        self.args.len() + usize::from(self.receiver.is_some())
    }

    pub fn kwarg_count(&self) -> usize {
        self.kwargs.len()
    }

    /// Split into (receiver, positional arguments with the receiver first, keywords).
    fn into_parts(mut self) -> (Option<Handle>, Vec<Handle>, Vec<(String, Handle)>) {
        let receiver = self.receiver.take();
        let mut args = std::mem::take(&mut self.args);
        if let Some(receiver) = receiver {
            args.insert(0, receiver);
        }
        (receiver, args, std::mem::take(&mut self.kwargs))
    }

    /// Drop the arguments without calling anything.
    pub fn release(self, heap: &mut HostHeap) {
        let (_, args, kwargs) = self.into_parts();
        release_parts(heap, args, kwargs);
    }
}

fn release_parts(heap: &mut HostHeap, args: Vec<Handle>, kwargs: Vec<(String, Handle)>) {
    for handle in args.into_iter().chain(kwargs.into_iter().map(|(_, h)| h)) {
        heap.release(handle);
    }
}

impl Drop for CallBuilder {
    fn drop(&mut self) {
        let pending = self.arg_count() + self.kwargs.len();
        if pending > 0 {
            tracing::error!(pending, "call builder dropped without being called; arguments leaked");
        }
    }
}

impl fmt::Debug for CallBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallBuilder")
            .field("receiver", &self.receiver)
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .finish()
    }
}

// ============================================================================
// Call Frame
// ============================================================================

/// View of one in-flight call handed to the selected overload's body.
///
/// Arguments declared as native parameters were already cast; reading them
/// with their declared type returns that address without casting again.
pub struct CallFrame<'c> {
    bridge: &'c mut Bridge,
    args: &'c [Handle],
    kwargs: &'c [(String, Handle)],
    cleanup: &'c mut CleanupList,
    flags: CastFlags,
    params: &'c [Param],
    resolved: &'c [Option<NonNull<u8>>],
}

impl<'c> CallFrame<'c> {
    pub fn bridge(&mut self) -> &mut Bridge {
        self.bridge
    }

    pub fn heap(&self) -> &HostHeap {
        self.bridge.heap()
    }

    pub fn heap_mut(&mut self) -> &mut HostHeap {
        self.bridge.heap_mut()
    }

    /// Flags for casts made by the body; conversions are on in the second pass.
    pub fn flags(&self) -> CastFlags {
        self.flags
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// The call's receiver (first argument of a method call).
    pub fn receiver(&self) -> Option<Handle> {
        self.cleanup.receiver()
    }

    pub fn cleanup(&mut self) -> &mut CleanupList {
        self.cleanup
    }

    /// Handle of a positional argument (borrowed).
    pub fn arg_handle(&self, index: usize) -> Result<Handle> {
        self.args
            .get(index)
            .copied()
            .ok_or(BridgeError::MissingArgument {
                index,
                count: self.args.len(),
            })
    }

    /// Native address of a positional argument as a `T`.
    pub fn arg_ptr<T: 'static>(&mut self, index: usize) -> Result<NonNull<T>> {
        let handle = self.arg_handle(index)?;
        let type_id = TypeId::of::<T>();
        if let Some(Param::Native(declared) | Param::Optional(declared)) = self.params.get(index)
            && *declared == type_id
            && let Some(Some(ptr)) = self.resolved.get(index)
        {
            return Ok(ptr.cast());
        }
        self.bridge
            .obtain_raw(handle, type_id, self.flags, Some(&mut *self.cleanup))
            .map(NonNull::cast)
    }

    pub fn arg<T: 'static>(&mut self, index: usize) -> Result<&T> {
        let ptr = self.arg_ptr::<T>(index)?;
        // SAFETY: obtained addresses stay valid for the call.
        Ok(unsafe { ptr.as_ref() })
    }

    pub fn arg_mut<T: 'static>(&mut self, index: usize) -> Result<&mut T> {
        let mut ptr = self.arg_ptr::<T>(index)?;
        // SAFETY: as in `arg`; the frame is borrowed mutably.
        Ok(unsafe { ptr.as_mut() })
    }

    /// As [`arg`](Self::arg), with the host `None` object mapping to `None`.
    pub fn arg_optional<T: 'static>(&mut self, index: usize) -> Result<Option<&T>> {
        let handle = self.arg_handle(index)?;
        if matches!(self.heap().try_get(handle)?, HostObject::None) {
            return Ok(None);
        }
        self.arg(index).map(Some)
    }

    fn convert_value<T: FromHost>(&self, handle: Handle) -> Result<T> {
        Ok(T::from_host(self.bridge.heap(), handle)?)
    }

    /// A positional argument converted to a primitive Rust value.
    pub fn arg_value<T: FromHost>(&self, index: usize) -> Result<T> {
        self.convert_value(self.arg_handle(index)?)
    }

    pub fn kwarg(&self, name: &str) -> Option<Handle> {
        self.kwargs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    }

    /// A keyword argument converted to a primitive Rust value, if supplied.
    pub fn kwarg_value<T: FromHost>(&self, name: &str) -> Result<Option<T>> {
        self.kwarg(name)
            .map(|handle| self.convert_value(handle))
            .transpose()
    }

    /// Publish a native result; `ReferenceInternal` keeps the receiver alive.
    ///
    /// # Safety
    ///
    /// See [`Bridge::publish_raw`].
    pub unsafe fn publish<T: 'static>(
        &mut self,
        ptr: NonNull<T>,
        policy: ReturnPolicy,
    ) -> Result<Handle> {
        // SAFETY: forwarded from the caller.
        unsafe { self.bridge.publish(ptr, policy, Some(&*self.cleanup)) }
    }

    pub fn publish_value<T: 'static>(&mut self, value: T) -> Result<Handle> {
        self.bridge.publish_value(value)
    }

    /// Convert a primitive result.
    pub fn ret<T: IntoHost>(&mut self, value: T) -> Handle {
        value.into_host(self.bridge.heap_mut())
    }

    pub fn none(&self) -> Handle {
        self.bridge.heap().none()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// Calls
// ============================================================================

impl Bridge {
    /// Start building a function object named `name`.
    pub fn function(&mut self, name: &str) -> FunctionBuilder<'_> {
        FunctionBuilder::new(self, name)
    }

    /// Bind `function` to `receiver`, producing a bound-method object.
    pub fn bind(&mut self, receiver: Handle, function: Handle) -> Result<Handle> {
        match self.heap.try_get(function)? {
            HostObject::Function(_) => {}
            other => {
                return Err(BridgeError::NotCallable {
                    actual: other.kind_name().to_string(),
                });
            }
        }
        self.heap.try_get(receiver)?;
        self.heap.add_ref(receiver);
        self.heap.add_ref(function);
        Ok(self
            .heap
            .allocate(HostObject::BoundMethod { receiver, function }))
    }

    /// Call a function or bound method. Consumes the builder's references.
    ///
    /// Returns the result handle, owning one reference.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn call(&mut self, callable: Handle, call: CallBuilder) -> Result<Handle> {
        let target = match self.heap.try_get(callable) {
            Ok(HostObject::Function(id)) => Ok((*id, None)),
            Ok(HostObject::BoundMethod { receiver, function }) => {
                match self.heap.get(*function) {
                    Some(HostObject::Function(id)) => Ok((*id, Some(*receiver))),
                    _ => Err(BridgeError::NotCallable {
                        actual: "method".to_string(),
                    }),
                }
            }
            Ok(other) => Err(BridgeError::NotCallable {
                actual: other.kind_name().to_string(),
            }),
            Err(err) => Err(err),
        };
        let (function, bound) = match target {
            Ok(target) => target,
            Err(err) => {
                call.release(&mut self.heap);
                return Err(err);
            }
        };

        let (mut receiver, mut args, kwargs) = call.into_parts();
        if let Some(bound) = bound {
            self.heap.add_ref(bound);
            args.insert(0, bound);
            receiver = Some(bound);
        }

        let result = self.with_cleanup(receiver, |bridge, cleanup| {
            bridge.dispatch(function, &args, &kwargs, cleanup)
        });
        release_parts(&mut self.heap, args, kwargs);
        self.maybe_collect();
        result
    }

    fn dispatch(
        &mut self,
        function: FunctionId,
        args: &[Handle],
        kwargs: &[(String, Handle)],
        cleanup: &mut CleanupList,
    ) -> Result<Handle> {
        let Some(entry) = self.functions.get(function) else {
            return Err(BridgeError::NotCallable {
                actual: "function".to_string(),
            });
        };
        let name = entry.name.clone();
        let overloads = entry.overloads.clone();

        let passes: &[CastFlags] = if self.is_enabled(BridgeProperty::ImplicitConversions) {
            &[
                CastFlags::NEXT_OVERLOAD,
                CastFlags::NEXT_OVERLOAD.union(CastFlags::CONVERT),
            ]
        } else {
            &[CastFlags::NEXT_OVERLOAD]
        };

        for &flags in passes {
            for overload in overloads.iter().filter(|o| o.arity() == args.len()) {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.try_overload(overload, args, kwargs, flags, cleanup)
                }));
                match outcome {
                    Ok(Ok(result)) => {
                        tracing::trace!(
                            function = %name,
                            signature = %overload.signature,
                            converting = flags.contains(CastFlags::CONVERT),
                            "overload selected"
                        );
                        return Ok(result);
                    }
                    Ok(Err(BridgeError::NextOverload)) => continue,
                    Ok(Err(err)) => return Err(err),
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::warn!(function = %name, %message, "native function panicked");
                        return Err(BridgeError::NativePanic { message });
                    }
                }
            }
        }

        Err(BridgeError::NoMatchingOverload {
            function: name,
            signatures: overloads.iter().map(|o| o.signature.clone()).collect(),
            arguments: args
                .iter()
                .map(|h| self.heap.kind_name(*h).to_string())
                .collect(),
        })
    }

    /// Match every argument against `overload`'s parameters, then run its body.
    fn try_overload(
        &mut self,
        overload: &Overload,
        args: &[Handle],
        kwargs: &[(String, Handle)],
        flags: CastFlags,
        cleanup: &mut CleanupList,
    ) -> Result<Handle> {
        let resolved = self.match_params(&overload.params, args, flags, cleanup)?;
        let mut frame = CallFrame {
            bridge: self,
            args,
            kwargs,
            cleanup,
            flags: flags.difference(CastFlags::NEXT_OVERLOAD),
            params: &overload.params,
            resolved: &resolved,
        };
        (overload.body)(&mut frame)
    }

    /// Cast each argument to its parameter. Native parameters resolve to an
    /// address; converted temporaries are appended to `cleanup`.
    fn match_params(
        &mut self,
        params: &[Param],
        args: &[Handle],
        flags: CastFlags,
        cleanup: &mut CleanupList,
    ) -> Result<Vec<Option<NonNull<u8>>>> {
        let mut resolved = Vec::with_capacity(args.len());
        for (param, &handle) in params.iter().zip(args) {
            let addr = match *param {
                Param::Native(type_id) => {
                    Some(self.obtain_raw(handle, type_id, flags, Some(&mut *cleanup))?)
                }
                Param::Optional(type_id) => {
                    if matches!(self.heap.try_get(handle)?, HostObject::None) {
                        None
                    } else {
                        Some(self.obtain_raw(handle, type_id, flags, Some(&mut *cleanup))?)
                    }
                }
                Param::Value { accepts, .. } => {
                    if !accepts(&self.heap, handle) {
                        return Err(BridgeError::NextOverload);
                    }
                    None
                }
                Param::Any => None,
            };
            resolved.push(addr);
        }
        Ok(resolved)
    }
}
