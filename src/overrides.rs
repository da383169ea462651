//! Host-side overrides of native virtual methods.
//!
//! A native method that may be overridden asks the bridge before running its
//! own body: if a host callable is registered for (type, method name) the
//! call is forwarded to it with the instance as receiver. Overrides declared
//! for a base type apply to registered subtypes.
//!
//! Entries are keyed by [`TypeHash::from_method`] over the owner's name hash.

use std::any::TypeId;
use std::ptr::NonNull;

use rustc_hash::FxHashMap;

use bindery_core::{BridgeError, Handle, HostObject, Result, TypeHash};

use crate::Bridge;
use crate::cast::ReturnPolicy;
use crate::dispatch::CallBuilder;

/// Method hash (owner type + method name) -> host callable.
#[derive(Debug, Default)]
pub struct OverrideTable {
    entries: FxHashMap<TypeHash, Handle>,
}

impl OverrideTable {
    pub fn get(&self, owner: TypeHash, name: &str) -> Option<Handle> {
        self.entries
            .get(&TypeHash::from_method(owner, name))
            .copied()
    }

    /// Store a callable, returning the one it displaces.
    pub fn insert(&mut self, owner: TypeHash, name: &str, callable: Handle) -> Option<Handle> {
        self.entries
            .insert(TypeHash::from_method(owner, name), callable)
    }

    pub fn remove(&mut self, owner: TypeHash, name: &str) -> Option<Handle> {
        self.entries.remove(&TypeHash::from_method(owner, name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Handle> + '_ {
        self.entries.drain().map(|(_, callable)| callable)
    }
}

impl Bridge {
    /// Register `callable` as the host override of `type_id::name`.
    ///
    /// Takes over the caller's reference to `callable`.
    pub fn set_override(&mut self, type_id: TypeId, name: &str, callable: Handle) -> Result<()> {
        let Some(owner) = self.registry.lookup(type_id).map(|d| d.hash) else {
            return Err(BridgeError::NotRegistered {
                type_name: format!("{type_id:?}"),
            });
        };
        match self.heap.try_get(callable)? {
            HostObject::Function(_) | HostObject::BoundMethod { .. } => {}
            other => {
                return Err(BridgeError::NotCallable {
                    actual: other.kind_name().to_string(),
                });
            }
        }
        if let Some(displaced) = self.overrides.insert(owner, name, callable) {
            self.heap.release(displaced);
        }
        Ok(())
    }

    /// Remove an override. Returns true if one was registered.
    pub fn clear_override(&mut self, type_id: TypeId, name: &str) -> bool {
        let Some(owner) = self.registry.lookup(type_id).map(|d| d.hash) else {
            return false;
        };
        match self.overrides.remove(owner, name) {
            Some(callable) => {
                self.heap.release(callable);
                true
            }
            None => false,
        }
    }

    fn find_override(&self, type_id: TypeId, name: &str) -> Option<Handle> {
        self.registry
            .ancestors(type_id)
            .into_iter()
            .filter_map(|ancestor| self.registry.lookup(ancestor))
            .find_map(|descriptor| self.overrides.get(descriptor.hash, name))
    }

    /// Whether a host override applies to `type_id::name`.
    pub fn has_override(&self, type_id: TypeId, name: &str) -> bool {
        self.find_override(type_id, name).is_some()
    }

    /// Forward a virtual call to its host override, if there is one.
    ///
    /// Returns `Ok(None)` when the native implementation should run instead.
    /// A `pure` method without an override fails with
    /// [`BridgeError::PureVirtual`]. Consumes the builder's references.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live `T` for the duration of the call.
    pub unsafe fn call_override<T: 'static>(
        &mut self,
        ptr: NonNull<T>,
        name: &str,
        args: CallBuilder,
        pure: bool,
    ) -> Result<Option<Handle>> {
        // SAFETY: forwarded from the caller.
        let receiver = match unsafe { self.publish(ptr, ReturnPolicy::Reference, None) } {
            Ok(receiver) => receiver,
            Err(err) => {
                args.release(&mut self.heap);
                return Err(err);
            }
        };
        let dynamic = self
            .heap
            .get(receiver)
            .and_then(HostObject::as_instance)
            .map_or(TypeId::of::<T>(), |r| r.type_id());

        let Some(callable) = self.find_override(dynamic, name) else {
            self.heap.release(receiver);
            args.release(&mut self.heap);
            if pure {
                return Err(BridgeError::PureVirtual {
                    type_name: self.registry.type_name(dynamic),
                    method: name.to_string(),
                });
            }
            return Ok(None);
        };

        tracing::trace!(method = name, "dispatching to host override");
        self.call(callable, args.with_receiver(receiver)).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Param;
    use crate::registry::TypeBuilder;
    use bindery_core::{FromHost, IntoHost};

    struct Animal {
        legs: i64,
    }

    impl Animal {
        /// Native virtual: host override first, native body otherwise.
        fn speak(&self, bridge: &mut Bridge) -> Result<String> {
            let ptr = NonNull::from(self);
            match unsafe { bridge.call_override(ptr, "speak", CallBuilder::new(), false)? } {
                Some(result) => Ok(String::from_host(bridge.heap(), result)?),
                None => Ok(format!("{} legs", self.legs)),
            }
        }
    }

    fn bridge() -> Bridge {
        let mut bridge = Bridge::new();
        bridge.register(TypeBuilder::<Animal>::new("Animal").build());
        bridge
    }

    #[test]
    fn native_body_runs_without_override() {
        let mut bridge = bridge();
        let animal = Animal { legs: 4 };
        assert!(!bridge.has_override(TypeId::of::<Animal>(), "speak"));
        assert_eq!(animal.speak(&mut bridge).unwrap(), "4 legs");
    }

    #[test]
    fn override_receives_instance() {
        let mut bridge = bridge();
        let speak = bridge
            .function("speak")
            .overload("speak(Animal)", &[Param::native::<Animal>()], |frame| {
                let legs = frame.arg::<Animal>(0)?.legs;
                Ok(frame.ret(format!("woof on {legs} legs")))
            })
            .build();
        bridge
            .set_override(TypeId::of::<Animal>(), "speak", speak)
            .unwrap();

        let animal = Animal { legs: 3 };
        assert!(bridge.has_override(TypeId::of::<Animal>(), "speak"));
        assert_eq!(animal.speak(&mut bridge).unwrap(), "woof on 3 legs");

        assert!(bridge.clear_override(TypeId::of::<Animal>(), "speak"));
        assert_eq!(animal.speak(&mut bridge).unwrap(), "3 legs");
    }

    #[test]
    fn pure_virtual_without_override() {
        let mut bridge = bridge();
        let animal = Animal { legs: 2 };
        let arg = 1i64.into_host(bridge.heap_mut());
        let err = unsafe {
            bridge.call_override(
                NonNull::from(&animal),
                "walk",
                CallBuilder::new().arg(arg),
                true,
            )
        }
        .unwrap_err();
        assert_eq!(
            err,
            BridgeError::PureVirtual {
                type_name: "Animal".to_string(),
                method: "walk".to_string()
            }
        );
        assert!(!bridge.heap().is_live(arg));
    }

    #[test]
    fn override_must_be_callable() {
        let mut bridge = bridge();
        let not_callable = 5i64.into_host(bridge.heap_mut());
        let err = bridge
            .set_override(TypeId::of::<Animal>(), "speak", not_callable)
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotCallable { .. }));
    }

    #[test]
    fn table_keys_by_owner_and_name() {
        let mut table = OverrideTable::default();
        let animal = TypeHash::from_name("Animal");
        let plant = TypeHash::from_name("Plant");
        let callable = Handle::new(7, 0);

        assert_eq!(table.insert(animal, "grow", callable), None);
        assert_eq!(table.get(animal, "grow"), Some(callable));
        assert_eq!(table.get(plant, "grow"), None);
        assert_eq!(table.get(animal, "speak"), None);
        assert_eq!(table.remove(animal, "grow"), Some(callable));
        assert!(table.is_empty());
    }
}
