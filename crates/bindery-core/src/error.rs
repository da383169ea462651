//! Error types for the bridge.
//!
//! ## Error Hierarchy
//!
//! ```text
//! BridgeError (every boundary operation)
//! ├── recoverable    - TypeMismatch, NotRegistered, AllocationFailed, ...
//! ├── NextOverload   - private control signal for the overload dispatcher
//! ├── Host           - error raised by a host-side callable, propagated as is
//! ├── Conversion     - primitive value conversion (ConversionError)
//! └── Registration   - configuration-time registration (RegistrationError)
//! ```
//!
//! Invariant violations that would leave the object graph shared by both
//! sides corrupted are not errors: they go through [`fatal`], which aborts.

use std::fmt;

use thiserror::Error;

// ============================================================================
// Primitive Conversion Errors
// ============================================================================

/// Errors converting between host primitive objects and Rust values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    /// The host object has a different kind than requested.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// The expected host kind.
        expected: &'static str,
        /// The actual host kind.
        actual: &'static str,
    },

    /// An integer did not fit the requested native type.
    #[error("integer overflow: {value} doesn't fit in {target_type}")]
    IntegerOverflow {
        /// The value that overflowed.
        value: i64,
        /// The target type.
        target_type: &'static str,
    },
}

// ============================================================================
// Registration Errors
// ============================================================================

/// Errors raised while registering types and conversions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// A descriptor for this native type is already registered.
    #[error("duplicate type: {0} is already registered")]
    DuplicateType(String),

    /// Another native type is already registered under this name.
    #[error("duplicate name: '{0}' is already used by another type")]
    DuplicateName(String),

    /// A declared base type has not been registered yet.
    #[error("type '{type_name}' declares unregistered base '{base}'")]
    UnknownBase {
        /// The type being registered.
        type_name: String,
        /// The missing base.
        base: String,
    },

    /// A declared base type is final and cannot be derived from.
    #[error("type '{type_name}' cannot derive from final type '{base}'")]
    FinalBase {
        /// The type being registered.
        type_name: String,
        /// The final base.
        base: String,
    },

    /// A conversion or payload refers to a type that is not registered.
    #[error("type not registered: {0}")]
    NotRegistered(String),
}

// ============================================================================
// Bridge Errors
// ============================================================================

/// Errors reported by boundary operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// A host object could not be used as the requested native type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// The requested type.
        expected: String,
        /// The type of the object actually passed.
        actual: String,
    },

    /// The native type has no registered descriptor.
    #[error("type '{type_name}' is not registered with the bridge")]
    NotRegistered {
        /// The native type name.
        type_name: String,
    },

    /// Neither move nor copy construction is available for a by-value publish.
    #[error("type '{type_name}' supports neither {policy} nor copy construction")]
    NotCopyable {
        /// The native type name.
        type_name: String,
        /// The policy that was requested.
        policy: &'static str,
    },

    /// The type does not support placeholder construction.
    #[error("type '{type_name}' does not support in-place construction")]
    NotConstructible {
        /// The native type name.
        type_name: String,
    },

    /// Allocating storage for a copied or moved instance failed.
    #[error("failed to allocate {size} bytes for '{type_name}'")]
    AllocationFailed {
        /// The native type name.
        type_name: String,
        /// The requested allocation size.
        size: usize,
    },

    /// The instance is a placeholder, already constructed, or relinquished.
    #[error("instance of '{type_name}' is {state}")]
    InstanceNotReady {
        /// The native type name.
        type_name: String,
        /// Human-readable state.
        state: &'static str,
    },

    /// Ownership cannot be relinquished because the host does not own the instance.
    #[error("instance of '{type_name}' is not owned by the host")]
    NotOwned {
        /// The native type name.
        type_name: String,
    },

    /// A handle refers to an object that has been freed.
    #[error("stale handle: object at index {index} has been freed")]
    StaleHandle {
        /// The slot index of the freed object.
        index: u32,
    },

    /// The object is not a function or bound method.
    #[error("'{actual}' object is not callable")]
    NotCallable {
        /// The kind of object that was called.
        actual: String,
    },

    /// The same keyword argument was supplied twice.
    #[error("got multiple values for keyword argument '{name}'")]
    DuplicateKeyword {
        /// The duplicated keyword.
        name: String,
    },

    /// A splatted argument sequence or mapping had the wrong kind.
    #[error("argument after {splat} must be a {expected}, not {actual}")]
    BadSplat {
        /// `*` or `**`.
        splat: &'static str,
        /// Expected host kind.
        expected: &'static str,
        /// Actual host kind.
        actual: String,
    },

    /// A native body asked for a positional argument the call did not supply.
    #[error("argument {index} requested, but only {count} were passed")]
    MissingArgument {
        /// The requested position.
        index: usize,
        /// Positional arguments actually passed.
        count: usize,
    },

    /// `reference_internal` was requested without a receiver in the cleanup list.
    #[error("reference_internal requires a receiver object")]
    MissingReceiver,

    /// No overload accepted the arguments.
    #[error(
        "no overload of '{function}' accepts ({}); candidates: {}",
        arguments.join(", "),
        signatures.join(" | ")
    )]
    NoMatchingOverload {
        /// The function name.
        function: String,
        /// The signatures that were attempted, in registration order.
        signatures: Vec<String>,
        /// The host types of the actual arguments.
        arguments: Vec<String>,
    },

    /// A pure virtual method has no host-side override.
    #[error("tried to call pure virtual function '{type_name}::{method}'")]
    PureVirtual {
        /// The native type name.
        type_name: String,
        /// The method name.
        method: String,
    },

    /// An attribute is missing or the type does not carry dynamic attributes.
    #[error("'{type_name}' object has no attribute '{name}'")]
    AttributeError {
        /// The type of the object.
        type_name: String,
        /// The attribute name.
        name: String,
    },

    /// A native function panicked while handling a boundary call.
    #[error("native function panicked: {message}")]
    NativePanic {
        /// The panic message.
        message: String,
    },

    /// Error raised by a host-side callable, propagated unchanged.
    #[error("{message}")]
    Host {
        /// The error message.
        message: String,
    },

    /// Private control signal: try the next overload candidate.
    #[error("no conversion available, try next overload")]
    NextOverload,

    /// A primitive value conversion failed.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// A registration call failed.
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

impl BridgeError {
    /// Raise an error from a host-side callable.
    pub fn raise(message: impl Into<String>) -> Self {
        BridgeError::Host {
            message: message.into(),
        }
    }

    /// Check whether this is the overload-fallback signal.
    pub fn is_next_overload(&self) -> bool {
        matches!(self, BridgeError::NextOverload)
    }
}

/// Abort the process after printing a diagnostic.
///
/// Reserved for invariant violations (duplicate registration, double ownership
/// claims). Continuing would corrupt the object graph shared by both sides.
#[cold]
pub fn fatal(message: impl fmt::Display) -> ! {
    tracing::error!(target: "bindery", "fatal error: {message}");
    eprintln!("bindery: fatal error: {message}");
    std::process::abort()
}
