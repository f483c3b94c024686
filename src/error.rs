//! Unified error types for the binding layer.
//!
//! Errors are split by phase, mirroring the two moments things can go wrong:
//!
//! ```text
//! BindError (top-level wrapper)
//! ├── RegistrationError - class registration / capability validation errors
//! └── ScriptError       - errors that abort the current script-level call
//!     └── ConversionError - typed value extraction failures
//! ```
//!
//! Registration errors are integrity failures in the host's binding
//! definitions and are reported at setup time, never deferred to a script
//! call. Script errors abort the current script-level operation; the binding
//! layer never retries on the caller's behalf.

use thiserror::Error;

/// Result alias for operations that may abort the current script call.
pub type ScriptResult<T> = Result<T, ScriptError>;

// ============================================================================
// Registration Errors
// ============================================================================

/// Errors raised while registering a native class with a [`State`].
///
/// All of these indicate a broken binding definition and surface from
/// [`State::register_class`] before any instance of the type can be wrapped.
///
/// [`State`]: crate::State
/// [`State::register_class`]: crate::State::register_class
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// The class declared both the reference-counted and the weak-observed
    /// lifetime capability. Exactly one must be chosen.
    #[error("class '{name}' declares both ref-counted and weak-observed lifetimes")]
    AmbiguousLifetime { name: &'static str },

    /// The class declared neither lifetime capability.
    #[error("class '{name}' declares no lifetime capability")]
    MissingLifetime { name: &'static str },

    /// A class with this name (or the same Rust type) is already registered.
    #[error("class '{name}' is already registered")]
    Duplicate { name: &'static str },

    /// The declared base class has not been registered yet. Bases must be
    /// registered before their derived classes.
    #[error("base class '{base}' of '{name}' is not registered")]
    UnregisteredBase {
        name: &'static str,
        base: &'static str,
    },

    /// Two distinct class names hashed to the same type tag.
    #[error("type tag collision between '{name}' and '{existing}'")]
    TagCollision {
        name: &'static str,
        existing: &'static str,
    },
}

// ============================================================================
// Conversion Errors
// ============================================================================

/// Errors raised when extracting a typed value from a script value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    /// The value holds a different type than the conversion expects.
    #[error("expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// An integer does not fit in the requested narrower type.
    #[error("integer {value} out of range for {target}")]
    IntegerOverflow { value: i64, target: &'static str },
}

// ============================================================================
// Script Errors
// ============================================================================

/// Errors that abort the current script-level call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    /// A free-form runtime error raised by a native hook or method.
    #[error("{0}")]
    Runtime(String),

    /// A custom write hook declined the assignment. The message is fixed and
    /// stable; scripts can rely on it.
    #[error("unaccepted assignment")]
    UnacceptedAssignment,

    /// A stack index that does not resolve to a slot in the current frame.
    #[error("stack index {index} out of range (top is {top})")]
    InvalidStackIndex { index: i32, top: usize },

    /// More values were requested than the current frame holds.
    #[error("stack underflow: needed {needed} values, frame holds {available}")]
    StackUnderflow { needed: usize, available: usize },

    /// Attempt to read or write a property of a value that has none.
    #[error("attempt to index a {type_name} value")]
    NotIndexable { type_name: &'static str },

    /// Attempt to call a value that is not callable.
    #[error("attempt to call a {type_name} value")]
    NotCallable { type_name: &'static str },

    /// A value of this type cannot be used as a table key.
    #[error("a {type_name} value cannot be used as a table key")]
    InvalidKey { type_name: &'static str },

    /// An `__index` chain longer than the dispatch limit, which in practice
    /// means a metatable cycle.
    #[error("'__index' chain too long; possible loop")]
    IndexChainTooLong,

    /// A heap reference whose slot has been collected and reused.
    #[error("stale heap reference")]
    StaleHandle,

    /// The native class was never registered with this runtime instance.
    #[error("native class '{name}' is not registered")]
    UnregisteredClass { name: &'static str },

    /// The value is not a wrapper for the expected native class.
    #[error("expected a wrapped {expected}, got {actual}")]
    NotWrapped {
        expected: &'static str,
        actual: &'static str,
    },

    /// A weakly observed native object was destroyed by its owner. Callers
    /// must treat this as a normal, checkable condition.
    #[error("native object of class '{type_name}' has expired")]
    ExpiredObject { type_name: &'static str },

    /// A typed extraction failed.
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

impl ScriptError {
    /// Raise a free-form runtime error, aborting the current script call.
    pub fn runtime(message: impl Into<String>) -> Self {
        ScriptError::Runtime(message.into())
    }
}

// ============================================================================
// Top-Level Wrapper
// ============================================================================

/// Top-level error for callers that mix setup and runtime operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Script(#[from] ScriptError),
}

impl From<ConversionError> for BindError {
    fn from(err: ConversionError) -> Self {
        BindError::Script(ScriptError::Conversion(err))
    }
}
