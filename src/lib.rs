//! Native-object bindings for an embedded, stack-based scripting runtime.
//!
//! `scriptbind` surfaces host-defined native types to scripts as first-class
//! values with correct lifetime, identity and inheritance semantics. The
//! crate has two halves:
//!
//! - A small Lua-style runtime shim — the [`State`]: a value stack, tables
//!   with metatables, native functions, and an explicit stop-the-world
//!   collector. It implements exactly the primitive surface the binding
//!   layer consumes.
//! - The binding layer itself: class registration with statically declared
//!   lifetime capabilities, identity-preserving wrapping, per-class
//!   metatables chained for single inheritance, custom property dispatch
//!   hooks, and finalizer-driven release of native ownership.
//!
//! # Lifetime disciplines
//!
//! A native class declares exactly one of two lifetime capabilities:
//!
//! - [`RefCounted`]: wrappers own one reference, acquired at construction
//!   and released exactly once when the collector finalizes the wrapper.
//! - [`WeakObserved`]: wrappers observe the object through a [`WeakFlag`]
//!   re-validated on every access; the true owner is free to destroy the
//!   object at any time.
//!
//! Declaring both, or neither, is rejected at registration time.
//!
//! # Identity
//!
//! Wrapping the same native address twice yields the same script value for
//! as long as the first wrapper is reachable from script space. The
//! identity registry holds only weak entries and never extends a wrapper's
//! life.
//!
//! # Example
//!
//! ```
//! use scriptbind::{ClassSpec, RefCounted, ScriptClass, State};
//! use std::cell::Cell;
//!
//! struct Counter {
//!     refs: Cell<usize>,
//!     value: Cell<i64>,
//! }
//!
//! // Safety: test-style object, heap-pinned by the caller.
//! unsafe impl RefCounted for Counter {
//!     fn add_ref(&self) {
//!         self.refs.set(self.refs.get() + 1);
//!     }
//!     fn release(&self) {
//!         self.refs.set(self.refs.get() - 1);
//!     }
//! }
//!
//! impl ScriptClass for Counter {
//!     const NAME: &'static str = "Counter";
//!     fn describe(spec: ClassSpec<Self>) -> ClassSpec<Self> {
//!         spec.ref_counted().with_metatable(|state, idx| {
//!             state.push_function(|state| {
//!                 let value = state.unwrap::<Counter>(1)?.value.get();
//!                 state.push(value);
//!                 Ok(1)
//!             });
//!             let getter = state.value(-1)?.clone();
//!             state.pop(1)?;
//!             state.raw_set(idx, "value", getter)
//!         })
//!     }
//! }
//!
//! // The counter must outlive the runtime: teardown releases the wrapper's
//! // reference.
//! let counter = Counter { refs: Cell::new(1), value: Cell::new(7) };
//! let mut state = State::new();
//! state.register_class::<Counter>().unwrap();
//!
//! state.wrap(&counter).unwrap();
//! assert_eq!(counter.refs.get(), 2);
//! ```

mod class;
mod convert;
mod error;
mod heap;
mod metatable;
mod registry;
mod stack_guard;
mod state;
mod type_tag;
mod value;
mod wrapper;

pub use class::{
    Capabilities, ClassSpec, HookFn, PopulateFn, RefCounted, ScriptClass, WeakFlag, WeakLife,
    WeakObserved,
};
pub use convert::{FromValue, IntoValue};
pub use error::{BindError, ConversionError, RegistrationError, ScriptError, ScriptResult};
pub use heap::HeapRef;
pub use stack_guard::StackGuard;
pub use state::{StackIndex, State};
pub use type_tag::TypeTag;
pub use value::{NativeFnId, Value};
