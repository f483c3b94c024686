//! Class declarations: lifetime capabilities, hooks, and the spec builder.
//!
//! A native type becomes scriptable by implementing [`ScriptClass`] and
//! describing itself through a [`ClassSpec`]. The spec is resolved once, at
//! registration time, into the erased descriptor the runtime dispatches
//! through; no capability is re-derived per call.
//!
//! Two lifetime disciplines exist and a class must declare exactly one:
//!
//! - [`RefCounted`] — the object is manually reference-counted; wrappers own
//!   one reference from construction to finalization.
//! - [`WeakObserved`] — the object is owned elsewhere and only observed;
//!   wrappers hold a liveness flag and never extend the object's life.

use std::marker::PhantomData;

use bitflags::bitflags;
use std::cell::Cell;
use std::rc::Rc;

use crate::error::{RegistrationError, ScriptResult};
use crate::state::State;
use crate::type_tag::TypeTag;

bitflags! {
    /// Lifetime capabilities a class declared through its [`ClassSpec`].
    /// Hooks are not flagged here; dispatch reads their descriptor fields
    /// directly.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const REF_COUNTED = 1 << 0;
        const WEAK_OBSERVED = 1 << 1;
    }
}

// ============================================================================
// Lifetime capabilities
// ============================================================================

/// A manually reference-counted native type.
///
/// # Safety
///
/// Implementors must guarantee that the object's address remains valid for
/// as long as its reference count is nonzero. In practice this means the
/// object is heap-allocated and never moved while shared.
pub unsafe trait RefCounted {
    fn add_ref(&self);
    fn release(&self);
}

/// A native type owned elsewhere and observable through a liveness flag.
///
/// # Safety
///
/// Implementors must guarantee that the object's address remains valid for
/// as long as every flag returned by [`weak_flag`](WeakObserved::weak_flag)
/// still reads alive, and that the owner flips the flag before the object is
/// destroyed or moved. Flipping the flag does not retroactively invalidate
/// references already handed out: the object must additionally outlive every
/// borrow obtained through [`State::unwrap`](crate::State::unwrap) while the
/// flag read alive. Concretely, the owner must not destroy the object from
/// code that runs while the host still holds such a borrow (for example,
/// from inside a native hook whose caller retains one).
pub unsafe trait WeakObserved {
    /// An observer handle onto this object's liveness.
    fn weak_flag(&self) -> WeakFlag;
}

/// Owner-side liveness token for a weakly observed object.
///
/// Embed one in the owning type and hand out [`WeakFlag`] observers. Dropping
/// the token (or calling [`invalidate`](WeakLife::invalidate)) flips every
/// observer to expired.
pub struct WeakLife {
    flag: Rc<Cell<bool>>,
}

impl WeakLife {
    pub fn new() -> Self {
        WeakLife {
            flag: Rc::new(Cell::new(true)),
        }
    }

    /// A new observer handle.
    pub fn observe(&self) -> WeakFlag {
        WeakFlag {
            flag: Rc::clone(&self.flag),
        }
    }

    /// Flip all observers to expired ahead of destruction.
    pub fn invalidate(&self) {
        self.flag.set(false);
    }
}

impl Default for WeakLife {
    fn default() -> Self {
        WeakLife::new()
    }
}

impl Drop for WeakLife {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

/// Observer-side handle reporting whether a weakly observed object is still
/// alive. Cheap to clone; never affects the object's lifetime.
#[derive(Clone)]
pub struct WeakFlag {
    flag: Rc<Cell<bool>>,
}

impl WeakFlag {
    pub fn is_alive(&self) -> bool {
        self.flag.get()
    }
}

// ============================================================================
// Hooks
// ============================================================================

/// A custom property read or write hook.
///
/// Read hooks see `(wrapper, key)` at stack indices 1 and 2; write hooks see
/// `(wrapper, key, value)` at 1, 2 and 3. A hook reports "handled" by
/// leaving its results on the stack and returning their count; returning 0
/// means "not handled" and dispatch proceeds per the default for that
/// operation.
pub type HookFn = fn(&mut State) -> ScriptResult<u32>;

/// The metatable population step: adds methods and constants to the freshly
/// built metatable at the given stack index. Runs exactly once per class per
/// runtime instance.
pub type PopulateFn = fn(&mut State, i32) -> ScriptResult<()>;

// ============================================================================
// ScriptClass and ClassSpec
// ============================================================================

/// A native type exposable to scripts.
pub trait ScriptClass: Sized + 'static {
    /// Unique class name; keys the metatable registry.
    const NAME: &'static str;

    /// Declare capabilities, hooks, base class and metatable contents.
    fn describe(spec: ClassSpec<Self>) -> ClassSpec<Self>;
}

/// Declared base class, with the accessor that views a derived object as its
/// base. The accessor replaces any reliance on memory-layout compatibility
/// between derived and base.
pub(crate) struct BaseDecl {
    pub name: &'static str,
    pub tag: TypeTag,
    pub upcast: Box<dyn Fn(*const ()) -> *const ()>,
}

/// Builder collecting a class's declared capabilities.
///
/// Obtained pre-seeded in [`ScriptClass::describe`]; every method is
/// chainable. Resolution into the runtime descriptor happens once, in
/// [`State::register_class`].
///
/// [`State::register_class`]: crate::State::register_class
pub struct ClassSpec<T: ScriptClass> {
    pub(crate) caps: Capabilities,
    pub(crate) acquire: Option<unsafe fn(*const ())>,
    pub(crate) release: Option<unsafe fn(*const ())>,
    pub(crate) weak_flag_of: Option<unsafe fn(*const ()) -> WeakFlag>,
    pub(crate) base: Option<BaseDecl>,
    pub(crate) index_hook: Option<HookFn>,
    pub(crate) new_index_hook: Option<HookFn>,
    pub(crate) populate: Option<PopulateFn>,
    _marker: PhantomData<fn(T)>,
}

unsafe fn acquire_shim<T: RefCounted>(ptr: *const ()) {
    unsafe { (*(ptr as *const T)).add_ref() }
}

unsafe fn release_shim<T: RefCounted>(ptr: *const ()) {
    unsafe { (*(ptr as *const T)).release() }
}

unsafe fn weak_flag_shim<T: WeakObserved>(ptr: *const ()) -> WeakFlag {
    unsafe { (*(ptr as *const T)).weak_flag() }
}

impl<T: ScriptClass> ClassSpec<T> {
    pub(crate) fn new() -> Self {
        ClassSpec {
            caps: Capabilities::empty(),
            acquire: None,
            release: None,
            weak_flag_of: None,
            base: None,
            index_hook: None,
            new_index_hook: None,
            populate: None,
            _marker: PhantomData,
        }
    }

    /// Declare the reference-counted lifetime. The wrapper acquires one
    /// reference at construction and releases it exactly once at
    /// finalization.
    pub fn ref_counted(mut self) -> Self
    where
        T: RefCounted,
    {
        self.caps |= Capabilities::REF_COUNTED;
        self.acquire = Some(acquire_shim::<T>);
        self.release = Some(release_shim::<T>);
        self
    }

    /// Declare the weak-observed lifetime. The wrapper holds a liveness flag
    /// and re-validates it on every dereference.
    pub fn weak_observed(mut self) -> Self
    where
        T: WeakObserved,
    {
        self.caps |= Capabilities::WEAK_OBSERVED;
        self.weak_flag_of = Some(weak_flag_shim::<T>);
        self
    }

    /// Declare the base class, with the accessor viewing a `T` as a `B`.
    /// The base must be registered before this class.
    pub fn base<B: ScriptClass>(mut self, upcast: fn(&T) -> &B) -> Self {
        self.base = Some(BaseDecl {
            name: B::NAME,
            tag: TypeTag::from_name(B::NAME),
            upcast: Box::new(move |ptr| {
                let base = upcast(unsafe { &*(ptr as *const T) });
                base as *const B as *const ()
            }),
        });
        self
    }

    /// Install a custom property read hook, consulted before the default
    /// lookup.
    pub fn on_index(mut self, hook: HookFn) -> Self {
        self.index_hook = Some(hook);
        self
    }

    /// Install a custom property write hook. An assignment the hook declines
    /// raises the unaccepted-assignment error; there is no fallback store.
    pub fn on_new_index(mut self, hook: HookFn) -> Self {
        self.new_index_hook = Some(hook);
        self
    }

    /// Install the metatable population step (methods, constants).
    pub fn with_metatable(mut self, populate: PopulateFn) -> Self {
        self.populate = Some(populate);
        self
    }

    /// Validate the lifetime declaration. Ambiguity and absence are hard
    /// setup-time errors, never runtime tie-breaks.
    pub(crate) fn validate_lifetime(&self) -> Result<(), RegistrationError> {
        let owned = self.caps.contains(Capabilities::REF_COUNTED);
        let observed = self.caps.contains(Capabilities::WEAK_OBSERVED);
        match (owned, observed) {
            (true, true) => Err(RegistrationError::AmbiguousLifetime { name: T::NAME }),
            (false, false) => Err(RegistrationError::MissingLifetime { name: T::NAME }),
            _ => Ok(()),
        }
    }
}
