//! Wrapper variants and the wrap/unwrap operations.
//!
//! A wrapper is the script-visible userdata standing in for one native
//! object. The identity registry guarantees at most one live wrapper per
//! native address: wrapping the same object twice yields the same
//! script-visible value. The wrapper's variant is fixed by its class's
//! lifetime capability, resolved at registration time:
//!
//! - `Owned` — holds one reference on the object, acquired at construction
//!   (after identity registration, which cannot fail) and released exactly
//!   once by the finalizer.
//! - `Observed` — holds a liveness flag; every dereference re-validates it
//!   and never caches a possibly-stale pointer.

use std::any::TypeId;

use crate::class::{Capabilities, ScriptClass, WeakFlag};
use crate::error::{ScriptError, ScriptResult};
use crate::state::{StackIndex, State};
use crate::value::Value;

pub(crate) enum WrapperVariant {
    Owned { release: unsafe fn(*const ()) },
    Observed { alive: WeakFlag },
}

pub(crate) struct Wrapper {
    /// Address of the wrapped native object, as its most-derived registered
    /// class.
    pub ptr: *const (),
    /// Tag of that most-derived class; base access walks the declared
    /// chain.
    pub tag: crate::type_tag::TypeTag,
    pub variant: WrapperVariant,
    /// Set by the finalizer; guards against a second run and marks the
    /// identity-registry entry dead.
    pub finalized: bool,
}

impl State {
    /// Push a script wrapper for `object`, reusing the live wrapper if this
    /// address was already wrapped.
    ///
    /// The object's class must have been registered. On a fresh wrap the
    /// class's metatable (and its base chain) is built if this is the first
    /// instance crossing into script space.
    pub fn wrap<T: ScriptClass>(&mut self, object: &T) -> ScriptResult<()> {
        let ptr = object as *const T as *const ();
        let addr = ptr as usize;
        if let Some(href) = self.wrappers.lookup(&self.heap, addr) {
            self.push_value(Value::UserData(href));
            return Ok(());
        }

        let tag = self
            .classes
            .tag_for(TypeId::of::<T>())
            .ok_or(ScriptError::UnregisteredClass { name: T::NAME })?;
        let mt = self.ensure_metatable_by_tag(tag)?;

        let info = self
            .classes
            .get(tag)
            .ok_or(ScriptError::UnregisteredClass { name: T::NAME })?;
        let caps = info.caps;
        let acquire = info.acquire;
        let release = info.release;
        let weak_flag_of = info.weak_flag_of;

        let variant = if caps.contains(Capabilities::REF_COUNTED) {
            let Some(release) = release else {
                return Err(ScriptError::UnregisteredClass { name: T::NAME });
            };
            WrapperVariant::Owned { release }
        } else {
            let Some(weak_flag_of) = weak_flag_of else {
                return Err(ScriptError::UnregisteredClass { name: T::NAME });
            };
            WrapperVariant::Observed {
                alive: unsafe { weak_flag_of(ptr) },
            }
        };

        let href = self.heap.alloc_userdata(
            Wrapper {
                ptr,
                tag,
                variant,
                finalized: false,
            },
            mt,
        );
        // Identity registration cannot fail, so acquiring the owned
        // reference afterwards can never leak one.
        self.wrappers.register(addr, href);
        if let Some(acquire) = acquire {
            unsafe { acquire(ptr) };
        }
        self.push_value(Value::UserData(href));
        Ok(())
    }

    /// Borrow the native object wrapped by the value at `idx`.
    ///
    /// `T` may be the wrapper's own class or any class on its declared base
    /// chain; base access goes through the classes' upcast accessors, never
    /// through pointer reinterpretation. A weakly observed object whose
    /// owner destroyed it yields [`ScriptError::ExpiredObject`] — the
    /// liveness flag is re-checked on every call. The check happens at call
    /// time only: the [`WeakObserved`](crate::WeakObserved) safety contract
    /// obliges the owner to keep the object alive for as long as the
    /// returned borrow is held.
    pub fn unwrap<T: ScriptClass>(&self, idx: StackIndex) -> ScriptResult<&T> {
        let value = self.value(idx)?;
        let Value::UserData(href) = value else {
            return Err(ScriptError::NotWrapped {
                expected: T::NAME,
                actual: value.type_name(),
            });
        };
        let ud = self.heap.userdata(*href).ok_or(ScriptError::StaleHandle)?;
        let wrapper = &ud.wrapper;
        if wrapper.finalized {
            return Err(ScriptError::StaleHandle);
        }

        if let WrapperVariant::Observed { alive } = &wrapper.variant {
            if !alive.is_alive() {
                return Err(ScriptError::ExpiredObject { type_name: T::NAME });
            }
        }

        let want = TypeId::of::<T>();
        let actual = self
            .classes
            .get(wrapper.tag)
            .map(|info| info.name)
            .unwrap_or("unknown");
        let mut tag = wrapper.tag;
        let mut ptr = wrapper.ptr;
        loop {
            let info = self
                .classes
                .get(tag)
                .ok_or(ScriptError::UnregisteredClass { name: T::NAME })?;
            if info.type_id == want {
                return Ok(unsafe { &*(ptr as *const T) });
            }
            match &info.base {
                Some(base) => {
                    ptr = (base.upcast)(ptr);
                    tag = base.tag;
                }
                None => {
                    return Err(ScriptError::NotWrapped {
                        expected: T::NAME,
                        actual,
                    });
                }
            }
        }
    }

    /// Whether the value at `idx` wraps a (live) instance of `T` or one of
    /// its derived classes.
    pub fn is_wrapper_of<T: ScriptClass>(&self, idx: StackIndex) -> bool {
        self.unwrap::<T>(idx).is_ok()
    }
}
