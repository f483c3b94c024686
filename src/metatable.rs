//! Metatable construction, the inheritance chain, and finalizer dispatch.
//!
//! One metatable exists per registered class per runtime instance, built
//! lazily on the first wrap of any instance and memoized in the name-scoped
//! registry. A fresh build installs, in order: the variant-appropriate
//! `__gc` finalizer, the `__index` read path, the `__newindex` write hook
//! (only when declared), the class's own population step, and finally the
//! link to the base class's metatable.
//!
//! Single inheritance is reproduced structurally: the derived metatable's
//! metatable is a one-entry link table whose `__index` points at the base
//! metatable, so a read miss on the derived table falls through to the base
//! (and transitively to further ancestors) without copying any methods. The
//! base metatable is always fully built, chain included, before the derived
//! link is installed.

use crate::class::{Capabilities, HookFn, PopulateFn};
use crate::error::{ScriptError, ScriptResult};
use crate::heap::HeapRef;
use crate::state::State;
use crate::type_tag::TypeTag;
use crate::value::{NativeFnId, Value};
use crate::wrapper::WrapperVariant;

impl State {
    /// Ensure the metatable for class `T` exists, building it and its base
    /// chain on first use. Idempotent: a second call returns the identical
    /// table and runs no population step. A build that fails part-way is
    /// not memoized; the next call retries it from scratch.
    pub fn ensure_metatable<T: crate::class::ScriptClass>(&mut self) -> ScriptResult<HeapRef> {
        let tag = self
            .classes
            .tag_for(std::any::TypeId::of::<T>())
            .ok_or(ScriptError::UnregisteredClass { name: T::NAME })?;
        self.ensure_metatable_by_tag(tag)
    }

    pub(crate) fn ensure_metatable_by_tag(&mut self, tag: TypeTag) -> ScriptResult<HeapRef> {
        if let Some(&mt) = self.metatables.get(&tag) {
            return Ok(mt);
        }

        let info = self
            .classes
            .get(tag)
            .ok_or(ScriptError::UnregisteredClass { name: "unknown" })?;
        let caps = info.caps;
        let index_hook = info.index_hook;
        let new_index_hook = info.new_index_hook;
        let populate = info.populate;
        let base_tag = info.base.as_ref().map(|base| base.tag);

        let (mt, existed) = self.named_metatable(tag);
        if existed {
            return Ok(mt);
        }
        if let Err(err) =
            self.build_metatable(mt, caps, index_hook, new_index_hook, populate, base_tag)
        {
            // A failed build must not stay memoized as complete. Dropping
            // the registry entry leaves the orphaned table to the next
            // collection pass; a retry rebuilds from scratch.
            self.metatables.remove(&tag);
            return Err(err);
        }
        Ok(mt)
    }

    fn build_metatable(
        &mut self,
        mt: HeapRef,
        caps: Capabilities,
        index_hook: Option<HookFn>,
        new_index_hook: Option<HookFn>,
        populate: Option<PopulateFn>,
        base_tag: Option<TypeTag>,
    ) -> ScriptResult<()> {
        // Finalizer appropriate to the wrapper variant.
        let gc = if caps.contains(Capabilities::REF_COUNTED) {
            self.owned_finalizer()
        } else {
            self.observed_finalizer()
        };
        self.raw_set_ref(mt, Value::Str("__gc".into()), Value::NativeFunction(gc))?;

        // Read path: custom hook shim, or the metatable itself.
        let index_value = match index_hook {
            Some(hook) => {
                let id = self.register_native(move |state| {
                    let handled = hook(state)?;
                    if handled > 0 {
                        Ok(handled)
                    } else {
                        default_lookup(state)
                    }
                });
                Value::NativeFunction(id)
            }
            None => Value::Table(mt),
        };
        self.raw_set_ref(mt, Value::Str("__index".into()), index_value)?;

        // Write path, only when the class declares one. A declined
        // assignment is fatal to the script call.
        if let Some(hook) = new_index_hook {
            let id = self.register_native(move |state| {
                let handled = hook(state)?;
                if handled > 0 {
                    Ok(0)
                } else {
                    Err(ScriptError::UnacceptedAssignment)
                }
            });
            self.raw_set_ref(
                mt,
                Value::Str("__newindex".into()),
                Value::NativeFunction(id),
            )?;
        }

        // The class's own customization step (methods, constants).
        if let Some(populate) = populate {
            let mut state = self.guard();
            state.push_value(Value::Table(mt));
            populate(&mut state, -1)?;
        }

        // Base chain: the base metatable is fully built before the link is
        // installed, so a derived read can never see a half-built base.
        if let Some(base_tag) = base_tag {
            let base_mt = self.ensure_metatable_by_tag(base_tag)?;
            let link = self.heap.alloc_table();
            self.raw_set_ref(link, Value::Str("__index".into()), Value::Table(base_mt))?;
            self.heap
                .table_mut(mt)
                .ok_or(ScriptError::StaleHandle)?
                .metatable = Some(link);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Finalizer dispatch
    // ------------------------------------------------------------------

    fn owned_finalizer(&mut self) -> NativeFnId {
        if let Some(id) = self.gc_owned {
            return id;
        }
        let id = self.register_native(|state| {
            let href = state.userdata_at(1)?;
            state.finalize_userdata(href);
            Ok(0)
        });
        self.gc_owned = Some(id);
        id
    }

    fn observed_finalizer(&mut self) -> NativeFnId {
        if let Some(id) = self.gc_observed {
            return id;
        }
        let id = self.register_native(|state| {
            let href = state.userdata_at(1)?;
            state.discard_userdata(href);
            Ok(0)
        });
        self.gc_observed = Some(id);
        id
    }

    /// Finalize a wrapper: release the owned reference (once, ever) and
    /// invalidate its identity-registry entry. Safe to call on an already
    /// finalized or freed slot.
    pub(crate) fn finalize_userdata(&mut self, href: HeapRef) {
        let Some(ud) = self.heap.userdata_mut(href) else {
            return;
        };
        if ud.wrapper.finalized {
            return;
        }
        ud.wrapper.finalized = true;
        let ptr = ud.wrapper.ptr;
        let release = match ud.wrapper.variant {
            WrapperVariant::Owned { release } => Some(release),
            WrapperVariant::Observed { .. } => None,
        };
        if let Some(release) = release {
            unsafe { release(ptr) };
        }
        self.wrappers.invalidate(ptr as usize, href);
    }

    /// Finalize a non-owning wrapper: native lifetime is untouched; only
    /// the registry entry dies with the wrapper.
    pub(crate) fn discard_userdata(&mut self, href: HeapRef) {
        let Some(ud) = self.heap.userdata_mut(href) else {
            return;
        };
        if ud.wrapper.finalized {
            return;
        }
        ud.wrapper.finalized = true;
        let addr = ud.wrapper.ptr as usize;
        self.wrappers.invalidate(addr, href);
    }
}

/// The default `__index` fallback used by read-hook shims: own stored
/// properties, then the metatable chain.
fn default_lookup(state: &mut State) -> ScriptResult<u32> {
    let href = state.userdata_at(1)?;
    let key = state.value(2)?.clone();
    let value = state.default_property_lookup(href, key)?;
    state.push_value(value);
    Ok(1)
}
