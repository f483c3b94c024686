//! Per-runtime registries: registered classes and wrapper identity.
//!
//! Both registries are owned by the [`State`] instance, never process-global,
//! so multiple independent runtime instances in one process cannot leak
//! wrappers or metatables into each other.

use std::any::TypeId;

use rustc_hash::FxHashMap;

use crate::class::{BaseDecl, Capabilities, ClassSpec, HookFn, PopulateFn, ScriptClass, WeakFlag};
use crate::error::RegistrationError;
use crate::heap::{Heap, HeapRef};
use crate::state::State;
use crate::type_tag::TypeTag;

/// Erased descriptor of a registered class: the once-resolved result of its
/// [`ClassSpec`].
pub(crate) struct ClassInfo {
    pub name: &'static str,
    pub tag: TypeTag,
    pub type_id: TypeId,
    pub caps: Capabilities,
    pub acquire: Option<unsafe fn(*const ())>,
    pub release: Option<unsafe fn(*const ())>,
    pub weak_flag_of: Option<unsafe fn(*const ()) -> WeakFlag>,
    pub base: Option<BaseDecl>,
    pub index_hook: Option<HookFn>,
    pub new_index_hook: Option<HookFn>,
    pub populate: Option<PopulateFn>,
}

/// Classes registered with one runtime instance, addressed by tag or by the
/// Rust type.
#[derive(Default)]
pub(crate) struct ClassRegistry {
    by_tag: FxHashMap<TypeTag, ClassInfo>,
    tag_of: FxHashMap<TypeId, TypeTag>,
}

impl ClassRegistry {
    pub fn get(&self, tag: TypeTag) -> Option<&ClassInfo> {
        self.by_tag.get(&tag)
    }

    pub fn tag_for(&self, type_id: TypeId) -> Option<TypeTag> {
        self.tag_of.get(&type_id).copied()
    }

    fn insert(&mut self, info: ClassInfo) -> Result<(), RegistrationError> {
        if self.tag_of.contains_key(&info.type_id) {
            return Err(RegistrationError::Duplicate { name: info.name });
        }
        if let Some(existing) = self.by_tag.get(&info.tag) {
            if existing.name == info.name {
                return Err(RegistrationError::Duplicate { name: info.name });
            }
            return Err(RegistrationError::TagCollision {
                name: info.name,
                existing: existing.name,
            });
        }
        if let Some(base) = &info.base {
            if !self.by_tag.contains_key(&base.tag) {
                return Err(RegistrationError::UnregisteredBase {
                    name: info.name,
                    base: base.name,
                });
            }
        }
        self.tag_of.insert(info.type_id, info.tag);
        self.by_tag.insert(info.tag, info);
        Ok(())
    }
}

/// Identity registry: native address to current wrapper.
///
/// Entries are weak by construction — the mapped [`HeapRef`] does not keep
/// the wrapper alive, and its slot generation is the liveness token. A
/// lookup whose wrapper has been collected (or finalized) behaves as
/// not-found; registration overwrites any stale entry.
#[derive(Default)]
pub(crate) struct WrapperRegistry {
    entries: FxHashMap<usize, HeapRef>,
}

impl WrapperRegistry {
    /// The live wrapper for this address, if one is still reachable.
    pub fn lookup(&self, heap: &Heap, addr: usize) -> Option<HeapRef> {
        let href = *self.entries.get(&addr)?;
        heap.live_wrapper(href).then_some(href)
    }

    /// Map an address to its wrapper, overwriting any stale entry. Cannot
    /// fail; wrap construction relies on that ordering guarantee.
    pub fn register(&mut self, addr: usize, href: HeapRef) {
        self.entries.insert(addr, href);
    }

    /// Drop the entry for an address, but only if it still maps to the
    /// wrapper being finalized. A newer wrapper for a reused address stays.
    pub fn invalidate(&mut self, addr: usize, href: HeapRef) {
        if self.entries.get(&addr) == Some(&href) {
            self.entries.remove(&addr);
        }
    }
}

impl State {
    /// Register a native class with this runtime instance.
    ///
    /// Resolves the class's [`ClassSpec`] into its runtime descriptor,
    /// validating up front (exactly one lifetime capability; no duplicate;
    /// base registered first). Until a class is registered, wrapping one of
    /// its instances fails.
    pub fn register_class<T: ScriptClass>(&mut self) -> Result<(), RegistrationError> {
        let spec = T::describe(ClassSpec::new());
        spec.validate_lifetime()?;
        self.classes.insert(ClassInfo {
            name: T::NAME,
            tag: TypeTag::from_name(T::NAME),
            type_id: TypeId::of::<T>(),
            caps: spec.caps,
            acquire: spec.acquire,
            release: spec.release,
            weak_flag_of: spec.weak_flag_of,
            base: spec.base,
            index_hook: spec.index_hook,
            new_index_hook: spec.new_index_hook,
            populate: spec.populate,
        })
    }
}
