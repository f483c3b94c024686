//! Generational heap arena for tables and userdata.
//!
//! Every table and wrapper lives in a slot addressed by a [`HeapRef`]. Slots
//! carry a generation counter that advances whenever the slot is freed, so a
//! stale handle held across a collection is detectable instead of aliasing
//! whatever object reused the slot. The generation doubles as the liveness
//! token of the identity registry: a registry entry whose generation no
//! longer matches behaves as not-found.

use rustc_hash::FxHashMap;

use crate::value::{TableKey, Value};
use crate::wrapper::Wrapper;

/// Handle to a heap-allocated table or userdata.
///
/// Opaque outside the crate; compare with `==` for identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapRef {
    index: u32,
    generation: u32,
}

/// A script table: hash part plus an optional metatable.
pub(crate) struct Table {
    pub entries: FxHashMap<TableKey, Value>,
    pub metatable: Option<HeapRef>,
}

impl Table {
    fn new() -> Self {
        Table {
            entries: FxHashMap::default(),
            metatable: None,
        }
    }
}

/// A script userdata: the native wrapper, its plain stored properties, and
/// its metatable.
pub(crate) struct UserData {
    pub wrapper: Wrapper,
    pub props: FxHashMap<TableKey, Value>,
    pub metatable: Option<HeapRef>,
}

pub(crate) enum HeapObject {
    Table(Table),
    UserData(UserData),
}

struct Slot {
    generation: u32,
    marked: bool,
    object: Option<HeapObject>,
}

/// The arena. Allocation reuses freed slots; freeing bumps the generation.
#[derive(Default)]
pub(crate) struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Heap {
    pub fn new() -> Self {
        Heap::default()
    }

    fn alloc(&mut self, object: HeapObject) -> HeapRef {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            slot.marked = false;
            HeapRef {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                marked: false,
                object: Some(object),
            });
            HeapRef {
                index,
                generation: 0,
            }
        }
    }

    pub fn alloc_table(&mut self) -> HeapRef {
        self.alloc(HeapObject::Table(Table::new()))
    }

    pub fn alloc_userdata(&mut self, wrapper: Wrapper, metatable: HeapRef) -> HeapRef {
        self.alloc(HeapObject::UserData(UserData {
            wrapper,
            props: FxHashMap::default(),
            metatable: Some(metatable),
        }))
    }

    fn slot(&self, href: HeapRef) -> Option<&Slot> {
        self.slots
            .get(href.index as usize)
            .filter(|slot| slot.generation == href.generation && slot.object.is_some())
    }

    fn slot_mut(&mut self, href: HeapRef) -> Option<&mut Slot> {
        self.slots
            .get_mut(href.index as usize)
            .filter(|slot| slot.generation == href.generation && slot.object.is_some())
    }

    pub fn object(&self, href: HeapRef) -> Option<&HeapObject> {
        self.slot(href).and_then(|slot| slot.object.as_ref())
    }

    pub fn table(&self, href: HeapRef) -> Option<&Table> {
        match self.object(href) {
            Some(HeapObject::Table(table)) => Some(table),
            _ => None,
        }
    }

    pub fn table_mut(&mut self, href: HeapRef) -> Option<&mut Table> {
        match self.slot_mut(href).and_then(|slot| slot.object.as_mut()) {
            Some(HeapObject::Table(table)) => Some(table),
            _ => None,
        }
    }

    pub fn userdata(&self, href: HeapRef) -> Option<&UserData> {
        match self.object(href) {
            Some(HeapObject::UserData(ud)) => Some(ud),
            _ => None,
        }
    }

    pub fn userdata_mut(&mut self, href: HeapRef) -> Option<&mut UserData> {
        match self.slot_mut(href).and_then(|slot| slot.object.as_mut()) {
            Some(HeapObject::UserData(ud)) => Some(ud),
            _ => None,
        }
    }

    /// True if the handle still addresses a live, unfinalized wrapper.
    pub fn live_wrapper(&self, href: HeapRef) -> bool {
        matches!(self.userdata(href), Some(ud) if !ud.wrapper.finalized)
    }

    // ------------------------------------------------------------------
    // Collection support
    // ------------------------------------------------------------------

    pub fn clear_marks(&mut self) {
        for slot in &mut self.slots {
            slot.marked = false;
        }
    }

    /// Mark a slot; returns true if it was newly marked.
    pub fn mark(&mut self, href: HeapRef) -> bool {
        match self.slot_mut(href) {
            Some(slot) if !slot.marked => {
                slot.marked = true;
                true
            }
            _ => false,
        }
    }

    /// Handles referenced by the object, for the mark worklist.
    pub fn children(&self, href: HeapRef) -> Vec<HeapRef> {
        let mut out = Vec::new();
        match self.object(href) {
            Some(HeapObject::Table(table)) => {
                out.extend(table.metatable);
                out.extend(table.entries.values().filter_map(Value::heap_ref));
            }
            Some(HeapObject::UserData(ud)) => {
                out.extend(ud.metatable);
                out.extend(ud.props.values().filter_map(Value::heap_ref));
            }
            None => {}
        }
        out
    }

    /// Live but unmarked userdata, in slot order. These are the wrappers
    /// whose finalizers must run before the sweep frees them.
    pub fn unmarked_userdata(&self) -> Vec<HeapRef> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.object {
                Some(HeapObject::UserData(_)) if !slot.marked => Some(HeapRef {
                    index: index as u32,
                    generation: slot.generation,
                }),
                _ => None,
            })
            .collect()
    }

    /// All live userdata, for runtime teardown.
    pub fn all_userdata(&self) -> Vec<HeapRef> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.object {
                Some(HeapObject::UserData(_)) => Some(HeapRef {
                    index: index as u32,
                    generation: slot.generation,
                }),
                _ => None,
            })
            .collect()
    }

    /// Free every unmarked slot, advancing its generation.
    pub fn sweep(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.is_some() && !slot.marked {
                slot.object = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
    }
}
