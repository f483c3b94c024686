//! The runtime instance: value stack, heap, globals, native functions and
//! garbage collection.
//!
//! `State` is the single-threaded owner of everything script-visible. All
//! binding operations are synchronous stack operations against it, and the
//! collector runs stop-the-world inside [`State::collect_garbage`]. Every
//! registry a binding needs (classes, wrappers, named metatables) is scoped
//! to the instance — two `State`s in one process share nothing.
//!
//! # Stack indexing
//!
//! Indices follow the C-API convention: positive indices count from the
//! current frame's base (1 is the first value), negative from the top
//! (-1 is the topmost). Native functions see their arguments at 1..=n
//! regardless of how deep the outer stack is.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::convert::{FromValue, IntoValue};
use crate::error::{ConversionError, ScriptError, ScriptResult};
use crate::heap::{Heap, HeapRef};
use crate::registry::{ClassRegistry, WrapperRegistry};
use crate::stack_guard::StackGuard;
use crate::type_tag::TypeTag;
use crate::value::{NativeFnId, TableKey, Value};

type NativeFn = Rc<dyn Fn(&mut State) -> ScriptResult<u32>>;

/// Longest `__index` chain dispatch will follow before assuming a loop.
const MAX_INDEX_DEPTH: usize = 100;

/// A stack slot index: positive from the frame base, negative from the top.
pub type StackIndex = i32;

/// An embedded scripting runtime instance.
pub struct State {
    pub(crate) stack: Vec<Value>,
    /// Frame bases of active native calls; arguments index from the last.
    frames: Vec<usize>,
    pub(crate) heap: Heap,
    globals: HeapRef,
    natives: Vec<NativeFn>,
    /// Name-scoped metatable registry, one entry per registered class that
    /// has been wrapped. Lives until the instance is torn down.
    pub(crate) metatables: FxHashMap<TypeTag, HeapRef>,
    pub(crate) classes: ClassRegistry,
    pub(crate) wrappers: WrapperRegistry,
    /// Lazily created finalizer functions shared by all metatables.
    pub(crate) gc_owned: Option<NativeFnId>,
    pub(crate) gc_observed: Option<NativeFnId>,
}

impl State {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let globals = heap.alloc_table();
        State {
            stack: Vec::new(),
            frames: Vec::new(),
            heap,
            globals,
            natives: Vec::new(),
            metatables: FxHashMap::default(),
            classes: ClassRegistry::default(),
            wrappers: WrapperRegistry::default(),
            gc_owned: None,
            gc_observed: None,
        }
    }

    /// Scope a stack guard over this state; see [`StackGuard`].
    pub fn guard(&mut self) -> StackGuard<'_> {
        StackGuard::new(self)
    }

    // ------------------------------------------------------------------
    // Stack primitives
    // ------------------------------------------------------------------

    fn frame_base(&self) -> usize {
        self.frames.last().copied().unwrap_or(0)
    }

    /// Number of values in the current frame.
    pub fn top(&self) -> usize {
        self.stack.len() - self.frame_base()
    }

    /// Truncate or nil-extend the current frame to `top` values.
    pub fn set_top(&mut self, top: usize) {
        let absolute = self.frame_base() + top;
        self.restore_absolute_top(absolute);
    }

    pub(crate) fn absolute_top(&self) -> usize {
        self.stack.len()
    }

    pub(crate) fn restore_absolute_top(&mut self, top: usize) {
        if self.stack.len() > top {
            self.stack.truncate(top);
        } else {
            self.stack.resize(top, Value::Nil);
        }
    }

    fn abs_index(&self, idx: StackIndex) -> ScriptResult<usize> {
        let base = self.frame_base();
        let len = self.stack.len();
        let pos = if idx > 0 {
            base.checked_add(idx as usize - 1)
        } else if idx < 0 {
            len.checked_sub(idx.unsigned_abs() as usize)
        } else {
            None
        };
        match pos {
            Some(pos) if pos >= base && pos < len => Ok(pos),
            _ => Err(ScriptError::InvalidStackIndex {
                index: idx,
                top: len - base,
            }),
        }
    }

    /// Push a value.
    pub fn push(&mut self, value: impl IntoValue) {
        self.stack.push(value.into_value());
    }

    /// Push an already-built [`Value`].
    pub fn push_value(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pop `n` values off the current frame.
    pub fn pop(&mut self, n: usize) -> ScriptResult<()> {
        let available = self.top();
        if available < n {
            return Err(ScriptError::StackUnderflow {
                needed: n,
                available,
            });
        }
        let len = self.stack.len() - n;
        self.stack.truncate(len);
        Ok(())
    }

    /// The value at a stack index.
    pub fn value(&self, idx: StackIndex) -> ScriptResult<&Value> {
        let pos = self.abs_index(idx)?;
        Ok(&self.stack[pos])
    }

    /// Extract a typed value from a stack index.
    pub fn get<T: FromValue>(&self, idx: StackIndex) -> ScriptResult<T> {
        Ok(T::from_value(self.value(idx)?)?)
    }

    pub(crate) fn userdata_at(&self, idx: StackIndex) -> ScriptResult<HeapRef> {
        match self.value(idx)? {
            Value::UserData(href) => Ok(*href),
            other => Err(ScriptError::Conversion(ConversionError::TypeMismatch {
                expected: "userdata",
                actual: other.type_name(),
            })),
        }
    }

    // ------------------------------------------------------------------
    // Tables
    // ------------------------------------------------------------------

    /// Allocate a fresh table and push it. Returns its handle.
    pub fn create_table(&mut self) -> HeapRef {
        let href = self.heap.alloc_table();
        self.stack.push(Value::Table(href));
        href
    }

    pub(crate) fn raw_set_ref(
        &mut self,
        href: HeapRef,
        key: Value,
        value: Value,
    ) -> ScriptResult<()> {
        let key_type = key.type_name();
        let Some(tk) = TableKey::of(&key) else {
            return Err(ScriptError::InvalidKey { type_name: key_type });
        };
        let table = self
            .heap
            .table_mut(href)
            .ok_or(ScriptError::StaleHandle)?;
        if value.is_nil() {
            table.entries.remove(&tk);
        } else {
            table.entries.insert(tk, value);
        }
        Ok(())
    }

    /// Store `key = value` in the table or userdata at `idx`, bypassing all
    /// dispatch hooks.
    pub fn raw_set(
        &mut self,
        idx: StackIndex,
        key: impl IntoValue,
        value: impl IntoValue,
    ) -> ScriptResult<()> {
        let pos = self.abs_index(idx)?;
        let key = key.into_value();
        let value = value.into_value();
        match self.stack[pos].clone() {
            Value::Table(href) => self.raw_set_ref(href, key, value),
            Value::UserData(href) => {
                let key_type = key.type_name();
                let Some(tk) = TableKey::of(&key) else {
                    return Err(ScriptError::InvalidKey { type_name: key_type });
                };
                let ud = self
                    .heap
                    .userdata_mut(href)
                    .ok_or(ScriptError::StaleHandle)?;
                if value.is_nil() {
                    ud.props.remove(&tk);
                } else {
                    ud.props.insert(tk, value);
                }
                Ok(())
            }
            other => Err(ScriptError::NotIndexable {
                type_name: other.type_name(),
            }),
        }
    }

    /// Push the raw (hook-free) value of `key` in the table or userdata at
    /// `idx`; nil when absent.
    pub fn raw_get(&mut self, idx: StackIndex, key: impl IntoValue) -> ScriptResult<()> {
        let pos = self.abs_index(idx)?;
        let key = key.into_value();
        let value = match &self.stack[pos] {
            Value::Table(href) => {
                let table = self.heap.table(*href).ok_or(ScriptError::StaleHandle)?;
                TableKey::of(&key)
                    .and_then(|tk| table.entries.get(&tk).cloned())
                    .unwrap_or(Value::Nil)
            }
            Value::UserData(href) => {
                let ud = self.heap.userdata(*href).ok_or(ScriptError::StaleHandle)?;
                TableKey::of(&key)
                    .and_then(|tk| ud.props.get(&tk).cloned())
                    .unwrap_or(Value::Nil)
            }
            other => {
                return Err(ScriptError::NotIndexable {
                    type_name: other.type_name(),
                });
            }
        };
        self.stack.push(value);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Metatables
    // ------------------------------------------------------------------

    /// The metatable registered under `tag`, creating an empty one if
    /// absent. Returns the handle and whether it already existed.
    pub fn named_metatable(&mut self, tag: TypeTag) -> (HeapRef, bool) {
        if let Some(&mt) = self.metatables.get(&tag) {
            return (mt, true);
        }
        let mt = self.heap.alloc_table();
        self.metatables.insert(tag, mt);
        (mt, false)
    }

    /// Pop the table on top of the stack and install it as the metatable of
    /// the value at `idx`.
    pub fn set_metatable(&mut self, idx: StackIndex) -> ScriptResult<()> {
        let pos = self.abs_index(idx)?;
        let mt_pos = self.stack.len() - 1;
        if pos == mt_pos {
            return Err(ScriptError::InvalidStackIndex {
                index: idx,
                top: self.top(),
            });
        }
        let mt = match &self.stack[mt_pos] {
            Value::Table(href) => *href,
            other => {
                return Err(ScriptError::Conversion(ConversionError::TypeMismatch {
                    expected: "table",
                    actual: other.type_name(),
                }));
            }
        };
        match self.stack[pos].clone() {
            Value::Table(href) => {
                self.heap
                    .table_mut(href)
                    .ok_or(ScriptError::StaleHandle)?
                    .metatable = Some(mt);
            }
            Value::UserData(href) => {
                self.heap
                    .userdata_mut(href)
                    .ok_or(ScriptError::StaleHandle)?
                    .metatable = Some(mt);
            }
            other => {
                return Err(ScriptError::NotIndexable {
                    type_name: other.type_name(),
                });
            }
        }
        self.stack.truncate(mt_pos);
        Ok(())
    }

    /// Push the metatable of the value at `idx`; returns false (pushing
    /// nothing) if it has none.
    pub fn push_metatable(&mut self, idx: StackIndex) -> ScriptResult<bool> {
        let pos = self.abs_index(idx)?;
        let meta = match &self.stack[pos] {
            Value::Table(href) => self
                .heap
                .table(*href)
                .ok_or(ScriptError::StaleHandle)?
                .metatable,
            Value::UserData(href) => self
                .heap
                .userdata(*href)
                .ok_or(ScriptError::StaleHandle)?
                .metatable,
            _ => None,
        };
        match meta {
            Some(mt) => {
                self.stack.push(Value::Table(mt));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Raw read of a metatable slot such as `__index`, nil-filtered.
    pub(crate) fn meta_slot(&self, meta: Option<HeapRef>, name: &str) -> Option<Value> {
        let table = self.heap.table(meta?)?;
        table
            .entries
            .get(&TableKey::str(name))
            .filter(|v| !v.is_nil())
            .cloned()
    }

    // ------------------------------------------------------------------
    // Native functions
    // ------------------------------------------------------------------

    pub(crate) fn register_native(
        &mut self,
        f: impl Fn(&mut State) -> ScriptResult<u32> + 'static,
    ) -> NativeFnId {
        let id = NativeFnId(self.natives.len() as u32);
        self.natives.push(Rc::new(f));
        id
    }

    /// Wrap a native function into a callable script value and push it.
    ///
    /// The function sees its arguments at stack indices 1..=n and reports
    /// how many results it left on top. Returning an error aborts the
    /// current script-level call.
    pub fn push_function(&mut self, f: impl Fn(&mut State) -> ScriptResult<u32> + 'static) {
        let id = self.register_native(f);
        self.stack.push(Value::NativeFunction(id));
    }

    /// Call the value below the top `nargs` values with those arguments.
    /// On success the callable and arguments are replaced by its results and
    /// the result count is returned.
    pub fn call(&mut self, nargs: u32) -> ScriptResult<u32> {
        let len = self.stack.len();
        let base = self.frame_base();
        let needed = nargs as usize + 1;
        if len - base < needed {
            return Err(ScriptError::StackUnderflow {
                needed,
                available: len - base,
            });
        }
        let fn_pos = len - needed;
        let id = match &self.stack[fn_pos] {
            Value::NativeFunction(id) => *id,
            other => {
                return Err(ScriptError::NotCallable {
                    type_name: other.type_name(),
                });
            }
        };
        match self.call_native(id, nargs) {
            Ok(n) => {
                self.stack.remove(fn_pos);
                Ok(n)
            }
            Err(err) => {
                self.stack.truncate(fn_pos);
                Err(err)
            }
        }
    }

    /// Invoke a native function whose `nargs` arguments sit on top of the
    /// stack, in a fresh frame. On return the arguments are replaced by the
    /// function's results; on error the stack is restored.
    pub(crate) fn call_native(&mut self, id: NativeFnId, nargs: u32) -> ScriptResult<u32> {
        let len = self.stack.len();
        let nargs = nargs as usize;
        if len - self.frame_base() < nargs {
            return Err(ScriptError::StackUnderflow {
                needed: nargs,
                available: len - self.frame_base(),
            });
        }
        let base = len - nargs;
        let Some(f) = self.natives.get(id.0 as usize).map(Rc::clone) else {
            return Err(ScriptError::NotCallable {
                type_name: "function",
            });
        };
        self.frames.push(base);
        let result = f(self);
        self.frames.pop();
        match result {
            Ok(n) => {
                let n = n as usize;
                let len = self.stack.len();
                if len < base + n {
                    self.stack.truncate(base);
                    return Err(ScriptError::StackUnderflow {
                        needed: n,
                        available: len - base,
                    });
                }
                self.stack.drain(base..len - n);
                Ok(n as u32)
            }
            Err(err) => {
                self.stack.truncate(base);
                Err(err)
            }
        }
    }

    /// Call a dispatch hook with the given arguments, returning its first
    /// result (nil when it produced none). Balances the stack on every
    /// path.
    fn call_meta(&mut self, id: NativeFnId, args: &[Value]) -> ScriptResult<Value> {
        let saved = self.stack.len();
        self.stack.extend_from_slice(args);
        match self.call_native(id, args.len() as u32) {
            Ok(n) => {
                let value = if n > 0 {
                    self.stack[saved].clone()
                } else {
                    Value::Nil
                };
                self.stack.truncate(saved);
                Ok(value)
            }
            Err(err) => {
                self.stack.truncate(saved);
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Property dispatch
    // ------------------------------------------------------------------

    /// Read `obj[key]` with full dispatch and push the result.
    ///
    /// Tables consult their entries, then their `__index` chain. Userdata
    /// dispatch `__index`: a function runs the class's read shim (custom
    /// hook, then default lookup); a table falls straight to the default
    /// lookup (own stored properties, then the metatable chain). A chain
    /// longer than the traversal limit raises
    /// [`ScriptError::IndexChainTooLong`] instead of looping.
    pub fn get_field(&mut self, idx: StackIndex, key: impl IntoValue) -> ScriptResult<()> {
        let pos = self.abs_index(idx)?;
        let obj = self.stack[pos].clone();
        let value = self.resolve_get(obj, key.into_value(), 0)?;
        self.stack.push(value);
        Ok(())
    }

    fn resolve_get(&mut self, obj: Value, key: Value, depth: usize) -> ScriptResult<Value> {
        if depth >= MAX_INDEX_DEPTH {
            return Err(ScriptError::IndexChainTooLong);
        }
        match obj {
            Value::Table(href) => {
                let table = self.heap.table(href).ok_or(ScriptError::StaleHandle)?;
                if let Some(tk) = TableKey::of(&key) {
                    if let Some(v) = table.entries.get(&tk) {
                        if !v.is_nil() {
                            return Ok(v.clone());
                        }
                    }
                }
                let meta = table.metatable;
                match self.meta_slot(meta, "__index") {
                    Some(Value::Table(next)) => {
                        self.resolve_get(Value::Table(next), key, depth + 1)
                    }
                    Some(Value::NativeFunction(id)) => {
                        self.call_meta(id, &[Value::Table(href), key])
                    }
                    _ => Ok(Value::Nil),
                }
            }
            Value::UserData(href) => {
                let meta = self
                    .heap
                    .userdata(href)
                    .ok_or(ScriptError::StaleHandle)?
                    .metatable;
                match self.meta_slot(meta, "__index") {
                    Some(Value::NativeFunction(id)) => {
                        self.call_meta(id, &[Value::UserData(href), key])
                    }
                    _ => self.default_property_lookup(href, key),
                }
            }
            other => Err(ScriptError::NotIndexable {
                type_name: other.type_name(),
            }),
        }
    }

    /// The default userdata read: own stored properties first, then the
    /// metatable inheritance chain (each link table's `__index` leads to the
    /// next base metatable).
    pub(crate) fn default_property_lookup(
        &self,
        href: HeapRef,
        key: Value,
    ) -> ScriptResult<Value> {
        let ud = self.heap.userdata(href).ok_or(ScriptError::StaleHandle)?;
        let Some(tk) = TableKey::of(&key) else {
            return Ok(Value::Nil);
        };
        if let Some(v) = ud.props.get(&tk) {
            if !v.is_nil() {
                return Ok(v.clone());
            }
        }
        let mut cursor = ud.metatable;
        let mut depth = 0;
        while let Some(mt) = cursor {
            if depth >= MAX_INDEX_DEPTH {
                return Err(ScriptError::IndexChainTooLong);
            }
            depth += 1;
            let Some(table) = self.heap.table(mt) else {
                break;
            };
            if let Some(v) = table.entries.get(&tk) {
                if !v.is_nil() {
                    return Ok(v.clone());
                }
            }
            cursor = table
                .metatable
                .and_then(|link| self.heap.table(link))
                .and_then(|link| link.entries.get(&TableKey::str("__index")))
                .and_then(|v| match v {
                    Value::Table(next) => Some(*next),
                    _ => None,
                });
        }
        Ok(Value::Nil)
    }

    /// Write `obj[key] = value` with full dispatch.
    ///
    /// Userdata with a `__newindex` function run the class's write shim; an
    /// assignment the custom hook declines raises the unaccepted-assignment
    /// error and stores nothing. Without a write hook the value lands in the
    /// wrapper's own property table, unvalidated. Table writes are raw.
    pub fn set_field(
        &mut self,
        idx: StackIndex,
        key: impl IntoValue,
        value: impl IntoValue,
    ) -> ScriptResult<()> {
        let pos = self.abs_index(idx)?;
        let obj = self.stack[pos].clone();
        let key = key.into_value();
        let value = value.into_value();
        match obj {
            Value::Table(href) => self.raw_set_ref(href, key, value),
            Value::UserData(href) => {
                let meta = self
                    .heap
                    .userdata(href)
                    .ok_or(ScriptError::StaleHandle)?
                    .metatable;
                match self.meta_slot(meta, "__newindex") {
                    Some(Value::NativeFunction(id)) => {
                        self.call_meta(id, &[Value::UserData(href), key, value])?;
                        Ok(())
                    }
                    _ => {
                        let key_type = key.type_name();
                        let Some(tk) = TableKey::of(&key) else {
                            return Err(ScriptError::InvalidKey { type_name: key_type });
                        };
                        let ud = self
                            .heap
                            .userdata_mut(href)
                            .ok_or(ScriptError::StaleHandle)?;
                        if value.is_nil() {
                            ud.props.remove(&tk);
                        } else {
                            ud.props.insert(tk, value);
                        }
                        Ok(())
                    }
                }
            }
            other => Err(ScriptError::NotIndexable {
                type_name: other.type_name(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Globals
    // ------------------------------------------------------------------

    /// Bind a global name.
    pub fn set_global(&mut self, name: &str, value: impl IntoValue) -> ScriptResult<()> {
        self.raw_set_ref(self.globals, name.into_value(), value.into_value())
    }

    /// Push the value of a global name (nil when unbound).
    pub fn get_global(&mut self, name: &str) -> ScriptResult<()> {
        let table = self
            .heap
            .table(self.globals)
            .ok_or(ScriptError::StaleHandle)?;
        let value = table
            .entries
            .get(&TableKey::str(name))
            .cloned()
            .unwrap_or(Value::Nil);
        self.stack.push(value);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    /// Run a full stop-the-world collection pass.
    ///
    /// Roots are the stack, the globals table and the named metatable
    /// registry; the wrapper identity registry is deliberately not a root,
    /// so it never keeps a wrapper alive. Unreachable wrappers get their
    /// metatable's `__gc` finalizer invoked exactly once before their slot
    /// is freed.
    pub fn collect_garbage(&mut self) {
        self.heap.clear_marks();
        let mut work: Vec<HeapRef> = Vec::new();
        work.push(self.globals);
        work.extend(self.metatables.values().copied());
        work.extend(self.stack.iter().filter_map(Value::heap_ref));
        while let Some(href) = work.pop() {
            if self.heap.mark(href) {
                work.extend(self.heap.children(href));
            }
        }
        for href in self.heap.unmarked_userdata() {
            let meta = self.heap.userdata(href).and_then(|ud| ud.metatable);
            if let Some(Value::NativeFunction(id)) = self.meta_slot(meta, "__gc") {
                let saved = self.stack.len();
                self.stack.push(Value::UserData(href));
                // Finalizers are infallible by contract.
                let _ = self.call_native(id, 1);
                self.stack.truncate(saved);
            }
        }
        self.heap.sweep();
    }
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}

impl Drop for State {
    fn drop(&mut self) {
        // Runtime teardown: every still-live wrapper is finalized exactly
        // once, releasing owned references.
        for href in self.heap.all_userdata() {
            self.finalize_userdata(href);
        }
    }
}
