//! The script value model.
//!
//! Values are small and cheap to clone: scalars are inline, strings are
//! shared [`Rc<str>`], and tables, userdata and native functions are handles
//! into runtime-owned storage.

use std::rc::Rc;

use crate::heap::HeapRef;

/// Identifier of a native function registered with a [`State`].
///
/// Native functions live for the lifetime of the runtime instance, so ids
/// are never recycled.
///
/// [`State`]: crate::State
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeFnId(pub(crate) u32);

/// A script-visible value.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    Str(Rc<str>),
    Table(HeapRef),
    UserData(HeapRef),
    NativeFunction(NativeFnId),
}

impl Value {
    /// The value's type name, as surfaced in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
            Value::UserData(_) => "userdata",
            Value::NativeFunction(_) => "function",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// The heap handle behind a table or userdata value.
    pub(crate) fn heap_ref(&self) -> Option<HeapRef> {
        match self {
            Value::Table(href) | Value::UserData(href) => Some(*href),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            // Integers and floats compare numerically, like the runtimes
            // this value model imitates.
            (Value::Integer(a), Value::Number(b)) | (Value::Number(b), Value::Integer(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::UserData(a), Value::UserData(b)) => a == b,
            (Value::NativeFunction(a), Value::NativeFunction(b)) => a == b,
            _ => false,
        }
    }
}

/// The hashable subset of values usable as table keys.
///
/// An integral float normalizes to an integer key; nil, NaN, fractional
/// floats and heap values are not keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    Boolean(bool),
    Integer(i64),
    Str(Rc<str>),
}

impl TableKey {
    /// Normalize a value into a table key, or `None` if it cannot key a
    /// table.
    pub fn of(value: &Value) -> Option<TableKey> {
        match value {
            Value::Boolean(b) => Some(TableKey::Boolean(*b)),
            Value::Integer(i) => Some(TableKey::Integer(*i)),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => {
                Some(TableKey::Integer(*n as i64))
            }
            Value::Str(s) => Some(TableKey::Str(Rc::clone(s))),
            _ => None,
        }
    }

    pub fn str(key: &str) -> TableKey {
        TableKey::Str(Rc::from(key))
    }
}
