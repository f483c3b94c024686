//! Conversion traits between Rust values and script values.
//!
//! - [`IntoValue`]: turn a Rust value into a [`Value`] for pushing
//! - [`FromValue`]: extract a Rust value from a [`Value`] on the stack
//!
//! Narrowing integer extractions are bounds-checked; there is no implicit
//! string/number coercion.

use std::rc::Rc;

use crate::error::ConversionError;
use crate::value::Value;

/// Convert a Rust value into a script value.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

/// Extract a Rust value from a script value.
pub trait FromValue: Sized {
    /// Returns a `ConversionError` if the value holds an incompatible type.
    fn from_value(value: &Value) -> Result<Self, ConversionError>;
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, ConversionError> {
        Ok(value.clone())
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Boolean(self)
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, ConversionError> {
        match value {
            Value::Boolean(b) => Ok(*b),
            other => Err(ConversionError::TypeMismatch {
                expected: "boolean",
                actual: other.type_name(),
            }),
        }
    }
}

// ============================================================================
// Integers
// ============================================================================

macro_rules! impl_int_conversions {
    ($($ty:ty),*) => {
        $(
            impl IntoValue for $ty {
                fn into_value(self) -> Value {
                    Value::Integer(self as i64)
                }
            }

            impl FromValue for $ty {
                fn from_value(value: &Value) -> Result<Self, ConversionError> {
                    match value {
                        Value::Integer(v) => {
                            <$ty>::try_from(*v).map_err(|_| ConversionError::IntegerOverflow {
                                value: *v,
                                target: stringify!($ty),
                            })
                        }
                        other => Err(ConversionError::TypeMismatch {
                            expected: "number",
                            actual: other.type_name(),
                        }),
                    }
                }
            }
        )*
    };
}

impl_int_conversions!(i8, i16, i32, i64, u8, u16, u32);

// ============================================================================
// Floats
// ============================================================================

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::Number(self)
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, ConversionError> {
        match value {
            Value::Number(n) => Ok(*n),
            Value::Integer(i) => Ok(*i as f64),
            other => Err(ConversionError::TypeMismatch {
                expected: "number",
                actual: other.type_name(),
            }),
        }
    }
}

impl IntoValue for f32 {
    fn into_value(self) -> Value {
        Value::Number(self as f64)
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self, ConversionError> {
        f64::from_value(value).map(|n| n as f32)
    }
}

// ============================================================================
// Strings
// ============================================================================

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::Str(Rc::from(self))
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::Str(Rc::from(self.as_str()))
    }
}

impl IntoValue for Rc<str> {
    fn into_value(self) -> Value {
        Value::Str(self)
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, ConversionError> {
        match value {
            Value::Str(s) => Ok(s.to_string()),
            other => Err(ConversionError::TypeMismatch {
                expected: "string",
                actual: other.type_name(),
            }),
        }
    }
}

impl FromValue for Rc<str> {
    fn from_value(value: &Value) -> Result<Self, ConversionError> {
        match value {
            Value::Str(s) => Ok(Rc::clone(s)),
            other => Err(ConversionError::TypeMismatch {
                expected: "string",
                actual: other.type_name(),
            }),
        }
    }
}

// ============================================================================
// Option (nil mapping)
// ============================================================================

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::Nil,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self, ConversionError> {
        match value {
            Value::Nil => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}
