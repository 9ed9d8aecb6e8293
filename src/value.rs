//! Tagged runtime values manipulated by the interpreter.
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, RuntimeError};
use crate::heap::ObjectRef;
use crate::program::{BaseTypeKind, Class, Type};

/// JVM value types.
///
/// Every slot of the operand stack and of the local variable array holds
/// one of these. Objects and arrays are handles into the heap, the
/// interpreter never owns their storage.
#[derive(Clone)]
pub enum Value {
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Byte(i8),
    Short(i16),
    Char(u16),
    Bool(bool),
    Object(ObjectRef),
    Array(ObjectRef),
    ClassRef(Arc<Class>),
    ReturnAddress(usize),
    Null,
}

/// Tag of a `Value`, without its payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueKind {
    Integer,
    Long,
    Float,
    Double,
    Byte,
    Short,
    Char,
    Bool,
    Object,
    Array,
    ClassRef,
    ReturnAddress,
    Null,
}

impl ValueKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Integer => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Char => "char",
            Self::Bool => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::ClassRef => "class",
            Self::ReturnAddress => "returnAddress",
            Self::Null => "null",
        }
    }
}

impl Value {
    /// Returns the type of the value.
    pub fn t(&self) -> ValueKind {
        match self {
            Self::Integer(_) => ValueKind::Integer,
            Self::Long(_) => ValueKind::Long,
            Self::Float(_) => ValueKind::Float,
            Self::Double(_) => ValueKind::Double,
            Self::Byte(_) => ValueKind::Byte,
            Self::Short(_) => ValueKind::Short,
            Self::Char(_) => ValueKind::Char,
            Self::Bool(_) => ValueKind::Bool,
            Self::Object(_) => ValueKind::Object,
            Self::Array(_) => ValueKind::Array,
            Self::ClassRef(_) => ValueKind::ClassRef,
            Self::ReturnAddress(_) => ValueKind::ReturnAddress,
            Self::Null => ValueKind::Null,
        }
    }

    /// Long and double take two slots and are handled as one unit by the
    /// stack manipulation instructions.
    pub fn is_category_two(&self) -> bool {
        matches!(self, Self::Long(_) | Self::Double(_))
    }

    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            Self::Object(_) | Self::Array(_) | Self::ClassRef(_) | Self::Null
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn mismatch(&self, expected: &'static str) -> RuntimeError {
        RuntimeError::TypeMismatch {
            expected,
            found: self.t().name(),
        }
    }

    /// Up-casts any int-like value (int, byte, short, char, boolean) to an
    /// `i32`.
    pub fn as_int(&self) -> Result<i32> {
        match *self {
            Self::Integer(v) => Ok(v),
            Self::Byte(v) => Ok(v as i32),
            Self::Short(v) => Ok(v as i32),
            Self::Char(v) => Ok(v as i32),
            Self::Bool(v) => Ok(v as i32),
            _ => Err(self.mismatch("int")),
        }
    }

    pub fn as_long(&self) -> Result<i64> {
        match *self {
            Self::Long(v) => Ok(v),
            _ => Err(self.mismatch("long")),
        }
    }

    pub fn as_float(&self) -> Result<f32> {
        match *self {
            Self::Float(v) => Ok(v),
            _ => Err(self.mismatch("float")),
        }
    }

    pub fn as_double(&self) -> Result<f64> {
        match *self {
            Self::Double(v) => Ok(v),
            _ => Err(self.mismatch("double")),
        }
    }

    pub fn as_return_address(&self) -> Result<usize> {
        match *self {
            Self::ReturnAddress(v) => Ok(v),
            _ => Err(self.mismatch("returnAddress")),
        }
    }

    /// Returns the heap handle behind an object or array reference, `None`
    /// for null.
    pub fn as_heap_ref(&self) -> Result<Option<ObjectRef>> {
        match self {
            Self::Object(r) | Self::Array(r) => Ok(Some(*r)),
            Self::Null => Ok(None),
            _ => Err(self.mismatch("reference")),
        }
    }

    /// Checks that the value is some kind of reference and returns it
    /// unchanged.
    pub fn into_reference(self) -> Result<Self> {
        if self.is_reference() || matches!(self, Self::ReturnAddress(_)) {
            Ok(self)
        } else {
            Err(self.mismatch("reference"))
        }
    }

    /// Default value of a field or array element of the given type.
    pub fn default_for(t: &Type) -> Self {
        match t.t {
            BaseTypeKind::Long => Self::Long(0),
            BaseTypeKind::Float => Self::Float(0.0),
            BaseTypeKind::Double => Self::Double(0.0),
            BaseTypeKind::Reference | BaseTypeKind::Array | BaseTypeKind::Void => {
                Self::Null
            }
            _ => Self::Integer(0),
        }
    }

    /// Converts a value popped from the operand stack into what a field,
    /// return slot or argument of type `t` holds. Sub-int types are truncated
    /// like `i2b` and friends, booleans keep only their low bit.
    pub fn coerce_to(self, t: &Type) -> Result<Self> {
        match t.t {
            BaseTypeKind::Int => Ok(Self::Integer(self.as_int()?)),
            BaseTypeKind::Byte => Ok(Self::Integer(int_to_byte(self.as_int()?))),
            BaseTypeKind::Char => Ok(Self::Integer(int_to_char(self.as_int()?))),
            BaseTypeKind::Short => Ok(Self::Integer(int_to_short(self.as_int()?))),
            BaseTypeKind::Boolean => Ok(Self::Integer(self.as_int()? & 1)),
            BaseTypeKind::Long => Ok(Self::Long(self.as_long()?)),
            BaseTypeKind::Float => Ok(Self::Float(self.as_float()?)),
            BaseTypeKind::Double => Ok(Self::Double(self.as_double()?)),
            BaseTypeKind::Reference | BaseTypeKind::Array => self.into_reference(),
            BaseTypeKind::Void => Err(self.mismatch("void")),
        }
    }

    /// Reference equality as used by `if_acmpeq` and friends.
    pub fn same_reference(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Object(a), Self::Object(b)) | (Self::Array(a), Self::Array(b)) => a == b,
            (Self::ClassRef(a), Self::ClassRef(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::Byte(a), Self::Byte(b)) => a == b,
            (Self::Short(a), Self::Short(b)) => a == b,
            (Self::Char(a), Self::Char(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::ReturnAddress(a), Self::ReturnAddress(b)) => a == b,
            _ => self.is_reference() && other.is_reference() && self.same_reference(other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "int({v})"),
            Self::Long(v) => write!(f, "long({v})"),
            Self::Float(v) => write!(f, "float({v})"),
            Self::Double(v) => write!(f, "double({v})"),
            Self::Byte(v) => write!(f, "byte({v})"),
            Self::Short(v) => write!(f, "short({v})"),
            Self::Char(v) => write!(f, "char({v})"),
            Self::Bool(v) => write!(f, "boolean({v})"),
            Self::Object(r) => write!(f, "object(#{})", r.index()),
            Self::Array(r) => write!(f, "array(#{})", r.index()),
            Self::ClassRef(c) => write!(f, "class({})", c.name()),
            Self::ReturnAddress(pc) => write!(f, "returnAddress({pc})"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// Three way comparison of two floating point values where an unordered
/// result (either operand NaN) yields `nan_result`.
pub fn compare_floating<T: PartialOrd>(a: T, b: T, nan_result: i32) -> i32 {
    match a.partial_cmp(&b) {
        Some(std::cmp::Ordering::Greater) => 1,
        Some(std::cmp::Ordering::Equal) => 0,
        Some(std::cmp::Ordering::Less) => -1,
        None => nan_result,
    }
}

/// `i2b`, truncate to 8 bits and sign extend.
pub fn int_to_byte(v: i32) -> i32 {
    (v & 0xff) as u8 as i8 as i32
}

/// `i2c`, truncate to 16 bits and zero extend.
pub fn int_to_char(v: i32) -> i32 {
    v & 0xffff
}

/// `i2s`, truncate to 16 bits and sign extend.
pub fn int_to_short(v: i32) -> i32 {
    (v & 0xffff) as u16 as i16 as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_like_values_up_cast() {
        assert_eq!(Value::Byte(-3).as_int(), Ok(-3));
        assert_eq!(Value::Char(0xffff).as_int(), Ok(0xffff));
        assert_eq!(Value::Bool(true).as_int(), Ok(1));
        assert_eq!(
            Value::Float(1.0).as_int(),
            Err(RuntimeError::TypeMismatch {
                expected: "int",
                found: "float"
            })
        );
    }

    #[test]
    fn categories() {
        assert!(Value::Long(1).is_category_two());
        assert!(Value::Double(1.0).is_category_two());
        assert!(!Value::Integer(1).is_category_two());
        assert!(!Value::Null.is_category_two());
        assert!(Value::Null.is_reference());
    }

    #[test]
    fn nan_comparisons_use_caller_result() {
        assert_eq!(compare_floating(f32::NAN, f32::NAN, -1), -1);
        assert_eq!(compare_floating(f32::NAN, f32::NAN, 1), 1);
        assert_eq!(compare_floating(1.0f64, f64::NAN, 1), 1);
        assert_eq!(compare_floating(2.0f32, 1.0, -1), 1);
        assert_eq!(compare_floating(-0.0f64, 0.0, -1), 0);
    }

    #[test]
    fn coercion_follows_declared_type() {
        let (byte, _) = crate::program::decode_type("B").unwrap();
        let (boolean, _) = crate::program::decode_type("Z").unwrap();
        let (long, _) = crate::program::decode_type("J").unwrap();
        assert_eq!(Value::Integer(0x1ff).coerce_to(&byte), Ok(Value::Integer(-1)));
        assert_eq!(Value::Integer(2).coerce_to(&boolean), Ok(Value::Integer(0)));
        assert_eq!(Value::Long(5).coerce_to(&long), Ok(Value::Long(5)));
        assert!(Value::Integer(5).coerce_to(&long).is_err());
    }

    #[test]
    fn narrowing_masks() {
        assert_eq!(int_to_byte(0x1ff), -1);
        assert_eq!(int_to_byte(0x7f), 127);
        assert_eq!(int_to_char(-1), 0xffff);
        assert_eq!(int_to_short(0x18000), -32768);
        assert_eq!(int_to_short(0x7fff), 0x7fff);
    }
}
