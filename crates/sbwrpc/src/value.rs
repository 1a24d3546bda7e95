//! # Values
//!
//! Dynamically typed data passed as arguments and results. Every value knows its own
//! signature, so callers can be checked before anything is sent.

use crate::error::{Error, Result};
use crate::signature::{Atomic, Element, Signature};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Integer(i32),
    Double(f64),
    Boolean(bool),
    String(String),
    Complex(f64, f64),
    Array(ArrayValue),
    List(Vec<Value>),
    Void,
}

/// A homogeneous, possibly multi-dimensional block of values stored in row-major order.
///
/// # Invariants
/// - `element` is not an array type.
/// - `shape` has at least one dimension and `items.len() == product(shape)`.
/// - Every item conforms to `element`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    pub(crate) element: Signature,
    pub(crate) shape: Vec<u32>,
    pub(crate) items: Vec<Value>,
}

impl ArrayValue {
    pub fn new(element: Signature, shape: Vec<u32>, items: Vec<Value>) -> Result<Self> {
        if element.is_array() || element.is_void() {
            return Err(Error::TypeMismatch {
                expected: "array element type".into(),
                found: element.to_string(),
            });
        }
        let expected = shape.iter().try_fold(1usize, |acc, &n| acc.checked_mul(n as usize));
        if shape.is_empty() || expected != Some(items.len()) {
            return Err(Error::TypeMismatch {
                expected: format!("{} items for shape {:?}", expected.unwrap_or(0), shape),
                found: format!("{} items", items.len()),
            });
        }
        for item in &items {
            crate::codec::check(item, &element)?;
        }
        Ok(Self { element, shape, items })
    }

    /// A one-dimensional array.
    pub fn vector(element: Signature, items: Vec<Value>) -> Result<Self> {
        let len = u32::try_from(items.len()).map_err(|_| Error::TypeMismatch {
            expected: "at most u32::MAX items".into(),
            found: format!("{} items", items.len()),
        })?;
        Self::new(element, vec![len], items)
    }

    pub fn element(&self) -> &Signature { &self.element }
    pub fn shape(&self) -> &[u32] { &self.shape }
    pub fn items(&self) -> &[Value] { &self.items }
    pub fn into_items(self) -> Vec<Value> { self.items }

    pub fn signature(&self) -> Signature {
        Signature::Array { inner: Box::new(self.element.clone()), dims: self.shape.len() as u32 }
    }
}

impl Value {
    /// The type of this value, as a caller would declare it.
    pub fn signature(&self) -> Signature {
        match self {
            Value::Byte(_) => Signature::byte(),
            Value::Integer(_) => Signature::integer(),
            Value::Double(_) => Signature::double(),
            Value::Boolean(_) => Signature::boolean(),
            Value::String(_) => Signature::string(),
            Value::Complex(..) => Signature::complex(),
            Value::Void => Signature::void(),
            Value::Array(arr) => arr.signature(),
            Value::List(items) => {
                Signature::list(items.iter().map(|v| Element::new(v.signature())).collect())
            }
        }
    }

    /// A one-dimensional array of doubles.
    pub fn doubles(items: impl IntoIterator<Item = f64>) -> Result<Value> {
        let items = items.into_iter().map(Value::Double).collect();
        Ok(Value::Array(ArrayValue::vector(Signature::double(), items)?))
    }

    /// A one-dimensional array of integers.
    pub fn integers(items: impl IntoIterator<Item = i32>) -> Result<Value> {
        let items = items.into_iter().map(Value::Integer).collect();
        Ok(Value::Array(ArrayValue::vector(Signature::integer(), items)?))
    }

    /// A one-dimensional array of strings.
    pub fn strings<S: Into<String>>(items: impl IntoIterator<Item = S>) -> Result<Value> {
        let items = items.into_iter().map(|s| Value::String(s.into())).collect();
        Ok(Value::Array(ArrayValue::vector(Signature::string(), items)?))
    }

    /// A one-dimensional array of lists, typed with the `{}` placeholder.
    pub fn lists(items: impl IntoIterator<Item = Vec<Value>>) -> Result<Value> {
        let items = items.into_iter().map(Value::List).collect();
        Ok(Value::Array(ArrayValue::vector(Signature::any_list(), items)?))
    }

    fn mismatch(&self, expected: Atomic) -> Error {
        Error::TypeMismatch { expected: expected.keyword().into(), found: self.signature().to_string() }
    }

    pub fn as_byte(&self) -> Result<u8> {
        match self { Value::Byte(v) => Ok(*v), _ => Err(self.mismatch(Atomic::Byte)) }
    }

    pub fn as_integer(&self) -> Result<i32> {
        match self { Value::Integer(v) => Ok(*v), _ => Err(self.mismatch(Atomic::Integer)) }
    }

    pub fn as_double(&self) -> Result<f64> {
        match self { Value::Double(v) => Ok(*v), _ => Err(self.mismatch(Atomic::Double)) }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self { Value::Boolean(v) => Ok(*v), _ => Err(self.mismatch(Atomic::Boolean)) }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self { Value::String(v) => Ok(v), _ => Err(self.mismatch(Atomic::String)) }
    }

    pub fn as_complex(&self) -> Result<(f64, f64)> {
        match self { Value::Complex(re, im) => Ok((*re, *im)), _ => Err(self.mismatch(Atomic::Complex)) }
    }

    pub fn as_list(&self) -> Result<&[Value]> {
        match self { Value::List(v) => Ok(v), _ => Err(self.mismatch(Atomic::List)) }
    }

    pub fn as_array(&self) -> Result<&ArrayValue> {
        match self {
            Value::Array(arr) => Ok(arr),
            _ => Err(Error::TypeMismatch { expected: "array".into(), found: self.signature().to_string() }),
        }
    }

    pub fn into_string(self) -> Result<String> {
        match self { Value::String(v) => Ok(v), other => Err(other.mismatch(Atomic::String)) }
    }

    pub fn into_list(self) -> Result<Vec<Value>> {
        match self { Value::List(v) => Ok(v), other => Err(other.mismatch(Atomic::List)) }
    }

    /// The items of a one-dimensional array.
    pub fn into_vector(self) -> Result<Vec<Value>> {
        match self {
            Value::Array(arr) if arr.shape.len() == 1 => Ok(arr.items),
            other => Err(Error::TypeMismatch { expected: "T[]".into(), found: other.signature().to_string() }),
        }
    }
}

impl From<u8> for Value { fn from(v: u8) -> Self { Value::Byte(v) } }
impl From<i32> for Value { fn from(v: i32) -> Self { Value::Integer(v) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Value::Double(v) } }
impl From<bool> for Value { fn from(v: bool) -> Self { Value::Boolean(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Value::String(v.to_string()) } }
impl From<String> for Value { fn from(v: String) -> Self { Value::String(v) } }
impl From<Vec<Value>> for Value { fn from(v: Vec<Value>) -> Self { Value::List(v) } }
impl From<()> for Value { fn from(_: ()) -> Self { Value::Void } }

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Byte(v) => write!(f, "{}b", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{:?}", v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{:?}", v),
            Value::Complex(re, im) => write!(f, "{}{:+}i", re, im),
            Value::Void => f.write_str("void"),
            Value::List(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 { f.write_str(", ")?; }
                    write!(f, "{}", item)?;
                }
                f.write_str("}")
            }
            Value::Array(arr) => {
                f.write_str("[")?;
                for (i, item) in arr.items.iter().enumerate() {
                    if i > 0 { f.write_str(", ")?; }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}
