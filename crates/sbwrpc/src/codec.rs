//! # Value Codec
//!
//! Translation between `Value` and the Sbwpack stream.
//!
//! ## Invariants
//! - **Strict Decoding**: `decode_value` is driven by the expected signature. A wire item of
//!   any other kind is a type mismatch, never a conversion.
//! - **Checked Encoding**: `encode_result` and `check_args` refuse values that do not conform
//!   to the declared signature, so nothing malformed reaches the wire.

use crate::error::{Error, Result};
use crate::signature::{Atomic, Element, Signature};
use crate::value::{ArrayValue, Value};

use sbwpack::{Decoder, Encoder, Tag};

// ============================================================================
//  CONFORMANCE
// ============================================================================

fn mismatch(sig: &Signature, value: &Value) -> Error {
    Error::TypeMismatch { expected: sig.to_string(), found: value.signature().to_string() }
}

fn atomic_of(value: &Value) -> Option<Atomic> {
    match value {
        Value::Byte(_) => Some(Atomic::Byte),
        Value::Integer(_) => Some(Atomic::Integer),
        Value::Double(_) => Some(Atomic::Double),
        Value::Boolean(_) => Some(Atomic::Boolean),
        Value::String(_) => Some(Atomic::String),
        Value::Complex(..) => Some(Atomic::Complex),
        Value::Void => Some(Atomic::Void),
        Value::List(_) => Some(Atomic::List),
        Value::Array(_) => None,
    }
}

/// Checks that `value` may be passed where `sig` is declared.
pub fn check(value: &Value, sig: &Signature) -> Result<()> {
    match (sig, value) {
        (Signature::Atomic(a), v) if atomic_of(v) == Some(*a) => Ok(()),
        (Signature::List(elements), Value::List(items)) if elements.len() == items.len() => {
            elements.iter().zip(items).try_for_each(|(e, item)| check(item, &e.ty))
        }
        (Signature::Array { inner, dims }, Value::Array(arr))
            if arr.shape.len() == *dims as usize && arr.element.matches(inner) =>
        {
            arr.items.iter().try_for_each(|item| check(item, inner))
        }
        _ => Err(mismatch(sig, value)),
    }
}

/// Checks an argument vector against a parameter list.
pub fn check_args(args: &[Value], params: &[Element]) -> Result<()> {
    if args.len() != params.len() {
        return Err(Error::TypeMismatch {
            expected: Signature::list(params.to_vec()).to_string(),
            found: describe_args(args),
        });
    }
    params.iter().zip(args).try_for_each(|(p, arg)| check(arg, &p.ty))
}

/// Renders argument types the way a parameter list is written, e.g. `(double, string)`.
pub fn describe_args(args: &[Value]) -> String {
    let types: Vec<String> = args.iter().map(|v| v.signature().to_string()).collect();
    format!("({})", types.join(", "))
}

// ============================================================================
//  ENCODING
// ============================================================================

/// Encodes a value into the encoder stream.
pub fn encode_value(enc: &mut Encoder, value: &Value) -> Result<()> {
    match value {
        Value::Byte(v) => enc.byte(*v)?,
        Value::Integer(v) => enc.integer(*v)?,
        Value::Double(v) => enc.double(*v)?,
        Value::Boolean(v) => enc.boolean(*v)?,
        Value::String(v) => enc.str(v)?,
        Value::Complex(re, im) => enc.complex(*re, *im)?,
        Value::Void => enc.void()?,
        Value::List(items) => {
            enc.list_begin()?;
            for item in items {
                encode_value(enc, item)?;
            }
            enc.list_end()?;
        }
        Value::Array(arr) => {
            enc.array_begin(arr.element.tag(), &arr.shape)?;
            for item in &arr.items {
                encode_value(enc, item)?;
            }
            enc.array_end()?;
        }
    }
    Ok(())
}

/// Encodes a single value as a standalone item.
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    encode_value(&mut enc, value)?;
    Ok(enc.into_bytes()?)
}

/// Encodes a method result after checking it against the declared return type.
pub fn encode_result(value: &Value, returns: &Signature) -> Result<Vec<u8>> {
    check(value, returns)?;
    encode(value)
}

/// Encodes call arguments as a single List item.
pub fn encode_args(args: &[Value]) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    enc.list_begin()?;
    for arg in args {
        encode_value(&mut enc, arg)?;
    }
    enc.list_end()?;
    Ok(enc.into_bytes()?)
}

// ============================================================================
//  DECODING
// ============================================================================

/// Decodes a single value of the expected type.
pub fn decode_value(dec: &mut Decoder, sig: &Signature) -> Result<Value> {
    match sig {
        Signature::Atomic(a) => Ok(match a {
            Atomic::Byte => Value::Byte(dec.byte()?),
            Atomic::Integer => Value::Integer(dec.integer()?),
            Atomic::Double => Value::Double(dec.double()?),
            Atomic::Boolean => Value::Boolean(dec.boolean()?),
            Atomic::String => Value::String(dec.str()?.to_string()),
            Atomic::Void => {
                dec.void()?;
                Value::Void
            }
            Atomic::Complex => {
                let (re, im) = dec.complex()?;
                Value::Complex(re, im)
            }
            Atomic::List => {
                let mut iter = dec.list()?;
                let mut items = Vec::with_capacity(iter.len());
                while let Some(mut item) = iter.next()? {
                    items.push(decode_any(&mut item)?);
                }
                Value::List(items)
            }
        }),

        Signature::List(elements) => {
            let mut iter = dec.list()?;
            if iter.len() != elements.len() {
                return Err(Error::TypeMismatch {
                    expected: sig.to_string(),
                    found: format!("list of {} items", iter.len()),
                });
            }
            let mut items = Vec::with_capacity(elements.len());
            for element in elements {
                let mut item = iter.next()?.ok_or(Error::ProtocolViolation("List too short".into()))?;
                items.push(decode_value(&mut item, &element.ty)?);
            }
            Ok(Value::List(items))
        }

        Signature::Array { inner, dims } => {
            let mut iter = dec.array()?;
            if iter.element() != inner.tag() || iter.shape().len() != *dims as usize {
                return Err(Error::TypeMismatch {
                    expected: sig.to_string(),
                    found: format!("{}{}", iter.element().name(), "[]".repeat(iter.shape().len())),
                });
            }
            let shape = iter.shape().to_vec();
            let mut items = Vec::with_capacity(iter.len());
            while let Some(mut item) = iter.next()? {
                items.push(decode_value(&mut item, inner)?);
            }
            Ok(Value::Array(ArrayValue { element: (**inner).clone(), shape, items }))
        }
    }
}

/// Decodes a single value, taking its type from the wire.
pub fn decode_any(dec: &mut Decoder) -> Result<Value> {
    let value = match dec.peek_tag()? {
        Tag::Byte => Value::Byte(dec.byte()?),
        Tag::Integer => Value::Integer(dec.integer()?),
        Tag::Double => Value::Double(dec.double()?),
        Tag::Boolean => Value::Boolean(dec.boolean()?),
        Tag::String => Value::String(dec.str()?.to_string()),
        Tag::Void => {
            dec.void()?;
            Value::Void
        }
        Tag::Complex => {
            let (re, im) = dec.complex()?;
            Value::Complex(re, im)
        }
        Tag::List => decode_value(dec, &Signature::any_list())?,
        Tag::Array => {
            let mut iter = dec.array()?;
            let element = match iter.element() {
                Tag::Byte => Signature::byte(),
                Tag::Integer => Signature::integer(),
                Tag::Double => Signature::double(),
                Tag::Boolean => Signature::boolean(),
                Tag::String => Signature::string(),
                Tag::Complex => Signature::complex(),
                Tag::List => Signature::any_list(),
                other => return Err(Error::ProtocolViolation(format!("array of {}", other.name()))),
            };
            let shape = iter.shape().to_vec();
            let mut items = Vec::with_capacity(iter.len());
            while let Some(mut item) = iter.next()? {
                items.push(decode_any(&mut item)?);
            }
            Value::Array(ArrayValue { element, shape, items })
        }
    };
    Ok(value)
}

/// Decodes a standalone item of the expected type, rejecting trailing bytes.
pub fn decode(bytes: &[u8], sig: &Signature) -> Result<Value> {
    let mut dec = Decoder::new(bytes);
    let value = decode_value(&mut dec, sig)?;
    dec.finish()?;
    Ok(value)
}

/// Decodes a standalone item whatever its type.
pub fn decode_untyped(bytes: &[u8]) -> Result<Value> {
    let mut dec = Decoder::new(bytes);
    let value = decode_any(&mut dec)?;
    dec.finish()?;
    Ok(value)
}

/// Decodes a method result against the declared return type.
pub fn decode_result(bytes: &[u8], returns: &Signature) -> Result<Value> {
    decode(bytes, returns)
}

/// Decodes call arguments against a parameter list.
pub fn decode_args(bytes: &[u8], params: &[Element]) -> Result<Vec<Value>> {
    let mut dec = Decoder::new(bytes);
    let mut iter = dec.list()?;
    if iter.len() != params.len() {
        return Err(Error::TypeMismatch {
            expected: Signature::list(params.to_vec()).to_string(),
            found: format!("{} arguments", iter.len()),
        });
    }
    let mut args = Vec::with_capacity(params.len());
    for param in params {
        let mut item = iter.next()?.ok_or(Error::ProtocolViolation("Too few arguments".into()))?;
        args.push(decode_value(&mut item, &param.ty)?);
    }
    dec.finish()?;
    Ok(args)
}

/// Decodes call arguments without a parameter list.
pub fn decode_args_untyped(bytes: &[u8]) -> Result<Vec<Value>> {
    let mut dec = Decoder::new(bytes);
    let mut iter = dec.list()?;
    let mut args = Vec::with_capacity(iter.len());
    while let Some(mut item) = iter.next()? {
        args.push(decode_any(&mut item)?);
    }
    dec.finish()?;
    Ok(args)
}
